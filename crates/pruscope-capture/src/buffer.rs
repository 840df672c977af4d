//! Host-side accumulation buffer for a capture.
//!
//! [`AccumulationBuffer`] is sized once from the requested trace length and
//! filled front to back by the collector, one half transfer at a time.  It
//! is handed to the encoder by value once collection is over.

use pruscope_protocol::WORD_BYTES;
use thiserror::Error;

/// Fallback when `sysconf(_SC_PAGESIZE)` is unavailable.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Upper bound on a single capture (256 MB).
///
/// The PRU fills a half roughly every 30 µs, so this is already far past
/// anything a viewer will open.
pub const MAX_TRACE_BYTES: usize = 256 * 1024 * 1024;

/// Errors from validating a requested trace size.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("requested trace size must be greater than zero")]
    ZeroSize,

    #[error("requested trace size {bytes} is smaller than one page ({page_size} bytes)")]
    BelowOnePage { bytes: usize, page_size: usize },

    #[error("requested trace size {bytes} is not a multiple of the page size ({page_size} bytes)")]
    Misaligned { bytes: usize, page_size: usize },

    #[error("requested trace size {bytes} is not a whole number of 4-byte words")]
    PartialWord { bytes: usize },

    #[error("requested trace size {bytes} exceeds the {max}-byte limit")]
    TooLarge { bytes: usize, max: usize },

    #[error("invalid shared region layout: {0}")]
    Layout(pruscope_protocol::LayoutError),
}

/// How strictly the requested trace size is checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AlignmentPolicy {
    /// At least one page and a whole number of pages.
    #[default]
    PageAligned,
    /// Any non-zero whole number of words.
    WordAligned,
}

/// Platform page size in bytes.
pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        DEFAULT_PAGE_SIZE
    }
}

/// Validate a requested trace size in bytes and return it in words.
pub fn validate_trace_bytes(
    bytes: usize,
    policy: AlignmentPolicy,
    page_size: usize,
) -> Result<usize, ConfigError> {
    if bytes == 0 {
        return Err(ConfigError::ZeroSize);
    }
    if bytes > MAX_TRACE_BYTES {
        return Err(ConfigError::TooLarge {
            bytes,
            max: MAX_TRACE_BYTES,
        });
    }
    if policy == AlignmentPolicy::PageAligned {
        if bytes < page_size {
            return Err(ConfigError::BelowOnePage { bytes, page_size });
        }
        if bytes % page_size != 0 {
            return Err(ConfigError::Misaligned { bytes, page_size });
        }
    }
    if bytes % WORD_BYTES != 0 {
        return Err(ConfigError::PartialWord { bytes });
    }
    Ok(bytes / WORD_BYTES)
}

/// Attempted to write past the end of an [`AccumulationBuffer`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("write of {len} words at offset {offset} exceeds capacity of {capacity} words")]
pub struct CapacityExceeded {
    pub offset: usize,
    pub len: usize,
    pub capacity: usize,
}

/// Growable-at-construction word buffer that receives half transfers.
///
/// The write offset only moves forward and never passes the capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccumulationBuffer {
    words: Vec<u32>,
    filled: usize,
}

impl AccumulationBuffer {
    /// Allocate a buffer for a trace of `bytes` bytes, validated against
    /// the platform page size.
    pub fn with_capacity_bytes(bytes: usize, policy: AlignmentPolicy) -> Result<Self, ConfigError> {
        let words = validate_trace_bytes(bytes, policy, page_size())?;
        Ok(Self::with_capacity_words(words))
    }

    /// Allocate a zeroed buffer of exactly `words` words.
    pub fn with_capacity_words(words: usize) -> Self {
        Self {
            words: vec![0; words],
            filled: 0,
        }
    }

    /// Capacity in words.
    pub fn capacity_words(&self) -> usize {
        self.words.len()
    }

    /// Capacity in bytes.
    pub fn capacity_bytes(&self) -> usize {
        self.words.len() * WORD_BYTES
    }

    /// Current write offset in words.
    pub fn filled_words(&self) -> usize {
        self.filled
    }

    /// Whether nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Whether the buffer has been filled to capacity.
    pub fn is_full(&self) -> bool {
        self.filled == self.words.len()
    }

    /// The filled prefix.
    pub fn words(&self) -> &[u32] {
        &self.words[..self.filled]
    }

    /// Reserve the next `len` words, let `fill` write them, then advance
    /// the write offset.
    pub fn append_with<F>(&mut self, len: usize, fill: F) -> Result<(), CapacityExceeded>
    where
        F: FnOnce(&mut [u32]),
    {
        let end = self
            .filled
            .checked_add(len)
            .filter(|&end| end <= self.words.len())
            .ok_or(CapacityExceeded {
                offset: self.filled,
                len,
                capacity: self.words.len(),
            })?;
        fill(&mut self.words[self.filled..end]);
        self.filled = end;
        Ok(())
    }

    /// Drop the unfilled tail so capacity equals what was collected.
    pub fn truncate_to_filled(&mut self) {
        self.words.truncate(self.filled);
        self.words.shrink_to_fit();
    }

    /// The filled prefix as 8-bit samples, in capture order.
    pub fn samples(&self) -> impl Iterator<Item = u8> + '_ {
        self.words().iter().flat_map(|w| w.to_le_bytes())
    }

    /// Consume the buffer, returning the filled prefix as samples.
    pub fn into_samples(self) -> Vec<u8> {
        self.samples().collect()
    }
}

impl From<AccumulationBuffer> for Vec<u8> {
    fn from(buffer: AccumulationBuffer) -> Self {
        buffer.into_samples()
    }
}
