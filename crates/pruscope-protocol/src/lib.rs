//! Shared-memory handshake between the PRU sampler and the host collector.
//!
//! This crate defines the layout of the PRU shared RAM region, the status
//! word encoding, and the arithmetic that splits a capture into half-buffer
//! transfers.  It is `no_std`-compatible with zero dependencies so the same
//! definitions can be checked against the firmware side.
//!
//! # Transport
//!
//! The producer (PRU1 firmware) and the consumer (host collector) share one
//! fixed-size region at a fixed physical address:
//!
//! 1. The producer fills the idle half with packed 8-bit samples
//! 2. When a half is full it writes `1` (first half) or `2` (second half)
//!    to the status word at offset 0
//! 3. The consumer spins until the status word is non-zero, copies the
//!    indicated half out, then writes `0` back
//! 4. The producer must not refill a half until the status word is `0`
//!
//! There is no acknowledgment channel back to the producer beyond step 3:
//! correctness rests on the consumer draining a half faster than the
//! producer fills the other one.

#![cfg_attr(not(feature = "std"), no_std)]

use core::fmt;

// ═══════════════════════════════════════════════════════════════════════
//  Hardware layout
// ═══════════════════════════════════════════════════════════════════════

/// Physical address of the PRU shared RAM on the AM335x.
///
/// Mapped by the host through `/dev/mem`.  Must be page-aligned because
/// `mmap` offsets are.
pub const PRU_SHARED_MEM_PHYS_ADDR: u64 = 0x4A31_0000;

/// Total size of the shared region in bytes (12 KB).
pub const PRU_SHARED_MEM_SIZE: usize = 12_288;

/// Bytes reserved at the start of the region before sample data.
///
/// Only the first word carries the status flag; the rest is reserved.
pub const HEADER_RESERVE_BYTES: usize = 32;

/// Size of one shared-memory word in bytes.
pub const WORD_BYTES: usize = 4;

/// Samples packed into one word.  The producer stores one 8-bit sample
/// per byte, so a word holds four consecutive samples.
pub const SAMPLES_PER_WORD: usize = WORD_BYTES;

/// Size of one ping-pong half in bytes.
pub const HALF_BUFFER_BYTES: usize = (PRU_SHARED_MEM_SIZE - HEADER_RESERVE_BYTES) / 2;

/// Size of one ping-pong half in words (1532).
pub const HALF_BUFFER_WORDS: usize = HALF_BUFFER_BYTES / WORD_BYTES;

const _: () = assert!(PRU_SHARED_MEM_PHYS_ADDR % 4096 == 0);
const _: () = assert!(HEADER_RESERVE_BYTES % WORD_BYTES == 0);
const _: () = assert!((PRU_SHARED_MEM_SIZE - HEADER_RESERVE_BYTES) % (2 * WORD_BYTES) == 0);
const _: () = assert!(HALF_BUFFER_WORDS == 1532);
const _: () = assert!(HEADER_RESERVE_BYTES + 2 * HALF_BUFFER_BYTES == PRU_SHARED_MEM_SIZE);

// ═══════════════════════════════════════════════════════════════════════
//  Status word
// ═══════════════════════════════════════════════════════════════════════

/// Status word value: no half is ready.
pub const STATUS_IDLE: u32 = 0;

/// Status word value: the first half is full and may be read.
pub const STATUS_FIRST_READY: u32 = 1;

/// Status word value: the second half is full and may be read.
pub const STATUS_SECOND_READY: u32 = 2;

/// One of the two ping-pong halves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Half {
    First,
    Second,
}

impl Half {
    /// The status word value that announces this half.
    pub const fn flag(self) -> u32 {
        match self {
            Self::First => STATUS_FIRST_READY,
            Self::Second => STATUS_SECOND_READY,
        }
    }

    /// The other half.
    pub const fn other(self) -> Self {
        match self {
            Self::First => Self::Second,
            Self::Second => Self::First,
        }
    }
}

impl fmt::Display for Half {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::First => f.write_str("first"),
            Self::Second => f.write_str("second"),
        }
    }
}

/// Decoded status word.
///
/// Every value the consumer can observe maps to exactly one state, so the
/// collector's transitions are a plain `match` over this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Producer is filling; nothing to read.
    Idle,
    /// The given half is full and owned by the consumer until cleared.
    HalfReady(Half),
    /// The status word holds a value outside `{0, 1, 2}`.
    Violated(u32),
}

impl HandshakeState {
    /// Decode a raw status word.
    pub const fn from_word(word: u32) -> Self {
        match word {
            STATUS_IDLE => Self::Idle,
            STATUS_FIRST_READY => Self::HalfReady(Half::First),
            STATUS_SECOND_READY => Self::HalfReady(Half::Second),
            other => Self::Violated(other),
        }
    }

    /// The raw status word this state was decoded from.
    pub const fn word(self) -> u32 {
        match self {
            Self::Idle => STATUS_IDLE,
            Self::HalfReady(half) => half.flag(),
            Self::Violated(word) => word,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Region layout
// ═══════════════════════════════════════════════════════════════════════

/// Why a [`RegionLayout`] was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    /// Header reserve is zero or not a whole number of words.
    MisalignedHeader { header_bytes: usize },
    /// Header leaves no room for sample data.
    HeaderTooLarge { header_bytes: usize, total_bytes: usize },
    /// Payload cannot be split into two equal, word-aligned halves.
    UnevenHalves { payload_bytes: usize },
}

impl fmt::Display for LayoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MisalignedHeader { header_bytes } => write!(
                f,
                "header reserve of {header_bytes} bytes is not a non-zero multiple of {WORD_BYTES}"
            ),
            Self::HeaderTooLarge {
                header_bytes,
                total_bytes,
            } => write!(
                f,
                "header reserve of {header_bytes} bytes leaves no payload in a {total_bytes}-byte region"
            ),
            Self::UnevenHalves { payload_bytes } => write!(
                f,
                "payload of {payload_bytes} bytes does not split into two word-aligned halves"
            ),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for LayoutError {}

/// Geometry of a shared region: where it lives and how it is carved up.
///
/// ```text
/// Offset            Size          Field
/// ──────            ────          ─────────────
/// 0                 4             status word   ← 0 / 1 / 2
/// 4                 header − 4    (reserved)
/// header            half          first half    ← "ping"
/// header + half     half          second half   ← "pong"
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    /// Physical base address (only meaningful for real hardware).
    pub base_addr: u64,
    /// Total region size in bytes.
    pub total_bytes: usize,
    /// Bytes before the first half.
    pub header_bytes: usize,
}

impl RegionLayout {
    /// Layout of the AM335x PRU shared RAM.
    pub const fn pru_shared() -> Self {
        Self {
            base_addr: PRU_SHARED_MEM_PHYS_ADDR,
            total_bytes: PRU_SHARED_MEM_SIZE,
            header_bytes: HEADER_RESERVE_BYTES,
        }
    }

    /// Build and validate a layout.
    pub const fn new(
        base_addr: u64,
        total_bytes: usize,
        header_bytes: usize,
    ) -> Result<Self, LayoutError> {
        let layout = Self {
            base_addr,
            total_bytes,
            header_bytes,
        };
        match layout.validate() {
            Ok(()) => Ok(layout),
            Err(e) => Err(e),
        }
    }

    /// Check the layout invariants.
    pub const fn validate(&self) -> Result<(), LayoutError> {
        if self.header_bytes == 0 || self.header_bytes % WORD_BYTES != 0 {
            return Err(LayoutError::MisalignedHeader {
                header_bytes: self.header_bytes,
            });
        }
        if self.header_bytes >= self.total_bytes {
            return Err(LayoutError::HeaderTooLarge {
                header_bytes: self.header_bytes,
                total_bytes: self.total_bytes,
            });
        }
        let payload_bytes = self.total_bytes - self.header_bytes;
        if payload_bytes % (2 * WORD_BYTES) != 0 {
            return Err(LayoutError::UnevenHalves { payload_bytes });
        }
        Ok(())
    }

    /// Total region size in words.
    pub const fn total_words(&self) -> usize {
        self.total_bytes / WORD_BYTES
    }

    /// Header reserve in words; sample data begins at this word index.
    pub const fn header_words(&self) -> usize {
        self.header_bytes / WORD_BYTES
    }

    /// Size of one half in bytes.
    pub const fn half_bytes(&self) -> usize {
        (self.total_bytes - self.header_bytes) / 2
    }

    /// Size of one half in words.
    pub const fn half_words(&self) -> usize {
        self.half_bytes() / WORD_BYTES
    }

    /// Word index (from the region base) where `half` begins.
    pub const fn half_word_offset(&self, half: Half) -> usize {
        match half {
            Half::First => self.header_words(),
            Half::Second => self.header_words() + self.half_words(),
        }
    }
}

impl Default for RegionLayout {
    fn default() -> Self {
        Self::pru_shared()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Transfer planning
// ═══════════════════════════════════════════════════════════════════════

/// How many words the next half transfer copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlan {
    /// Words to copy from the ready half.
    pub take: usize,
    /// Words of the ready half that will not be copied.  Non-zero only on
    /// a clamped final transfer.
    pub discarded: usize,
}

impl TransferPlan {
    /// Whether this transfer was clamped to fit the requested length.
    pub const fn is_clamped(&self) -> bool {
        self.discarded != 0
    }
}

/// Plan the transfer starting at word `offset` of a `requested`-word capture.
///
/// A full half is taken unless it would run past `requested`, in which case
/// the take is clamped to the remainder.  Returns `None` once the capture is
/// complete.
pub const fn plan_transfer(offset: usize, requested: usize, half_words: usize) -> Option<TransferPlan> {
    if offset >= requested || half_words == 0 {
        return None;
    }
    let remaining = requested - offset;
    if remaining >= half_words {
        Some(TransferPlan {
            take: half_words,
            discarded: 0,
        })
    } else {
        Some(TransferPlan {
            take: remaining,
            discarded: half_words - remaining,
        })
    }
}

/// Number of half transfers needed for a `requested`-word capture.
pub const fn transfer_count(requested: usize, half_words: usize) -> usize {
    if half_words == 0 {
        return 0;
    }
    requested.div_ceil(half_words)
}
