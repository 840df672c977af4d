//! Access to the shared memory region.
//!
//! [`SharedRegion`] is the seam between the collector and the hardware.
//! [`DevMemRegion`] maps the PRU shared RAM through `/dev/mem`; tests and
//! the `--simulate` mode bind to [`crate::sim::FakeRegion`] instead.
//!
//! Requires root (or `CAP_SYS_RAWIO`) to open `/dev/mem`.

use log::{debug, info};
use pruscope_protocol::{Half, HandshakeState, RegionLayout, STATUS_IDLE};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use thiserror::Error;

/// Physical memory device.
pub const DEV_MEM: &str = "/dev/mem";

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum MapError {
    #[error("invalid shared region layout: {0}")]
    Layout(pruscope_protocol::LayoutError),

    #[error("region base {addr:#x} is not page-aligned")]
    UnalignedBase { addr: u64 },

    #[error("cannot open {path} (need root or CAP_SYS_RAWIO): {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot map {len} bytes at {addr:#x}: {source}")]
    Mmap {
        addr: u64,
        len: usize,
        #[source]
        source: std::io::Error,
    },
}

// ═══════════════════════════════════════════════════════════════════════
//  Region trait
// ═══════════════════════════════════════════════════════════════════════

/// A mapped region with a status word at offset 0 and two sample halves.
///
/// Accessors take `&mut self`: every access may race the producer, and
/// simulated regions advance their producer on each access.
pub trait SharedRegion {
    /// Geometry of the region.
    fn layout(&self) -> RegionLayout;

    /// Read the status word.
    fn read_status(&mut self) -> u32;

    /// Overwrite the status word.
    fn write_status(&mut self, value: u32);

    /// Copy `dst.len()` words starting at `word_offset` from the region base.
    ///
    /// # Panics
    ///
    /// If the range extends past the end of the region.
    fn read_words(&mut self, word_offset: usize, dst: &mut [u32]);

    /// Read and decode the status word.
    fn state(&mut self) -> HandshakeState {
        HandshakeState::from_word(self.read_status())
    }

    /// Hand the current half back to the producer.
    fn clear_status(&mut self) {
        self.write_status(STATUS_IDLE);
    }

    /// Copy the first `dst.len()` words of `half`.
    fn copy_half(&mut self, half: Half, dst: &mut [u32]) {
        let layout = self.layout();
        assert!(
            dst.len() <= layout.half_words(),
            "copy of {} words exceeds half size of {}",
            dst.len(),
            layout.half_words()
        );
        self.read_words(layout.half_word_offset(half), dst);
    }
}

impl<R: SharedRegion + ?Sized> SharedRegion for &mut R {
    fn layout(&self) -> RegionLayout {
        (**self).layout()
    }

    fn read_status(&mut self) -> u32 {
        (**self).read_status()
    }

    fn write_status(&mut self, value: u32) {
        (**self).write_status(value)
    }

    fn read_words(&mut self, word_offset: usize, dst: &mut [u32]) {
        (**self).read_words(word_offset, dst)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  /dev/mem mapping
// ═══════════════════════════════════════════════════════════════════════

/// The PRU shared RAM mapped read-write into this process.
///
/// The mapping is released exactly once, when the value is dropped.  All
/// accesses are volatile since the PRU writes the region concurrently.
pub struct DevMemRegion {
    ptr: NonNull<u32>,
    layout: RegionLayout,
    // Closed after the unmap in `Drop`.
    _file: File,
}

impl DevMemRegion {
    /// Map the region described by `layout` from `/dev/mem`.
    pub fn open(layout: RegionLayout) -> Result<Self, MapError> {
        Self::open_path(DEV_MEM, layout)
    }

    /// Map the region from an arbitrary device or file.
    ///
    /// `layout.base_addr` is used as the file offset.
    pub fn open_path(path: impl AsRef<Path>, layout: RegionLayout) -> Result<Self, MapError> {
        let path = path.as_ref();
        layout.validate().map_err(MapError::Layout)?;
        if layout.base_addr % crate::buffer::page_size() as u64 != 0 {
            return Err(MapError::UnalignedBase {
                addr: layout.base_addr,
            });
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC)
            .open(path)
            .map_err(|source| MapError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                layout.total_bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                layout.base_addr as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MapError::Mmap {
                addr: layout.base_addr,
                len: layout.total_bytes,
                source: std::io::Error::last_os_error(),
            });
        }
        let ptr = NonNull::new(ptr.cast::<u32>()).ok_or(MapError::Mmap {
            addr: layout.base_addr,
            len: layout.total_bytes,
            source: std::io::Error::other("mmap returned null"),
        })?;

        info!(
            "Mapped {} bytes of shared memory at {:#x} from {}",
            layout.total_bytes,
            layout.base_addr,
            path.display()
        );

        Ok(Self {
            ptr,
            layout,
            _file: file,
        })
    }
}

impl SharedRegion for DevMemRegion {
    fn layout(&self) -> RegionLayout {
        self.layout
    }

    fn read_status(&mut self) -> u32 {
        // Safety: the mapping covers at least one word and lives as long as self.
        unsafe { self.ptr.as_ptr().read_volatile() }
    }

    fn write_status(&mut self, value: u32) {
        unsafe { self.ptr.as_ptr().write_volatile(value) }
    }

    fn read_words(&mut self, word_offset: usize, dst: &mut [u32]) {
        let end = word_offset.saturating_add(dst.len());
        assert!(
            end <= self.layout.total_words(),
            "read of words {word_offset}..{end} past end of {}-word region",
            self.layout.total_words()
        );
        let src = unsafe { self.ptr.as_ptr().add(word_offset) };
        for (i, slot) in dst.iter_mut().enumerate() {
            // Safety: bounds checked above.
            *slot = unsafe { src.add(i).read_volatile() };
        }
    }
}

impl Drop for DevMemRegion {
    fn drop(&mut self) {
        let ret = unsafe {
            libc::munmap(self.ptr.as_ptr().cast::<libc::c_void>(), self.layout.total_bytes)
        };
        if ret != 0 {
            log::warn!(
                "munmap of shared region failed: {}",
                std::io::Error::last_os_error()
            );
        } else {
            debug!("Unmapped shared region at {:#x}", self.layout.base_addr);
        }
    }
}
