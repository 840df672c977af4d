//! Host-side capture of PRU sample streams.
//!
//! The PRU fills one half of its shared RAM with 8-bit samples while the
//! host drains the other.  A status word at offset 0 says which half is
//! ready; the host copies that half and writes the word back to zero.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │  PRU1 firmware (producer)           │
//! │  fills half, sets status = 1 | 2    │
//! └──────────────┬──────────────────────┘
//!                │ shared RAM @ 0x4A31_0000
//! ═══════════════╪══════════════════════════
//!                │ /dev/mem mmap
//! ┌──────────────▼──────────────────────┐
//! │  DevMemRegion (SharedRegion)        │
//! │    → TraceCollector                 │
//! │    → AccumulationBuffer             │
//! │    → Capture → pruscope-vcd         │
//! └─────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use pruscope_capture::session::{capture_from_hardware, CaptureConfig};
//! use pruscope_protocol::RegionLayout;
//!
//! let capture = capture_from_hardware(RegionLayout::pru_shared(), CaptureConfig::new(4096)).unwrap();
//! println!("{} samples", capture.buffer.into_samples().len());
//! ```
//!
//! Without hardware, [`sim::FakeRegion`] stands in for the mapping:
//!
//! ```
//! use pruscope_capture::session::{CaptureConfig, CaptureSession};
//! use pruscope_capture::sim::{FakeRegion, ProducerMode, TimedProducer};
//! use pruscope_protocol::RegionLayout;
//!
//! let region = FakeRegion::timed(
//!     RegionLayout::pru_shared(),
//!     TimedProducer::new(4000, ProducerMode::Waits),
//! );
//! let capture = CaptureSession::open(region, CaptureConfig::new(4096)).unwrap().run().unwrap();
//! assert_eq!(capture.report.words_copied, 1024);
//! ```

pub mod buffer;
pub mod collector;
pub mod lifecycle;
pub mod region;
pub mod session;
pub mod sim;
pub mod wait;

pub use buffer::{AccumulationBuffer, AlignmentPolicy, ConfigError};
pub use collector::{
    CollectionError, CollectionReport, CollectorConfig, Completion, FinalAckPolicy, OverrunPolicy,
    TraceCollector,
};
pub use lifecycle::{Coprocessor, LifecycleError, RemoteProc, RunningGuard};
pub use region::{DevMemRegion, MapError, SharedRegion};
pub use session::{Capture, CaptureConfig, CaptureReport, CaptureSession, SessionError};
pub use wait::{CancelToken, WaitError, WaitPolicy};
