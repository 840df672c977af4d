//! Value Change Dump output for 8-bit PRU sample streams.
//!
//! Each captured byte becomes one value change on a single 8-bit bus,
//! spaced by a fixed sampling interval (35 ns by default, the producer's
//! loop period).  The output opens in GTKWave or any other VCD viewer.
//!
//! ```text
//! $var wire 8 B signal_in $end
//! ...
//! #0
//! $dumpvars
//! b10110010 B
//! $end
//!
//! #35
//! b00000000 B
//! ```
//!
//! # Usage
//!
//! ```no_run
//! use pruscope_vcd::{EncoderConfig, WaveformEncoder};
//!
//! let samples = std::fs::read("capture.raw").unwrap();
//! let doc = WaveformEncoder::new(EncoderConfig::default()).encode(samples).unwrap();
//! doc.save("capture.vcd").unwrap();
//! ```

pub mod document;
pub mod encoder;
pub mod parse;

pub use document::{ValueChange, WaveformDocument};
pub use encoder::{EmptyPolicy, EncodeError, EncoderConfig, WaveformEncoder};
pub use parse::{parse_changes, parse_samples, ParseError};
