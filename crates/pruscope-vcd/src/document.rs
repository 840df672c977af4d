//! The rendered waveform and its VCD text form.

use crate::encoder::EncodeError;
use log::info;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// Identifier of the single 8-bit bus.
pub const SIGNAL_ID: &str = "B";

/// Name of the bus as shown in waveform viewers.
pub const SIGNAL_NAME: &str = "signal_in";

/// Bus width in bits.
pub const SIGNAL_WIDTH: u32 = 8;

/// One sample on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueChange {
    /// Nanoseconds from the first sample.
    pub time: u64,
    pub value: u8,
}

/// An encoded waveform: samples on a fixed time grid plus header metadata.
///
/// Built by [`crate::WaveformEncoder::encode`], which guarantees that the
/// last timestamp fits in a `u64` and that the interval is non-zero, so
/// record times are strictly increasing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveformDocument {
    pub(crate) date: String,
    pub(crate) version: String,
    pub(crate) interval: u64,
    pub(crate) samples: Vec<u8>,
}

impl WaveformDocument {
    /// Nanoseconds between consecutive samples.
    pub fn sampling_interval(&self) -> u64 {
        self.interval
    }

    /// Text of the `$date` section.
    pub fn date(&self) -> &str {
        &self.date
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Number of records (one per sample).
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn samples(&self) -> &[u8] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<u8> {
        self.samples
    }

    /// Records in time order.
    pub fn records(&self) -> impl ExactSizeIterator<Item = ValueChange> + '_ {
        let interval = self.interval;
        self.samples
            .iter()
            .enumerate()
            .map(move |(i, &value)| ValueChange {
                time: interval * i as u64,
                value,
            })
    }

    /// Render the whole document to bytes.
    pub fn serialize(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Stream the document into `sink`.
    pub fn write_to<W: Write>(&self, sink: W) -> Result<(), EncodeError> {
        let mut out = BufWriter::new(sink);
        write!(out, "{self}")?;
        out.flush()?;
        Ok(())
    }

    /// Write the document to a file, replacing it if present.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), EncodeError> {
        let path = path.as_ref();
        self.write_to(File::create(path)?)?;
        info!("Wrote {} samples to {}", self.len(), path.display());
        Ok(())
    }

    fn fmt_header(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "$date")?;
        writeln!(f, "   {}", self.date)?;
        writeln!(f, "$end")?;
        writeln!(f, "$version")?;
        writeln!(f, "   {}", self.version)?;
        writeln!(f, "$end")?;
        writeln!(f, "$timescale 1ns $end")?;
        writeln!(f)?;
        writeln!(f, "$scope module top $end")?;
        writeln!(f)?;
        writeln!(f, "$var wire {SIGNAL_WIDTH} {SIGNAL_ID} {SIGNAL_NAME} $end")?;
        writeln!(f)?;
        writeln!(f, "$upscope $end")?;
        writeln!(f, "$enddefinitions $end")?;
        writeln!(f)
    }
}

impl fmt::Display for WaveformDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_header(f)?;

        let mut records = self.records();
        let Some(first) = records.next() else {
            return Ok(());
        };

        // Initial value goes in a $dumpvars block at time zero
        writeln!(f, "#{}", first.time)?;
        writeln!(f, "$dumpvars")?;
        writeln!(f, "b{:08b} {SIGNAL_ID}", first.value)?;
        writeln!(f, "$end")?;
        writeln!(f)?;

        for record in records {
            writeln!(f, "#{}", record.time)?;
            writeln!(f, "b{:08b} {SIGNAL_ID}", record.value)?;
            writeln!(f)?;
        }
        Ok(())
    }
}
