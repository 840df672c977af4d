//! Turning a sample buffer into a [`WaveformDocument`].

use crate::document::WaveformDocument;
use chrono::Local;
use log::debug;
use thiserror::Error;

/// Producer sampling period: 7 instructions at 200 MHz.
pub const DEFAULT_SAMPLING_INTERVAL_NS: u64 = 35;

/// Written to the `$version` section unless overridden.
pub const DEFAULT_VERSION: &str = concat!("pruscope VCD generator ", env!("CARGO_PKG_VERSION"));

/// `strftime`-style format of the `$date` section.
pub const DATE_FORMAT: &str = "%c";

#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("no samples to encode")]
    EmptyInput,

    #[error("sampling interval must be greater than zero")]
    ZeroInterval,

    #[error("{samples} samples at {interval} ns overflow a 64-bit timestamp")]
    TimestampOverflow { samples: usize, interval: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to do with an empty sample buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmptyPolicy {
    /// Fail with [`EncodeError::EmptyInput`].
    #[default]
    Reject,
    /// Emit the header and an empty data block.
    HeaderOnly,
}

/// Encoder settings.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Nanoseconds between samples.
    pub sampling_interval: u64,
    pub empty: EmptyPolicy,
    /// Tool identifier for the `$version` section.
    pub version: String,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            sampling_interval: DEFAULT_SAMPLING_INTERVAL_NS,
            empty: EmptyPolicy::default(),
            version: DEFAULT_VERSION.to_string(),
        }
    }
}

impl EncoderConfig {
    /// Default settings at a custom sampling interval.
    pub fn with_interval(sampling_interval: u64) -> Self {
        Self {
            sampling_interval,
            ..Self::default()
        }
    }
}

/// Builds waveform documents from captured samples.
///
/// # Example
///
/// ```
/// use pruscope_vcd::{EncoderConfig, WaveformEncoder};
///
/// let encoder = WaveformEncoder::new(EncoderConfig::with_interval(5)).with_date("today");
/// let doc = encoder.encode(vec![0b1011_0010, 0x00, 0xFF]).unwrap();
/// let text = doc.to_string();
/// assert!(text.contains("#10\nb11111111 B\n"));
/// ```
#[derive(Debug, Clone, Default)]
pub struct WaveformEncoder {
    config: EncoderConfig,
    date: Option<String>,
}

impl WaveformEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config, date: None }
    }

    /// Use a fixed `$date` text instead of the local time at encode.
    pub fn with_date(mut self, date: impl Into<String>) -> Self {
        self.date = Some(date.into());
        self
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Encode `samples`, one record per byte, in order.
    ///
    /// Accepts anything that converts into a byte vector, including a
    /// capture buffer moved out of a finished session.
    pub fn encode(&self, samples: impl Into<Vec<u8>>) -> Result<WaveformDocument, EncodeError> {
        let samples = samples.into();
        let interval = self.config.sampling_interval;

        if samples.is_empty() && self.config.empty == EmptyPolicy::Reject {
            return Err(EncodeError::EmptyInput);
        }
        if interval == 0 {
            return Err(EncodeError::ZeroInterval);
        }
        let last_index = samples.len().saturating_sub(1) as u64;
        if interval.checked_mul(last_index).is_none() {
            return Err(EncodeError::TimestampOverflow {
                samples: samples.len(),
                interval,
            });
        }

        let date = match &self.date {
            Some(date) => date.clone(),
            None => Local::now().format(DATE_FORMAT).to_string(),
        };
        debug!("Encoded {} samples at {} ns", samples.len(), interval);

        Ok(WaveformDocument {
            date,
            version: self.config.version.clone(),
            interval,
            samples,
        })
    }
}
