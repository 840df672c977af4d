//! One capture session, from mapping to teardown.
//!
//! A [`CaptureSession`] owns the region and the buffer.  Configuration is
//! validated in [`CaptureSession::open`], before any collection begins.
//! [`CaptureSession::run`] consumes the session: the region is dropped (and,
//! for [`DevMemRegion`], unmapped) before `run` returns on every path, and
//! the filled buffer moves out inside the [`Capture`].

use crate::buffer::{AccumulationBuffer, AlignmentPolicy, ConfigError};
use crate::collector::{CollectionError, CollectionReport, CollectorConfig, Completion, TraceCollector};
use crate::region::{DevMemRegion, MapError, SharedRegion};
use chrono::{DateTime, Local};
use log::{info, warn};
use pruscope_protocol::{RegionLayout, WORD_BYTES};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid capture configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Map(#[from] MapError),

    #[error("collection failed: {source}")]
    Collection {
        #[source]
        source: CollectionError,
        /// What was collected before the failure, when best-effort output
        /// was requested.
        partial: Option<AccumulationBuffer>,
    },
}

impl SessionError {
    /// Words copied before the failure (zero if collection never began).
    pub fn words_copied(&self) -> usize {
        match self {
            Self::Collection { source, .. } => source.words_copied(),
            Self::Config(_) | Self::Map(_) => 0,
        }
    }

    /// Take the partially filled buffer, if one was kept.
    pub fn into_partial(self) -> Option<AccumulationBuffer> {
        match self {
            Self::Collection { partial, .. } => partial,
            Self::Config(_) | Self::Map(_) => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Configuration
// ═══════════════════════════════════════════════════════════════════════

/// Everything needed to run one capture.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Requested trace size in bytes.
    pub trace_bytes: usize,
    pub alignment: AlignmentPolicy,
    pub collector: CollectorConfig,
    /// Keep the partial buffer on failure so it can still be rendered.
    pub best_effort: bool,
}

impl CaptureConfig {
    /// Page-aligned capture of `trace_bytes` bytes with default collector
    /// settings.
    pub fn new(trace_bytes: usize) -> Self {
        Self {
            trace_bytes,
            alignment: AlignmentPolicy::PageAligned,
            collector: CollectorConfig::default(),
            best_effort: false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Session
// ═══════════════════════════════════════════════════════════════════════

/// A finished capture: the filled buffer plus how collection went.
#[derive(Debug, Clone)]
pub struct Capture {
    pub buffer: AccumulationBuffer,
    pub report: CollectionReport,
    pub layout: RegionLayout,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
}

impl Capture {
    /// Serializable summary of this capture.
    pub fn summary(&self) -> CaptureReport {
        CaptureReport {
            started_at: self.started_at.to_rfc3339(),
            finished_at: self.finished_at.to_rfc3339(),
            base_addr: self.layout.base_addr,
            region_bytes: self.layout.total_bytes,
            half_words: self.layout.half_words(),
            requested_bytes: self.report.requested_words * WORD_BYTES,
            collection: self.report.clone(),
        }
    }

    /// Whether the requested length was a whole number of halves.
    pub fn is_full(&self) -> bool {
        self.report.completion == Completion::Full
    }
}

/// Owns the region and the buffer for one collection run.
pub struct CaptureSession<R: SharedRegion> {
    region: R,
    buffer: AccumulationBuffer,
    collector: TraceCollector,
    requested_words: usize,
    best_effort: bool,
}

impl<R: SharedRegion> CaptureSession<R> {
    /// Validate `config` against `region` and allocate the buffer.
    ///
    /// On error the region is dropped here.
    pub fn open(region: R, config: CaptureConfig) -> Result<Self, SessionError> {
        region.layout().validate().map_err(ConfigError::Layout)?;
        let buffer = AccumulationBuffer::with_capacity_bytes(config.trace_bytes, config.alignment)?;
        let requested_words = buffer.capacity_words();
        Ok(Self {
            region,
            buffer,
            collector: TraceCollector::new(config.collector),
            requested_words,
            best_effort: config.best_effort,
        })
    }

    /// Words this session will collect.
    pub fn requested_words(&self) -> usize {
        self.requested_words
    }

    /// Collect, tear down the region, and hand back the buffer.
    pub fn run(self) -> Result<Capture, SessionError> {
        let Self {
            mut region,
            mut buffer,
            mut collector,
            requested_words,
            best_effort,
        } = self;
        let layout = region.layout();
        let started_at = Local::now();

        info!(
            "Capture session started: {} bytes from {:#x}",
            requested_words * WORD_BYTES,
            layout.base_addr
        );
        let result = collector.collect(&mut region, &mut buffer, requested_words);
        drop(region);
        let finished_at = Local::now();

        match result {
            Ok(report) => {
                info!(
                    "Capture session finished: {} words in {} transfers",
                    report.words_copied, report.transfers
                );
                Ok(Capture {
                    buffer,
                    report,
                    layout,
                    started_at,
                    finished_at,
                })
            }
            Err(source) => {
                warn!(
                    "Capture session failed after {} words: {}",
                    source.words_copied(),
                    source
                );
                let partial = best_effort.then(|| {
                    buffer.truncate_to_filled();
                    buffer
                });
                Err(SessionError::Collection { source, partial })
            }
        }
    }
}

/// Map the PRU shared RAM and run a full session against it.
///
/// Mapping errors surface before any collection begins; the mapping is
/// released before this returns.
pub fn capture_from_hardware(layout: RegionLayout, config: CaptureConfig) -> Result<Capture, SessionError> {
    // Validate before touching /dev/mem.
    crate::buffer::validate_trace_bytes(
        config.trace_bytes,
        config.alignment,
        crate::buffer::page_size(),
    )?;
    let region = DevMemRegion::open(layout)?;
    CaptureSession::open(region, config)?.run()
}

// ═══════════════════════════════════════════════════════════════════════
//  Capture report (save/load)
// ═══════════════════════════════════════════════════════════════════════

/// Machine-readable summary written next to a waveform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureReport {
    /// Wall clock when collection began (RFC 3339).
    pub started_at: String,
    pub finished_at: String,
    pub base_addr: u64,
    pub region_bytes: usize,
    pub half_words: usize,
    pub requested_bytes: usize,
    pub collection: CollectionReport,
}

impl CaptureReport {
    /// Save the report to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }

    /// Load a report from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json).map_err(std::io::Error::other)
    }
}
