//! Ping-pong trace collector.
//!
//! [`TraceCollector`] drains half-buffer transfers out of a
//! [`SharedRegion`] into an [`AccumulationBuffer`] until the requested
//! number of words has been copied.  Each transfer is:
//!
//! ```text
//!   wait ──► status ∈ {1,2} ──► copy half ──► re-check status ──► clear ──┐
//!    ▲                                                                    │
//!    └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The final transfer is clamped when the requested length is not a whole
//! number of halves.  Whether the flag is cleared after a clamped transfer
//! is a [`FinalAckPolicy`]; whether a clamped transfer counts as success is
//! an [`OverrunPolicy`].

use crate::buffer::{AccumulationBuffer, CapacityExceeded};
use crate::region::SharedRegion;
use crate::wait::{wait_for_status, WaitError, WaitPolicy};
use log::{debug, info, trace, warn};
use pruscope_protocol::{plan_transfer, Half, HandshakeState};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{fence, Ordering};
use std::time::Duration;
use thiserror::Error;

// ═══════════════════════════════════════════════════════════════════════
//  Error type
// ═══════════════════════════════════════════════════════════════════════

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectionError {
    #[error("requested length must be greater than zero")]
    EmptyRequest,

    #[error("buffer holds {capacity} words but {requested} were requested")]
    BufferTooSmall { requested: usize, capacity: usize },

    #[error("collector already ran; start a new session")]
    SessionReused,

    #[error("status word held {word:#x} after {words_copied} words (expected 0, 1 or 2)")]
    ProtocolViolation { word: u32, words_copied: usize },

    #[error(
        "final transfer truncated: {discarded_words} words of the {half} half discarded \
         after {words_copied} of {requested_words} words"
    )]
    Overrun {
        half: Half,
        requested_words: usize,
        words_copied: usize,
        discarded_words: usize,
    },

    #[error("producer did not publish a half within {limit:?} after {words_copied} words")]
    Timeout { limit: Duration, words_copied: usize },

    #[error("collection cancelled after {words_copied} words")]
    Cancelled { words_copied: usize },

    #[error(
        "producer outran the collector after {words_copied} words: expected the {expected} \
         half, status word was {observed:#x}"
    )]
    TimingViolation {
        expected: Half,
        observed: u32,
        words_copied: usize,
    },

    #[error("write past end of buffer after {words_copied} words: {source}")]
    Capacity {
        words_copied: usize,
        source: CapacityExceeded,
    },
}

impl CollectionError {
    /// Words copied into the buffer before the failure.
    pub fn words_copied(&self) -> usize {
        match self {
            Self::EmptyRequest | Self::BufferTooSmall { .. } | Self::SessionReused => 0,
            Self::ProtocolViolation { words_copied, .. }
            | Self::Overrun { words_copied, .. }
            | Self::Timeout { words_copied, .. }
            | Self::Cancelled { words_copied }
            | Self::TimingViolation { words_copied, .. }
            | Self::Capacity { words_copied, .. } => *words_copied,
        }
    }

    fn from_wait(err: WaitError, words_copied: usize) -> Self {
        match err {
            WaitError::Timeout { limit, .. } => Self::Timeout {
                limit,
                words_copied,
            },
            WaitError::Cancelled { .. } => Self::Cancelled { words_copied },
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Collector configuration
// ═══════════════════════════════════════════════════════════════════════

/// Whether a clamped final transfer clears the status word.
///
/// The producer is normally stopped once a capture ends, so by default the
/// flag is left as the producer set it.  `Acknowledge` clears it like every
/// other transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FinalAckPolicy {
    #[default]
    LeaveRaised,
    Acknowledge,
}

/// Whether a clamped final transfer is a successful outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverrunPolicy {
    /// Report [`Completion::Truncated`] and succeed.
    #[default]
    Accept,
    /// Fail with [`CollectionError::Overrun`].  The data is still copied.
    Reject,
}

/// Configuration for the trace collector.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// How long to wait for each half.
    pub wait: WaitPolicy,
    pub final_ack: FinalAckPolicy,
    pub overrun: OverrunPolicy,
    /// Re-read the status word after each copy and require the halves to
    /// alternate, so a producer that outruns the collector is reported
    /// instead of silently dropping a half.
    pub verify_timing: bool,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            wait: WaitPolicy::spin(),
            final_ack: FinalAckPolicy::default(),
            overrun: OverrunPolicy::default(),
            verify_timing: true,
        }
    }
}

impl CollectorConfig {
    /// Spin with a per-half timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            wait: WaitPolicy::with_timeout(timeout),
            ..Self::default()
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Session state and report
// ═══════════════════════════════════════════════════════════════════════

/// How a successful collection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Completion {
    /// The requested length was a whole number of halves.
    Full,
    /// The final half was only partly copied.
    Truncated {
        discarded_words: usize,
        /// Whether the final flag was cleared.
        acknowledged: bool,
    },
}

/// Summary of a finished collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionReport {
    pub requested_words: usize,
    pub words_copied: usize,
    pub transfers: usize,
    pub completion: Completion,
}

/// Mutable collector state for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceSession {
    /// Words copied so far.
    pub words_copied: usize,
    /// Half transfers performed so far.
    pub transfers: usize,
    /// Last half copied, for the alternation check.
    pub last_half: Option<Half>,
    started: bool,
    complete: bool,
}

impl TraceSession {
    /// Whether collection reached its end.  Set once, never cleared.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    fn mark_complete(&mut self) {
        debug_assert!(!self.complete, "completion flag set twice");
        self.complete = true;
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Collector
// ═══════════════════════════════════════════════════════════════════════

/// Drives the status-word handshake for one capture.
///
/// # Example
///
/// ```
/// use pruscope_capture::buffer::AccumulationBuffer;
/// use pruscope_capture::collector::{CollectorConfig, Completion, TraceCollector};
/// use pruscope_capture::sim::FakeRegion;
///
/// let mut region = FakeRegion::scripted(FakeRegion::small_layout(), FakeRegion::alternating(2));
/// let mut buffer = AccumulationBuffer::with_capacity_words(8);
///
/// let mut collector = TraceCollector::new(CollectorConfig::default());
/// let report = collector.collect(&mut region, &mut buffer, 8).unwrap();
/// assert_eq!(report.transfers, 2);
/// assert_eq!(report.completion, Completion::Full);
/// ```
#[derive(Debug, Clone)]
pub struct TraceCollector {
    config: CollectorConfig,
    session: TraceSession,
}

impl TraceCollector {
    pub fn new(config: CollectorConfig) -> Self {
        Self {
            config,
            session: TraceSession::default(),
        }
    }

    /// Collector state so far.
    pub fn session(&self) -> &TraceSession {
        &self.session
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Copy `requested_words` words out of `region` into `target`.
    ///
    /// Blocks until the producer has published enough halves or the wait
    /// policy gives up.  `target` keeps whatever was copied on failure.
    /// Does not unmap the region.
    pub fn collect<R: SharedRegion + ?Sized>(
        &mut self,
        region: &mut R,
        target: &mut AccumulationBuffer,
        requested_words: usize,
    ) -> Result<CollectionReport, CollectionError> {
        if self.session.started {
            return Err(CollectionError::SessionReused);
        }
        if requested_words == 0 {
            return Err(CollectionError::EmptyRequest);
        }
        let capacity = target.capacity_words() - target.filled_words();
        if capacity < requested_words {
            return Err(CollectionError::BufferTooSmall {
                requested: requested_words,
                capacity,
            });
        }
        self.session.started = true;

        let half_words = region.layout().half_words();
        info!(
            "Collecting {} words in halves of {} words",
            requested_words, half_words
        );

        let mut completion = Completion::Full;
        while let Some(plan) = plan_transfer(self.session.words_copied, requested_words, half_words)
        {
            let words_copied = self.session.words_copied;
            let word = wait_for_status(region, &self.config.wait)
                .map_err(|e| CollectionError::from_wait(e, words_copied))?;

            let half = match HandshakeState::from_word(word) {
                HandshakeState::HalfReady(half) => half,
                HandshakeState::Idle => continue,
                HandshakeState::Violated(word) => {
                    warn!(
                        "Status word {:#x} outside protocol after {} words",
                        word, words_copied
                    );
                    return Err(CollectionError::ProtocolViolation { word, words_copied });
                }
            };
            trace!("Idle -> HalfReady({half})");

            if self.config.verify_timing && self.session.last_half == Some(half) {
                warn!("The {} half was published twice in a row", half);
                return Err(CollectionError::TimingViolation {
                    expected: half.other(),
                    observed: word,
                    words_copied,
                });
            }

            // Half contents must not be read before the flag.
            fence(Ordering::Acquire);
            target
                .append_with(plan.take, |dst| region.copy_half(half, dst))
                .map_err(|source| CollectionError::Capacity {
                    words_copied,
                    source,
                })?;
            self.session.words_copied += plan.take;
            self.session.transfers += 1;
            self.session.last_half = Some(half);
            debug!(
                "Transfer {}: {} words from the {} half ({}/{})",
                self.session.transfers,
                plan.take,
                half,
                self.session.words_copied,
                requested_words
            );

            if self.config.verify_timing {
                let after = region.read_status();
                match HandshakeState::from_word(after) {
                    HandshakeState::HalfReady(h) if h == half => {}
                    HandshakeState::Violated(bad) => {
                        warn!(
                            "Status word {:#x} outside protocol after copying the {} half",
                            bad, half
                        );
                        return Err(CollectionError::ProtocolViolation {
                            word: bad,
                            words_copied: self.session.words_copied,
                        });
                    }
                    // Lowered or flipped mid-copy: the half may have been refilled
                    HandshakeState::Idle | HandshakeState::HalfReady(_) => {
                        warn!(
                            "Status word changed from {:#x} to {:#x} during copy",
                            word, after
                        );
                        return Err(CollectionError::TimingViolation {
                            expected: half,
                            observed: after,
                            words_copied: self.session.words_copied,
                        });
                    }
                }
            }

            if plan.is_clamped() {
                let acknowledged = self.config.final_ack == FinalAckPolicy::Acknowledge;
                if acknowledged {
                    fence(Ordering::Release);
                    region.clear_status();
                    trace!("HalfReady({half}) -> Idle (final)");
                } else {
                    trace!("HalfReady({half}) left raised after clamped transfer");
                }
                warn!(
                    "Final transfer truncated: {} of {} words taken",
                    plan.take, half_words
                );
                if self.config.overrun == OverrunPolicy::Reject {
                    return Err(CollectionError::Overrun {
                        half,
                        requested_words,
                        words_copied: self.session.words_copied,
                        discarded_words: plan.discarded,
                    });
                }
                completion = Completion::Truncated {
                    discarded_words: plan.discarded,
                    acknowledged,
                };
            } else {
                // Copy must land before the producer may refill the half.
                fence(Ordering::Release);
                region.clear_status();
                trace!("HalfReady({half}) -> Idle");
            }
        }

        self.session.mark_complete();
        info!(
            "Collection complete: {} words in {} transfers",
            self.session.words_copied, self.session.transfers
        );

        Ok(CollectionReport {
            requested_words,
            words_copied: self.session.words_copied,
            transfers: self.session.transfers,
            completion,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{FakeRegion, ProducerMode, RegionEvent, RegionRecorder, ScriptStep, TimedProducer};
    use crate::wait::CancelToken;
    use pruscope_protocol::{transfer_count, RegionLayout};

    const H: usize = 4; // half size of FakeRegion::small_layout()

    fn run(
        region: &mut FakeRegion,
        requested: usize,
        config: CollectorConfig,
    ) -> (Result<CollectionReport, CollectionError>, AccumulationBuffer, TraceCollector) {
        let mut buffer = AccumulationBuffer::with_capacity_words(requested.max(1));
        let mut collector = TraceCollector::new(config);
        let result = collector.collect(region, &mut buffer, requested);
        (result, buffer, collector)
    }

    #[test]
    fn whole_halves_take_exactly_l_over_h_transfers() {
        for halves in 1..=5 {
            let requested = halves * H;
            let mut region = FakeRegion::scripted(
                FakeRegion::small_layout(),
                FakeRegion::alternating(halves),
            );
            let (result, buffer, collector) = run(&mut region, requested, CollectorConfig::default());
            let report = result.unwrap();
            assert_eq!(report.transfers, halves);
            assert_eq!(report.words_copied, requested);
            assert_eq!(report.completion, Completion::Full);
            assert!(collector.session().is_complete());
            assert_eq!(
                buffer.into_samples(),
                FakeRegion::expected_samples(requested * 4)
            );
        }
    }

    #[test]
    fn partial_final_transfer_copies_remainder() {
        for requested in [1, 3, 5, 7, 9, 11] {
            let expected_transfers = transfer_count(requested, H);
            let mut region = FakeRegion::scripted(
                FakeRegion::small_layout(),
                FakeRegion::alternating(expected_transfers + 2),
            );
            let recorder = region.recorder();
            let (result, buffer, _) = run(&mut region, requested, CollectorConfig::default());
            let report = result.unwrap();

            let copies = recorder.copies();
            assert_eq!(copies.len(), expected_transfers);
            let last = copies.last().unwrap().1;
            let remainder = if requested % H == 0 { H } else { requested % H };
            assert_eq!(last, remainder);
            assert_eq!(report.words_copied, requested);
            assert_eq!(
                report.completion,
                Completion::Truncated {
                    discarded_words: H - remainder,
                    acknowledged: false
                }
            );
            assert_eq!(buffer.filled_words(), requested);
            assert_eq!(
                buffer.into_samples(),
                FakeRegion::expected_samples(requested * 4)
            );
            // No half requested after the clamped one
            let published = recorder
                .events()
                .iter()
                .filter(|e| matches!(e, RegionEvent::Published(_)))
                .count();
            assert_eq!(published, expected_transfers);
        }
    }

    #[test]
    fn idle_polls_never_copy() {
        let mut region = FakeRegion::scripted(
            FakeRegion::small_layout(),
            [
                ScriptStep::Idle(10),
                ScriptStep::Publish(Half::First),
                ScriptStep::Idle(3),
                ScriptStep::Publish(Half::Second),
            ],
        );
        let recorder = region.recorder();
        let (result, _, _) = run(&mut region, 2 * H, CollectorConfig::default());
        result.unwrap();
        assert_eq!(recorder.copies(), vec![(Half::First, H), (Half::Second, H)]);
    }

    #[test]
    fn each_ready_flag_gives_one_copy_then_one_clear() {
        let mut region = FakeRegion::scripted(
            FakeRegion::small_layout(),
            FakeRegion::alternating(3),
        );
        let recorder = region.recorder();
        let (result, _, _) = run(&mut region, 3 * H, CollectorConfig::default());
        result.unwrap();

        let consumer_events: Vec<RegionEvent> = recorder
            .events()
            .into_iter()
            .filter(|e| {
                matches!(
                    e,
                    RegionEvent::WordsRead { .. } | RegionEvent::StatusWritten(_)
                )
            })
            .collect();
        let one = |half| {
            [
                RegionEvent::WordsRead {
                    half: Some(half),
                    len: H,
                },
                RegionEvent::StatusWritten(0),
            ]
        };
        let expected: Vec<RegionEvent> = [one(Half::First), one(Half::Second), one(Half::First)]
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(consumer_events, expected);
        assert_eq!(region.peek_status(), 0);
    }

    #[test]
    fn clamped_final_transfer_leaves_flag_raised_by_default() {
        let mut region = FakeRegion::scripted(
            FakeRegion::small_layout(),
            FakeRegion::alternating(2),
        );
        let recorder = region.recorder();
        let (result, _, _) = run(&mut region, H + 1, CollectorConfig::default());
        result.unwrap();
        assert_eq!(region.peek_status(), 2);
        let clears = recorder
            .events()
            .iter()
            .filter(|e| **e == RegionEvent::StatusWritten(0))
            .count();
        assert_eq!(clears, 1);
    }

    #[test]
    fn clamped_final_transfer_acknowledged_when_requested() {
        let mut region = FakeRegion::scripted(
            FakeRegion::small_layout(),
            FakeRegion::alternating(2),
        );
        let config = CollectorConfig {
            final_ack: FinalAckPolicy::Acknowledge,
            ..CollectorConfig::default()
        };
        let (result, _, _) = run(&mut region, H + 1, config);
        let report = result.unwrap();
        assert_eq!(
            report.completion,
            Completion::Truncated {
                discarded_words: H - 1,
                acknowledged: true
            }
        );
        assert_eq!(region.peek_status(), 0);
    }

    #[test]
    fn overrun_rejected_by_policy_still_copies() {
        let mut region = FakeRegion::scripted(
            FakeRegion::small_layout(),
            FakeRegion::alternating(2),
        );
        let config = CollectorConfig {
            overrun: OverrunPolicy::Reject,
            ..CollectorConfig::default()
        };
        let (result, buffer, collector) = run(&mut region, H + 2, config);
        let err = result.unwrap_err();
        assert_eq!(
            err,
            CollectionError::Overrun {
                half: Half::Second,
                requested_words: H + 2,
                words_copied: H + 2,
                discarded_words: H - 2,
            }
        );
        assert_eq!(err.words_copied(), H + 2);
        assert_eq!(buffer.filled_words(), H + 2);
        assert!(!collector.session().is_complete());
    }

    #[test]
    fn violation_stops_further_copies() {
        for bad in [3u32, 7, 0xFFFF_FFFF] {
            let mut region = FakeRegion::scripted(
                FakeRegion::small_layout(),
                [
                    ScriptStep::Publish(Half::First),
                    ScriptStep::Raw(bad),
                    ScriptStep::Publish(Half::Second),
                ],
            );
            let recorder = region.recorder();
            let (result, buffer, collector) = run(&mut region, 3 * H, CollectorConfig::default());
            assert_eq!(
                result.unwrap_err(),
                CollectionError::ProtocolViolation {
                    word: bad,
                    words_copied: H
                }
            );
            assert_eq!(recorder.copies().len(), 1);
            assert_eq!(buffer.filled_words(), H);
            assert!(!collector.session().is_complete());
        }
    }

    #[test]
    fn violation_on_first_poll() {
        let mut region = FakeRegion::scripted(FakeRegion::small_layout(), [ScriptStep::Raw(9)]);
        let (result, buffer, _) = run(&mut region, H, CollectorConfig::default());
        assert_eq!(
            result.unwrap_err(),
            CollectionError::ProtocolViolation {
                word: 9,
                words_copied: 0
            }
        );
        assert!(buffer.is_empty());
    }

    #[test]
    fn timeout_reports_progress() {
        let mut region = FakeRegion::scripted(
            FakeRegion::small_layout(),
            FakeRegion::alternating(1),
        );
        let config = CollectorConfig {
            wait: WaitPolicy {
                clock_check_interval: 1,
                ..WaitPolicy::with_timeout(Duration::from_millis(2))
            },
            ..CollectorConfig::default()
        };
        let (result, _, _) = run(&mut region, 2 * H, config);
        assert_eq!(
            result.unwrap_err(),
            CollectionError::Timeout {
                limit: Duration::from_millis(2),
                words_copied: H
            }
        );
    }

    #[test]
    fn cancel_between_halves() {
        let token = CancelToken::new();
        let mut region = FakeRegion::scripted(
            FakeRegion::small_layout(),
            [
                ScriptStep::Publish(Half::First),
                ScriptStep::Publish(Half::Second),
                ScriptStep::Cancel(token.clone()),
            ],
        );
        let config = CollectorConfig {
            wait: WaitPolicy::spin().cancellable(token),
            ..CollectorConfig::default()
        };
        let (result, _, _) = run(&mut region, 4 * H, config);
        assert_eq!(
            result.unwrap_err(),
            CollectionError::Cancelled {
                words_copied: 2 * H
            }
        );
    }

    #[test]
    fn empty_request_is_rejected() {
        let mut region = FakeRegion::scripted(FakeRegion::small_layout(), []);
        let mut buffer = AccumulationBuffer::with_capacity_words(4);
        let mut collector = TraceCollector::new(CollectorConfig::default());
        assert_eq!(
            collector.collect(&mut region, &mut buffer, 0),
            Err(CollectionError::EmptyRequest)
        );
        assert_eq!(region.status_reads(), 0);
    }

    #[test]
    fn undersized_buffer_is_rejected() {
        let mut region = FakeRegion::scripted(FakeRegion::small_layout(), []);
        let mut buffer = AccumulationBuffer::with_capacity_words(3);
        let mut collector = TraceCollector::new(CollectorConfig::default());
        assert_eq!(
            collector.collect(&mut region, &mut buffer, 4),
            Err(CollectionError::BufferTooSmall {
                requested: 4,
                capacity: 3
            })
        );
    }

    #[test]
    fn collector_runs_once() {
        let mut region = FakeRegion::scripted(
            FakeRegion::small_layout(),
            FakeRegion::alternating(2),
        );
        let mut buffer = AccumulationBuffer::with_capacity_words(2 * H);
        let mut collector = TraceCollector::new(CollectorConfig::default());
        collector.collect(&mut region, &mut buffer, H).unwrap();
        assert_eq!(
            collector.collect(&mut region, &mut buffer, H),
            Err(CollectionError::SessionReused)
        );
        assert_eq!(buffer.filled_words(), H);
    }

    #[test]
    fn repeated_half_is_a_timing_violation() {
        let mut region = FakeRegion::scripted(
            FakeRegion::small_layout(),
            [
                ScriptStep::Publish(Half::First),
                ScriptStep::Publish(Half::First),
            ],
        );
        let (result, _, _) = run(&mut region, 2 * H, CollectorConfig::default());
        assert_eq!(
            result.unwrap_err(),
            CollectionError::TimingViolation {
                expected: Half::Second,
                observed: 1,
                words_copied: H
            }
        );
    }

    #[test]
    fn repeated_half_accepted_without_timing_checks() {
        let mut region = FakeRegion::scripted(
            FakeRegion::small_layout(),
            [
                ScriptStep::Publish(Half::First),
                ScriptStep::Publish(Half::First),
            ],
        );
        let config = CollectorConfig {
            verify_timing: false,
            ..CollectorConfig::default()
        };
        let (result, _, _) = run(&mut region, 2 * H, config);
        assert_eq!(result.unwrap().transfers, 2);
    }

    #[test]
    fn producer_within_timing_budget_loses_nothing() {
        // Each transfer costs the consumer H + 3 ticks; a half every 20
        // ticks leaves ample slack even for a producer that never waits.
        for mode in [ProducerMode::Waits, ProducerMode::FreeRunning] {
            let mut region = FakeRegion::timed(
                FakeRegion::small_layout(),
                TimedProducer::new(20, mode),
            );
            let recorder = region.recorder();
            let requested = 10 * H;
            let (result, buffer, _) = run(&mut region, requested, CollectorConfig::default());
            assert_eq!(result.unwrap().transfers, 10);
            assert_eq!(
                buffer.into_samples(),
                FakeRegion::expected_samples(requested * 4)
            );
            assert!(!recorder
                .events()
                .iter()
                .any(|e| matches!(e, RegionEvent::Overwrote { .. })));
        }
    }

    #[test]
    fn producer_outrunning_collector_is_reported() {
        // A half every 3 ticks: the next flag lands while the 4-word copy
        // is still in progress.
        let mut region = FakeRegion::timed(
            FakeRegion::small_layout(),
            TimedProducer::new(3, ProducerMode::FreeRunning),
        );
        let (result, buffer, collector) = run(&mut region, 10 * H, CollectorConfig::default());
        let err = result.unwrap_err();
        assert!(
            matches!(err, CollectionError::TimingViolation { .. }),
            "expected timing violation, got {err:?}"
        );
        assert!(!collector.session().is_complete());
        // Everything reported as copied is the uncorrupted prefix
        let copied = err.words_copied();
        assert_eq!(buffer.filled_words(), copied);
        assert_eq!(
            buffer.into_samples(),
            FakeRegion::expected_samples(copied * 4)
        );
    }

    #[test]
    fn waiting_producer_survives_slow_collector() {
        let mut region = FakeRegion::timed(
            FakeRegion::small_layout(),
            TimedProducer::new(1, ProducerMode::Waits),
        );
        let requested = 6 * H;
        let (result, buffer, _) = run(&mut region, requested, CollectorConfig::default());
        assert_eq!(result.unwrap().completion, Completion::Full);
        assert_eq!(
            buffer.into_samples(),
            FakeRegion::expected_samples(requested * 4)
        );
    }

    #[test]
    fn real_layout_single_page_is_one_clamped_transfer() {
        let layout = RegionLayout::pru_shared();
        let mut region = FakeRegion::scripted(layout, FakeRegion::alternating(1));
        let (result, _, _) = run(&mut region, 1024, CollectorConfig::default());
        let report = result.unwrap();
        assert_eq!(report.transfers, 1);
        assert_eq!(
            report.completion,
            Completion::Truncated {
                discarded_words: 1532 - 1024,
                acknowledged: false
            }
        );
    }

    /// Rewrites the status word while a half is being copied.
    struct CorruptDuringCopy {
        inner: FakeRegion,
        status: u32,
    }

    impl SharedRegion for CorruptDuringCopy {
        fn layout(&self) -> RegionLayout {
            self.inner.layout()
        }

        fn read_status(&mut self) -> u32 {
            self.inner.read_status()
        }

        fn write_status(&mut self, value: u32) {
            self.inner.write_status(value)
        }

        fn read_words(&mut self, word_offset: usize, dst: &mut [u32]) {
            self.inner.read_words(word_offset, dst);
            self.inner.write_status(self.status);
        }
    }

    fn corrupt_during_copy(status: u32) -> (CollectionError, RegionRecorder) {
        // One half only, so a lowered flag is not immediately republished
        let inner = FakeRegion::scripted(FakeRegion::small_layout(), FakeRegion::alternating(1));
        let recorder = inner.recorder();
        let mut region = CorruptDuringCopy { inner, status };
        let mut buffer = AccumulationBuffer::with_capacity_words(2 * H);
        let mut collector = TraceCollector::new(CollectorConfig::default());
        let err = collector.collect(&mut region, &mut buffer, 2 * H).unwrap_err();
        (err, recorder)
    }

    #[test]
    fn garbage_written_during_copy_is_a_protocol_violation() {
        let (err, recorder) = corrupt_during_copy(7);
        assert_eq!(
            err,
            CollectionError::ProtocolViolation {
                word: 7,
                words_copied: H
            }
        );
        assert_eq!(recorder.copies(), vec![(Half::First, H)]);
    }

    #[test]
    fn flag_lowered_during_copy_is_a_timing_violation() {
        let (err, _) = corrupt_during_copy(0);
        assert_eq!(
            err,
            CollectionError::TimingViolation {
                expected: Half::First,
                observed: 0,
                words_copied: H
            }
        );
    }

    #[test]
    fn flag_flipped_during_copy_is_a_timing_violation() {
        let (err, _) = corrupt_during_copy(2);
        assert_eq!(
            err,
            CollectionError::TimingViolation {
                expected: Half::First,
                observed: 2,
                words_copied: H
            }
        );
    }
}
