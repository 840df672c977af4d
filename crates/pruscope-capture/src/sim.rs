//! In-memory stand-in for the PRU shared region.
//!
//! [`FakeRegion`] exposes the same status-word and half-buffer semantics as
//! [`crate::region::DevMemRegion`], backed by a `Vec<u32>`, with a
//! simulated producer on the other side:
//!
//! - **Scripted**: a fixed list of [`ScriptStep`]s, one consumed per status
//!   poll while the status word is idle.  Used to drive exact transition
//!   sequences, protocol violations, and cancellation.
//! - **Timed**: a [`TimedProducer`] that completes a half every `period`
//!   ticks, where every region access costs ticks.  Used to simulate flag
//!   races between a free-running producer and a slow consumer.
//!
//! Samples are a running byte counter (`0, 1, 2, …, 255, 0, …`), so any
//! lost or repeated half shows up as a discontinuity.
//!
//! Every observable transition is recorded through a [`RegionRecorder`] that
//! outlives the region, including the final [`RegionEvent::Released`].

use crate::region::SharedRegion;
use crate::wait::CancelToken;
use pruscope_protocol::{Half, RegionLayout, STATUS_IDLE, WORD_BYTES};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

// ═══════════════════════════════════════════════════════════════════════
//  Observation log
// ═══════════════════════════════════════════════════════════════════════

/// One observable access to a [`FakeRegion`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegionEvent {
    /// A status poll returned a non-zero word.  Idle polls are only counted.
    StatusObserved(u32),
    /// The consumer wrote the status word.
    StatusWritten(u32),
    /// The consumer copied `len` words from `half` (or from outside the
    /// halves, if `None`).
    WordsRead { half: Option<Half>, len: usize },
    /// The producer published a half.
    Published(Half),
    /// The producer overwrote a still-raised flag.
    Overwrote { previous: u32, half: Half },
    /// The region was dropped.
    Released,
}

#[derive(Debug, Default)]
struct RecorderState {
    events: Vec<RegionEvent>,
    status_reads: u64,
    releases: usize,
}

/// Shared view of a [`FakeRegion`]'s access log.
#[derive(Debug, Clone, Default)]
pub struct RegionRecorder(Arc<Mutex<RecorderState>>);

impl RegionRecorder {
    fn record(&self, event: RegionEvent) {
        if let Ok(mut state) = self.0.lock() {
            if event == RegionEvent::Released {
                state.releases += 1;
            }
            state.events.push(event);
        }
    }

    fn count_status_read(&self) {
        if let Ok(mut state) = self.0.lock() {
            state.status_reads += 1;
        }
    }

    /// All recorded events, oldest first.
    pub fn events(&self) -> Vec<RegionEvent> {
        self.0.lock().map(|s| s.events.clone()).unwrap_or_default()
    }

    /// Total status polls, idle or not.
    pub fn status_reads(&self) -> u64 {
        self.0.lock().map(|s| s.status_reads).unwrap_or_default()
    }

    /// How many times the region has been dropped.
    pub fn releases(&self) -> usize {
        self.0.lock().map(|s| s.releases).unwrap_or_default()
    }

    /// Half copies performed by the consumer, in order.
    pub fn copies(&self) -> Vec<(Half, usize)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                RegionEvent::WordsRead {
                    half: Some(half),
                    len,
                } => Some((half, len)),
                _ => None,
            })
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Producers
// ═══════════════════════════════════════════════════════════════════════

/// One step of a scripted producer.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Leave the status word idle for this many polls.
    Idle(u32),
    /// Fill the half with the next samples and raise its flag.
    Publish(Half),
    /// Store an arbitrary word in the status slot.
    Raw(u32),
    /// Cancel the token (the status word stays idle for this poll).
    Cancel(CancelToken),
}

/// What a timed producer does when its next half is due but the consumer
/// has not cleared the previous flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerMode {
    /// Hold the finished half until the flag is cleared.
    Waits,
    /// Overwrite the flag regardless, as the PRU firmware does.
    FreeRunning,
}

/// Producer that completes one half every `period` ticks.
///
/// A status access costs one tick; copying `n` words costs `n` ticks.
#[derive(Debug, Clone)]
pub struct TimedProducer {
    pub period: u64,
    pub mode: ProducerMode,
    /// Stop after publishing this many halves.
    pub limit: Option<usize>,
    elapsed: u64,
    next: Half,
    published: usize,
    held: bool,
}

impl TimedProducer {
    pub fn new(period: u64, mode: ProducerMode) -> Self {
        Self {
            period: period.max(1),
            mode,
            limit: None,
            elapsed: 0,
            next: Half::First,
            published: 0,
            held: false,
        }
    }

    /// Stop after `halves` halves.
    pub fn with_limit(mut self, halves: usize) -> Self {
        self.limit = Some(halves);
        self
    }

    fn exhausted(&self) -> bool {
        self.limit.is_some_and(|limit| self.published >= limit)
    }
}

#[derive(Debug)]
enum Producer {
    Scripted(VecDeque<ScriptStep>),
    Timed(TimedProducer),
}

// ═══════════════════════════════════════════════════════════════════════
//  Fake region
// ═══════════════════════════════════════════════════════════════════════

/// Heap-backed [`SharedRegion`] with a simulated producer.
#[derive(Debug)]
pub struct FakeRegion {
    layout: RegionLayout,
    memory: Vec<u32>,
    producer: Producer,
    next_sample: u64,
    recorder: RegionRecorder,
}

impl FakeRegion {
    /// Tiny layout for tests: 2-word header, 4-word halves.
    pub fn small_layout() -> RegionLayout {
        RegionLayout {
            base_addr: 0,
            total_bytes: 8 + 2 * 4 * WORD_BYTES,
            header_bytes: 8,
        }
    }

    /// Region driven by a fixed script.
    pub fn scripted(layout: RegionLayout, steps: impl IntoIterator<Item = ScriptStep>) -> Self {
        Self::with_producer(layout, Producer::Scripted(steps.into_iter().collect()))
    }

    /// Region driven by a timed producer.
    pub fn timed(layout: RegionLayout, producer: TimedProducer) -> Self {
        Self::with_producer(layout, Producer::Timed(producer))
    }

    fn with_producer(layout: RegionLayout, producer: Producer) -> Self {
        Self {
            layout,
            memory: vec![0; layout.total_words()],
            producer,
            next_sample: 0,
            recorder: RegionRecorder::default(),
        }
    }

    /// Script that publishes `halves` halves, alternating from the first.
    pub fn alternating(halves: usize) -> Vec<ScriptStep> {
        (0..halves)
            .map(|i| {
                ScriptStep::Publish(if i % 2 == 0 { Half::First } else { Half::Second })
            })
            .collect()
    }

    /// Samples the producer emits, in order, for the first `n` samples.
    pub fn expected_samples(n: usize) -> Vec<u8> {
        (0..n).map(|i| i as u8).collect()
    }

    /// Handle on the access log that stays valid after drop.
    pub fn recorder(&self) -> RegionRecorder {
        self.recorder.clone()
    }

    /// Total status polls so far.
    pub fn status_reads(&self) -> u64 {
        self.recorder.status_reads()
    }

    /// Status word without counting as an access.
    pub fn peek_status(&self) -> u32 {
        self.memory[0]
    }

    fn half_at(&self, word_offset: usize) -> Option<Half> {
        [Half::First, Half::Second]
            .into_iter()
            .find(|&h| {
                let start = self.layout.half_word_offset(h);
                (start..start + self.layout.half_words()).contains(&word_offset)
            })
    }

    fn fill_half(&mut self, half: Half) {
        let start = self.layout.half_word_offset(half);
        for word in &mut self.memory[start..start + self.layout.half_words()] {
            let mut bytes = [0u8; WORD_BYTES];
            for b in &mut bytes {
                *b = self.next_sample as u8;
                self.next_sample += 1;
            }
            *word = u32::from_le_bytes(bytes);
        }
    }

    fn publish(&mut self, half: Half) {
        self.fill_half(half);
        let previous = self.memory[0];
        if previous != STATUS_IDLE {
            self.recorder.record(RegionEvent::Overwrote { previous, half });
        }
        self.memory[0] = half.flag();
        self.recorder.record(RegionEvent::Published(half));
    }

    /// Scripted producers act once per status poll.
    fn step_script(&mut self) {
        let Producer::Scripted(steps) = &mut self.producer else {
            return;
        };
        if self.memory[0] != STATUS_IDLE {
            return;
        }
        match steps.pop_front() {
            Some(ScriptStep::Idle(n)) => {
                if n > 1 {
                    steps.push_front(ScriptStep::Idle(n - 1));
                }
            }
            Some(ScriptStep::Publish(half)) => self.publish(half),
            Some(ScriptStep::Raw(word)) => self.memory[0] = word,
            Some(ScriptStep::Cancel(token)) => token.cancel(),
            None => {}
        }
    }

    /// Timed producers act on elapsed ticks.
    fn advance(&mut self, ticks: u64) {
        let Producer::Timed(producer) = &mut self.producer else {
            return;
        };
        producer.elapsed += ticks;

        loop {
            let status = self.memory[0];
            let Producer::Timed(producer) = &mut self.producer else {
                return;
            };
            if producer.exhausted() {
                return;
            }
            if producer.held {
                if status != STATUS_IDLE {
                    return;
                }
                producer.held = false;
            } else if producer.elapsed >= producer.period {
                producer.elapsed -= producer.period;
                if producer.mode == ProducerMode::Waits && status != STATUS_IDLE {
                    producer.held = true;
                    return;
                }
            } else {
                return;
            }
            let half = producer.next;
            producer.next = half.other();
            producer.published += 1;
            self.publish(half);
        }
    }
}

impl SharedRegion for FakeRegion {
    fn layout(&self) -> RegionLayout {
        self.layout
    }

    fn read_status(&mut self) -> u32 {
        self.step_script();
        self.advance(1);
        self.recorder.count_status_read();
        let word = self.memory[0];
        if word != STATUS_IDLE {
            self.recorder.record(RegionEvent::StatusObserved(word));
        }
        word
    }

    fn write_status(&mut self, value: u32) {
        self.memory[0] = value;
        self.recorder.record(RegionEvent::StatusWritten(value));
        self.advance(1);
    }

    fn read_words(&mut self, word_offset: usize, dst: &mut [u32]) {
        let end = word_offset.saturating_add(dst.len());
        assert!(
            end <= self.memory.len(),
            "read of words {word_offset}..{end} past end of {}-word region",
            self.memory.len()
        );
        dst.copy_from_slice(&self.memory[word_offset..end]);
        self.recorder.record(RegionEvent::WordsRead {
            half: self.half_at(word_offset),
            len: dst.len(),
        });
        self.advance(dst.len() as u64);
    }
}

impl Drop for FakeRegion {
    fn drop(&mut self) {
        self.recorder.record(RegionEvent::Released);
    }
}
