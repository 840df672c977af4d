//! Cancellable spin-wait on the status word.
//!
//! The producer publishes a half every few tens of microseconds, so the
//! collector spins instead of sleeping.  With no deadline and no cancel
//! token the loop is a bare volatile read plus `spin_loop`: no clock reads,
//! no allocation.  Either knob adds a check per iteration.

use crate::region::SharedRegion;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Spins between clock reads when a deadline is set.
const DEFAULT_CLOCK_CHECK_INTERVAL: u32 = 64;

/// Why a wait ended without a ready half.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("no half published within {limit:?} ({polls} polls)")]
    Timeout { limit: Duration, polls: u64 },

    #[error("wait cancelled after {polls} polls")]
    Cancelled { polls: u64 },
}

/// Shared flag that stops an in-progress wait.
///
/// Clones share the flag; cancelling any clone cancels them all.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// How long, and how interruptibly, to wait for the producer.
#[derive(Debug, Clone)]
pub struct WaitPolicy {
    /// Give up after this long without a published half.
    pub timeout: Option<Duration>,
    /// Abort as soon as this token is cancelled.
    pub cancel: Option<CancelToken>,
    /// Spins between clock reads when `timeout` is set.
    pub clock_check_interval: u32,
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::spin()
    }
}

impl WaitPolicy {
    /// Spin forever.  Lowest latency; no way out but a published half.
    pub fn spin() -> Self {
        Self {
            timeout: None,
            cancel: None,
            clock_check_interval: DEFAULT_CLOCK_CHECK_INTERVAL,
        }
    }

    /// Spin for at most `timeout` per half.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::spin()
        }
    }

    /// Attach a cancel token.
    pub fn cancellable(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_bare_spin(&self) -> bool {
        self.timeout.is_none() && self.cancel.is_none()
    }
}

/// Spin until the status word is non-zero and return it.
///
/// The deadline is per call, so it bounds the gap between two halves, not
/// the whole capture.
pub fn wait_for_status<R: SharedRegion + ?Sized>(
    region: &mut R,
    policy: &WaitPolicy,
) -> Result<u32, WaitError> {
    if policy.is_bare_spin() {
        loop {
            let word = region.read_status();
            if word != 0 {
                return Ok(word);
            }
            std::hint::spin_loop();
        }
    }

    let start = policy.timeout.map(|_| Instant::now());
    let interval = policy.clock_check_interval.max(1);
    let mut polls: u64 = 0;
    let mut until_clock = interval;

    loop {
        let word = region.read_status();
        polls += 1;
        if word != 0 {
            return Ok(word);
        }

        if let Some(token) = &policy.cancel {
            if token.is_cancelled() {
                return Err(WaitError::Cancelled { polls });
            }
        }

        if let (Some(limit), Some(start)) = (policy.timeout, start) {
            until_clock -= 1;
            if until_clock == 0 {
                until_clock = interval;
                if start.elapsed() >= limit {
                    return Err(WaitError::Timeout { limit, polls });
                }
            }
        }

        std::hint::spin_loop();
    }
}
