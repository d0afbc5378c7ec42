//! Deadline tracking for call attempts.
//!
//! A deadline is an absolute time after which the call is considered
//! expired. The coordinator owns a single-shot timer and a mutex-guarded
//! expiry slot that acts as a one-way latch: once the deadline-exceeded
//! transition has been taken (by the timer or by a server-reported
//! DEADLINE_EXCEEDED racing the timer), the slot flips to "never" and can
//! not flip back, so the transition happens at most once.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::debug;

use crate::cancel::{CancelHandle, CancelReason};

/// Longest interval a single timer sleep is scheduled for; longer deadlines
/// reschedule when it elapses. Matches the millisecond-granularity cap of
/// coarse platform timers.
const MAX_TIMER_INTERVAL: Duration = Duration::from_millis(u32::MAX as u64 - 1);

/// Largest value the `grpc-timeout` header may carry per the wire protocol.
const MAX_TIMEOUT_UNITS: u128 = 99_999_999;

/// An absolute deadline, or "never".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// A deadline that never expires.
    pub fn never() -> Self {
        Deadline(None)
    }

    /// A deadline at the given absolute time.
    pub fn at(instant: Instant) -> Self {
        Deadline(Some(instant))
    }

    /// A deadline `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Deadline(Some(Instant::now() + timeout))
    }

    /// Returns `true` if no deadline is set.
    pub fn is_never(&self) -> bool {
        self.0.is_none()
    }

    /// Returns `true` if a deadline is set and has passed.
    pub fn is_expired(&self) -> bool {
        match self.0 {
            Some(at) => at <= Instant::now(),
            None => false,
        }
    }

    /// Time remaining until expiry. `None` when no deadline is set; zero when
    /// already expired.
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    fn instant(&self) -> Option<Instant> {
        self.0
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Deadline::never()
    }
}

fn div_ceil(value: u128, unit: u128) -> u128 {
    (value + unit - 1) / unit
}

/// Encodes a remaining duration as a `grpc-timeout` header value.
///
/// The value is rounded up and expressed in the smallest unit that keeps it
/// at three digits or fewer: milliseconds (`m`), seconds (`S`), minutes
/// (`M`), then hours (`H`, capped at the protocol maximum). An already
/// expired deadline encodes as the one-nanosecond sentinel `1n`.
pub fn encode_grpc_timeout(remaining: Duration) -> String {
    if remaining.is_zero() {
        return "1n".to_string();
    }
    let nanos = remaining.as_nanos();
    let ms = div_ceil(nanos, 1_000_000);
    if ms <= 999 {
        return format!("{ms}m");
    }
    let secs = div_ceil(nanos, 1_000_000_000);
    if secs <= 999 {
        return format!("{secs}S");
    }
    let mins = div_ceil(nanos, 60 * 1_000_000_000);
    if mins <= 999 {
        return format!("{mins}M");
    }
    let hours = div_ceil(nanos, 3600 * 1_000_000_000);
    format!("{}H", hours.min(MAX_TIMEOUT_UNITS))
}

/// Owns the deadline state and timer of one call attempt.
///
/// The expiry slot is `None` both for "no deadline" and after the latch has
/// been taken; in either case no further deadline transition may occur.
#[derive(Debug)]
pub struct DeadlineCoordinator {
    expiry: Mutex<Option<Instant>>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl DeadlineCoordinator {
    /// Creates a coordinator for the given deadline.
    pub fn new(deadline: Deadline) -> Arc<Self> {
        Arc::new(Self {
            expiry: Mutex::new(deadline.instant()),
            timer: Mutex::new(None),
        })
    }

    /// Synchronous pre-dispatch check. If the deadline has already passed,
    /// takes the latch and returns `true`; the attempt must then finish with
    /// DEADLINE_EXCEEDED before any transport call is made.
    pub fn check_expired_at_start(&self) -> bool {
        let mut expiry = self.expiry.lock().unwrap();
        match *expiry {
            Some(at) if at <= Instant::now() => {
                *expiry = None;
                true
            }
            _ => false,
        }
    }

    /// Takes the deadline-exceeded latch if it is still available.
    ///
    /// Returns `true` if this caller performed the transition. The timer
    /// callback and the server-reported DEADLINE_EXCEEDED path both go
    /// through here, serialized by the expiry lock.
    pub fn try_latch(&self) -> bool {
        let mut expiry = self.expiry.lock().unwrap();
        if expiry.is_some() {
            *expiry = None;
            true
        } else {
            false
        }
    }

    /// Returns `true` if a deadline transition is still possible.
    pub fn is_armed(&self) -> bool {
        self.expiry.lock().unwrap().is_some()
    }

    /// Starts the timer task. On fire it re-checks the remaining time under
    /// the lock (coarse timers can wake early), reschedules if time remains,
    /// and otherwise takes the latch and cancels the attempt.
    pub fn start(self: &Arc<Self>, handle: CancelHandle) {
        if !self.is_armed() {
            return;
        }
        let coordinator = self.clone();
        let task = tokio::spawn(async move {
            loop {
                let sleep_for = match *coordinator.expiry.lock().unwrap() {
                    Some(at) => at.saturating_duration_since(Instant::now()),
                    None => return,
                };
                if sleep_for.is_zero() {
                    if coordinator.try_latch() {
                        debug!("deadline expired, cancelling attempt");
                        handle.cancel(CancelReason::DeadlineExceeded);
                    }
                    return;
                }
                tokio::time::sleep(sleep_for.min(MAX_TIMER_INTERVAL)).await;
            }
        });
        *self.timer.lock().unwrap() = Some(task);
    }

    /// Stops the timer. Called by the terminal-resolution routine.
    pub fn release(&self) {
        if let Some(task) = self.timer.lock().unwrap().take() {
            task.abort();
        }
    }
}

impl Drop for DeadlineCoordinator {
    fn drop(&mut self) {
        self.release();
    }
}
