//! Response correlation: wait until a predicate over received reports holds.
//!
//! Adapters accumulate inbound reports into shared state from a
//! [`ReportListener`](crate::transport::ReportListener) callback and then call
//! [`await_condition`] with a predicate over that state. The wait is polled at
//! a fixed cadence, bounded by a timeout, and tied to the owning device's
//! cancellation token.
//!
//! Outcomes are explicit: `Ok(value)` when the predicate held,
//! `Err(WaitError::TimedOut { partial, .. })` carrying whatever had been
//! accumulated when the budget ran out, and `Err(WaitError::Cancelled)` when
//! the device was torn down mid-wait.

use crate::error::Error;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Poll cadence used by every adapter.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Shortest poll period. `tokio::time::interval` panics on zero.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Bounds of a single correlated wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl WaitOptions {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }

    /// Same cadence, remaining budget up to `deadline`.
    pub fn until(self, deadline: Instant) -> Self {
        Self {
            timeout: deadline.saturating_duration_since(Instant::now()),
            ..self
        }
    }
}

/// Why a wait ended without the predicate holding.
#[derive(Debug)]
pub enum WaitError<T> {
    /// The budget elapsed. `partial` is the value built from the state at
    /// that moment.
    TimedOut { partial: T, waited: Duration },
    /// The owning device was disconnected.
    Cancelled,
}

impl<T> WaitError<T> {
    /// Collapse into a crate error, discarding any partial value.
    pub fn into_error(self, operation: &'static str, device: &str) -> Error {
        match self {
            Self::TimedOut { waited, .. } => Error::Timeout {
                operation,
                waited_ms: waited.as_millis() as u64,
            },
            Self::Cancelled => Error::DeviceDisconnected(device.to_string()),
        }
    }
}

/// Poll `predicate` until it holds, the timeout elapses, or `cancel` fires.
///
/// The predicate is evaluated immediately and then once per poll interval,
/// so a wait that never succeeds resolves within `timeout + poll_interval`.
/// `finish` builds the result from the accumulated state; it runs exactly
/// once, on success or on timeout.
pub async fn await_condition<T, P, F>(
    mut predicate: P,
    finish: F,
    opts: WaitOptions,
    cancel: &CancellationToken,
) -> Result<T, WaitError<T>>
where
    P: FnMut() -> bool,
    F: FnOnce() -> T,
{
    let started = Instant::now();
    let deadline = started + opts.timeout;
    let mut ticker = tokio::time::interval(opts.poll_interval.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            _ = ticker.tick() => {}
        }

        if predicate() {
            trace!(elapsed_ms = started.elapsed().as_millis() as u64, "Condition satisfied");
            return Ok(finish());
        }
        if Instant::now() >= deadline {
            return Err(WaitError::TimedOut {
                partial: finish(),
                waited: started.elapsed(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn opts(timeout_ms: u64) -> WaitOptions {
        WaitOptions::new(Duration::from_millis(timeout_ms), DEFAULT_POLL_INTERVAL)
    }

    #[tokio::test(start_paused = true)]
    async fn satisfied_predicate_resolves_ok() {
        let cancel = CancellationToken::new();
        let polls = AtomicUsize::new(0);
        let result = await_condition(
            || polls.fetch_add(1, Ordering::SeqCst) >= 3,
            || 42,
            opts(5000),
            &cancel,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_carries_partial_value() {
        let cancel = CancellationToken::new();
        let started = Instant::now();
        let result = await_condition(|| false, || "partial", opts(5000), &cancel).await;
        let elapsed = started.elapsed();

        match result {
            Err(WaitError::TimedOut { partial, .. }) => assert_eq!(partial, "partial"),
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(elapsed >= Duration::from_millis(5000));
        assert!(elapsed <= Duration::from_millis(5000) + DEFAULT_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_poll_interval_is_clamped() {
        let cancel = CancellationToken::new();
        let opts = WaitOptions::new(Duration::from_millis(20), Duration::ZERO);
        let started = Instant::now();
        let result = await_condition(|| false, || (), opts, &cancel).await;
        assert!(matches!(result, Err(WaitError::TimedOut { .. })));
        assert!(started.elapsed() <= Duration::from_millis(20) + MIN_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_wait() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let result = await_condition(|| false, || (), opts(10_000), &cancel).await;
        assert!(matches!(result, Err(WaitError::Cancelled)));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn state_updated_elsewhere_satisfies_predicate() {
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let writer = Arc::clone(&counter);
        tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_millis(120)).await;
                writer.fetch_add(1, Ordering::SeqCst);
            }
        });

        let result = await_condition(
            || counter.load(Ordering::SeqCst) == 3,
            || counter.load(Ordering::SeqCst),
            opts(5000),
            &cancel,
        )
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn wait_error_maps_to_typed_errors() {
        let timeout: WaitError<()> = WaitError::TimedOut {
            partial: (),
            waited: Duration::from_millis(5000),
        };
        assert!(matches!(
            timeout.into_error("filter count", "hid-0"),
            Error::Timeout { waited_ms: 5000, .. }
        ));
        let cancelled: WaitError<()> = WaitError::Cancelled;
        assert!(matches!(
            cancelled.into_error("filter count", "hid-0"),
            Error::DeviceDisconnected(_)
        ));
    }
}
