//! Cancellable timed waits for the watchdog loop and the ping rendezvous.

use std::time::Duration;

use tokio::sync::Notify;

/// Outcome of a [`sleep_cancellable`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    Elapsed,
    Cancelled,
}

/// Sleeps for `duration` unless `cancel` is notified first. `close()` calls
/// `cancel.notify_one()` so the watchdog loop wakes promptly on shutdown
/// instead of waiting out its full 5 s cadence. `Notify::notify_one` stores a
/// permit for a not-yet-waiting call, so a `close()` racing ahead of the next
/// `sleep_cancellable` is still observed.
pub async fn sleep_cancellable(duration: Duration, cancel: &Notify) -> SleepOutcome {
    tokio::select! {
        _ = tokio::time::sleep(duration) => SleepOutcome::Elapsed,
        _ = cancel.notified() => SleepOutcome::Cancelled,
    }
}
