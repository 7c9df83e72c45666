//! Delayed and periodic calls
//!
//! Every call runs as a tokio task and returns a [`ScheduledCall`] that can
//! cancel it. Cancelling only prevents calls that have not started yet; an
//! action that is already running is left to finish.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Shortest period accepted by [`track_time_interval`]
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Handle to a pending delayed or periodic call
///
/// Dropping the handle does not cancel the call.
#[derive(Debug, Clone)]
pub struct ScheduledCall {
    token: CancellationToken,
}

impl ScheduledCall {
    /// Cancel the call if it has not started yet, and any later repetitions
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether [`cancel`](Self::cancel) was called
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Run `action` once, `delay` from now
///
/// Must be called from within a tokio runtime.
pub fn call_later<F, Fut>(delay: Duration, action: F) -> ScheduledCall
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    call_at(Instant::now() + delay, action)
}

/// Run `action` once at `deadline`, or right away if it already passed
///
/// Must be called from within a tokio runtime.
pub fn call_at<F, Fut>(deadline: Instant, action: F) -> ScheduledCall
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let token = CancellationToken::new();
    let cancelled = token.clone();

    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = cancelled.cancelled() => trace!("Scheduled call cancelled"),
            _ = tokio::time::sleep_until(deadline) => action().await,
        }
    });

    ScheduledCall { token }
}

/// Run `action` every `period`, the first time one period from now
///
/// A run that overruns the period delays the following ones instead of
/// bursting to catch up. Must be called from within a tokio runtime.
pub fn track_time_interval<F, Fut>(period: Duration, mut action: F) -> ScheduledCall
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = period.max(MIN_INTERVAL);
    let token = CancellationToken::new();
    let cancelled = token.clone();

    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => break,
                _ = interval.tick() => action().await,
            }
        }
        trace!("Interval tracking stopped");
    });

    ScheduledCall { token }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> usize) {
        let count = Arc::new(AtomicUsize::new(0));
        let read = {
            let count = count.clone();
            move || count.load(Ordering::SeqCst)
        };
        (count, read)
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_later_fires_after_delay() {
        let (count, calls) = counter();
        let _call = call_later(Duration::from_secs(10), move || async move {
            count.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(calls(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_call_never_fires() {
        let (count, calls) = counter();
        let call = call_later(Duration::from_secs(10), move || async move {
            count.fetch_add(1, Ordering::SeqCst);
        });

        call.cancel();
        assert!(call.is_cancelled());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_time_interval_repeats_until_cancelled() {
        let (count, calls) = counter();
        let call = track_time_interval(Duration::from_secs(5), move || {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(calls(), 0);

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert_eq!(calls(), 3);

        call.cancel();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(calls(), 3);
    }
}
