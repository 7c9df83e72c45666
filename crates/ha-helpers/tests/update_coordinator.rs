//! Behavioural tests for the data update coordinator
//!
//! All tests run on a paused tokio clock, so intervals and fetch delays
//! elapse instantly and deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use ha_core::ConfigEntryError;
use ha_helpers::{CoordinatorConfig, DataUpdateCoordinator, UpdateError, UpdateMethod};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::Layer;

type Payload = HashMap<String, i64>;

// ============================================================================
// Fixtures
// ============================================================================

/// A device whose fetch can be slowed down or made to fail
#[derive(Default)]
struct FakeDevice {
    calls: AtomicUsize,
    delay: Mutex<Duration>,
    error: Mutex<Option<UpdateError>>,
}

impl FakeDevice {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    fn set_error(&self, error: Option<UpdateError>) {
        *self.error.lock().unwrap() = error;
    }
}

#[async_trait]
impl UpdateMethod<Payload> for FakeDevice {
    async fn update(&self) -> Result<Payload, UpdateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let error = self.error.lock().unwrap().clone();
        match error {
            Some(err) => Err(err),
            None => Ok(HashMap::from([("temp".to_string(), 20)])),
        }
    }
}

fn coordinator(device: &Arc<FakeDevice>, interval: Option<Duration>) -> DataUpdateCoordinator<Payload> {
    let mut config = CoordinatorConfig::<Payload>::new("thermostat", device.clone());
    if let Some(interval) = interval {
        config = config.with_update_interval(interval);
    }
    DataUpdateCoordinator::new(config)
}

fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let callback = {
        let count = count.clone();
        move || {
            count.fetch_add(1, Ordering::SeqCst);
        }
    };
    (count, callback)
}

async fn advance(seconds: u64) {
    tokio::time::sleep(Duration::from_secs(seconds)).await;
}

/// Counts WARN and INFO events emitted while installed
#[derive(Clone, Default)]
struct LevelCounter {
    warnings: Arc<AtomicUsize>,
    infos: Arc<AtomicUsize>,
}

impl<S: Subscriber> Layer<S> for LevelCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level == Level::WARN {
            self.warnings.fetch_add(1, Ordering::SeqCst);
        } else if level == Level::INFO {
            self.infos.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl LevelCounter {
    fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::registry().with(self.clone());
        tracing::subscriber::set_default(subscriber)
    }

    fn warnings(&self) -> usize {
        self.warnings.load(Ordering::SeqCst)
    }

    fn infos(&self) -> usize {
        self.infos.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Refresh coalescing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_concurrent_requests_share_one_fetch() {
    let device = FakeDevice::new();
    device.set_delay(Duration::from_secs(1));
    let coordinator = coordinator(&device, None);

    let (a, b, c) = tokio::join!(
        coordinator.request_refresh(),
        coordinator.request_refresh(),
        coordinator.request_refresh(),
    );

    assert!(a.is_ok() && b.is_ok() && c.is_ok());
    assert_eq!(device.calls(), 1);
    assert!(!coordinator.is_refreshing());
}

#[tokio::test(start_paused = true)]
async fn test_waiters_share_failure() {
    let device = FakeDevice::new();
    device.set_delay(Duration::from_secs(1));
    device.set_error(Some(UpdateError::failed("timeout")));
    let coordinator = coordinator(&device, None);

    let (a, b) = tokio::join!(coordinator.refresh(), coordinator.request_refresh());

    assert_eq!(a, Err(UpdateError::failed("timeout")));
    assert_eq!(b, Err(UpdateError::failed("timeout")));
    assert_eq!(device.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_request_after_cycle_starts_new_fetch() {
    let device = FakeDevice::new();
    let coordinator = coordinator(&device, None);

    coordinator.refresh().await.unwrap();
    coordinator.refresh().await.unwrap();

    assert_eq!(device.calls(), 2);
}

// ============================================================================
// Cycle outcomes
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_success_stores_data_and_notifies() {
    let device = FakeDevice::new();
    let coordinator = coordinator(&device, None);
    let (notified, callback) = counter();
    let _listener = coordinator.add_listener(callback);

    coordinator.refresh().await.unwrap();

    let data = coordinator.data().unwrap();
    assert_eq!(*data, HashMap::from([("temp".to_string(), 20)]));
    assert!(coordinator.last_update_success());
    assert!(coordinator.last_update_success_time().is_some());
    assert!(coordinator.last_exception().is_none());
    assert_eq!(notified.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_listener_observes_fresh_state() {
    let device = FakeDevice::new();
    let coordinator = coordinator(&device, None);
    let seen = Arc::new(Mutex::new(Vec::new()));

    let _listener = coordinator.add_listener({
        let coordinator = coordinator.clone();
        let seen = seen.clone();
        move || {
            seen.lock()
                .unwrap()
                .push((coordinator.last_update_success(), coordinator.data().is_some()));
        }
    });

    coordinator.refresh().await.unwrap();
    device.set_error(Some(UpdateError::failed("unreachable")));
    let _ = coordinator.refresh().await;

    assert_eq!(*seen.lock().unwrap(), vec![(true, true), (false, true)]);
}

#[tokio::test(start_paused = true)]
async fn test_failure_keeps_data_and_warns_once() {
    let logs = LevelCounter::default();
    let _guard = logs.install();

    let device = FakeDevice::new();
    let coordinator = coordinator(&device, None);
    let (notified, callback) = counter();
    let _listener = coordinator.add_listener(callback);

    coordinator.refresh().await.unwrap();

    device.set_error(Some(UpdateError::failed("connection refused")));
    assert!(coordinator.refresh().await.is_err());
    assert!(coordinator.refresh().await.is_err());

    assert!(!coordinator.last_update_success());
    assert_eq!(
        coordinator.last_exception(),
        Some(UpdateError::failed("connection refused"))
    );
    assert_eq!(*coordinator.data().unwrap(), HashMap::from([("temp".to_string(), 20)]));
    assert_eq!(notified.load(Ordering::SeqCst), 3);
    assert_eq!(logs.warnings(), 1);

    device.set_error(None);
    coordinator.refresh().await.unwrap();
    assert!(coordinator.last_update_success());
    assert!(coordinator.last_exception().is_none());
    assert_eq!(logs.infos(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_first_failure_ever_warns() {
    let logs = LevelCounter::default();
    let _guard = logs.install();

    let device = FakeDevice::new();
    device.set_error(Some(UpdateError::failed("timeout")));
    let coordinator = coordinator(&device, None);

    assert!(coordinator.refresh().await.is_err());
    assert!(coordinator.data().is_none());
    assert_eq!(logs.warnings(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_fetch_does_not_wedge_coordinator() {
    struct Flaky {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UpdateMethod<u32> for Flaky {
        async fn update(&self) -> Result<u32, UpdateError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("driver bug");
            }
            Ok(1)
        }
    }

    let coordinator = DataUpdateCoordinator::new(CoordinatorConfig::<u32>::new(
        "flaky",
        Arc::new(Flaky {
            calls: AtomicUsize::new(0),
        }),
    ));

    let err = coordinator.refresh().await.unwrap_err();
    assert!(err.to_string().contains("driver bug"), "{err}");
    assert!(!coordinator.is_refreshing());
    coordinator.refresh().await.unwrap();
    assert_eq!(coordinator.data().as_deref(), Some(&1));
}

/// Fetch counter that panics on the listed calls
struct Sequence {
    calls: AtomicUsize,
    panic_on: Option<usize>,
}

impl Sequence {
    fn new(panic_on: Option<usize>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            panic_on,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UpdateMethod<usize> for Sequence {
    async fn update(&self) -> Result<usize, UpdateError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.panic_on == Some(call) {
            panic!("driver bug on call {call}");
        }
        Ok(call)
    }
}

#[tokio::test(start_paused = true)]
async fn test_panicking_scheduled_fetch_keeps_polling() {
    let device = Sequence::new(Some(2));
    let coordinator = DataUpdateCoordinator::new(
        CoordinatorConfig::<usize>::new("flaky", device.clone())
            .with_update_interval(Duration::from_secs(10)),
    );
    let (notified, callback) = counter();
    let _listener = coordinator.add_listener(callback);

    advance(11).await;
    assert_eq!(device.calls(), 1);
    assert!(coordinator.last_update_success());

    // The second fetch panics and is recorded like any other failure
    advance(10).await;
    assert_eq!(device.calls(), 2);
    assert_eq!(notified.load(Ordering::SeqCst), 2);
    assert!(!coordinator.last_update_success());
    assert!(matches!(
        coordinator.last_exception(),
        Some(UpdateError::UpdateFailed(reason)) if reason.contains("panicked")
    ));
    assert_eq!(coordinator.data().as_deref(), Some(&1));
    assert!(coordinator.is_polling());
    assert!(!coordinator.is_refreshing());

    advance(10).await;
    assert_eq!(device.calls(), 3);
    assert!(coordinator.last_update_success());
    assert_eq!(coordinator.data().as_deref(), Some(&3));
}

#[tokio::test(start_paused = true)]
async fn test_listeners_see_their_own_cycle() {
    let device = Sequence::new(None);
    let coordinator =
        DataUpdateCoordinator::new(CoordinatorConfig::<usize>::new("sequence", device.clone()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let _listener = coordinator.add_listener({
        let coordinator = coordinator.clone();
        let seen = seen.clone();
        move || {
            let data = coordinator.data().map(|data| *data);
            seen.lock().unwrap().push((data, coordinator.is_refreshing()));
        }
    });

    coordinator.refresh().await.unwrap();
    coordinator.refresh().await.unwrap();

    // The cycle still owns the refresh slot while its listeners run
    assert_eq!(*seen.lock().unwrap(), vec![(Some(1), true), (Some(2), true)]);
    assert!(!coordinator.is_refreshing());
}

// ============================================================================
// First refresh
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_first_refresh_success() {
    let device = FakeDevice::new();
    let coordinator = coordinator(&device, Some(Duration::from_secs(30)));

    coordinator.first_refresh().await.unwrap();
    assert!(coordinator.last_update_success());
    assert_eq!(device.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_first_refresh_failure_is_not_ready() {
    let logs = LevelCounter::default();
    let _guard = logs.install();

    let device = FakeDevice::new();
    device.set_error(Some(UpdateError::failed("timeout")));
    let coordinator = coordinator(&device, Some(Duration::from_secs(30)));

    let err = coordinator.first_refresh().await.unwrap_err();
    assert_eq!(err, ConfigEntryError::NotReady("timeout".to_string()));
    assert!(err.is_retryable());
    assert_eq!(logs.warnings(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_first_refresh_auth_failure_stops_polling() {
    let hook_calls = Arc::new(AtomicUsize::new(0));
    let device = FakeDevice::new();
    device.set_error(Some(UpdateError::auth_failed("invalid token")));

    let coordinator = DataUpdateCoordinator::new(
        CoordinatorConfig::<Payload>::new("thermostat", device.clone())
            .with_update_interval(Duration::from_secs(10))
            .with_auth_failed_hook({
                let hook_calls = hook_calls.clone();
                move |_| {
                    hook_calls.fetch_add(1, Ordering::SeqCst);
                }
            }),
    );

    let err = coordinator.first_refresh().await.unwrap_err();
    assert!(err.is_auth_failed());

    let (_, callback) = counter();
    let _listener = coordinator.add_listener(callback);
    assert!(!coordinator.is_polling());

    advance(60).await;
    assert_eq!(device.calls(), 1);
    // Setup reports the failure itself
    assert_eq!(hook_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_first_refresh_after_shutdown_fails() {
    let device = FakeDevice::new();
    let coordinator = coordinator(&device, None);
    coordinator.shutdown();

    let err = coordinator.first_refresh().await.unwrap_err();
    assert!(matches!(err, ConfigEntryError::Failed(_)));
    assert_eq!(device.calls(), 0);
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_no_polling_without_listeners() {
    let device = FakeDevice::new();
    let coordinator = coordinator(&device, Some(Duration::from_secs(10)));

    advance(60).await;
    assert_eq!(device.calls(), 0);
    assert!(!coordinator.is_polling());
}

#[tokio::test(start_paused = true)]
async fn test_polls_while_listening() {
    let device = FakeDevice::new();
    let coordinator = coordinator(&device, Some(Duration::from_secs(10)));
    let (notified, callback) = counter();

    let listener = coordinator.add_listener(callback);
    assert!(coordinator.is_polling());

    advance(9).await;
    assert_eq!(device.calls(), 0);
    advance(2).await;
    assert_eq!(device.calls(), 1);
    advance(10).await;
    assert_eq!(device.calls(), 2);
    assert_eq!(notified.load(Ordering::SeqCst), 2);

    listener.remove();
    assert!(!coordinator.is_polling());
    advance(60).await;
    assert_eq!(device.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_add_then_remove_listener_never_fetches() {
    let device = FakeDevice::new();
    let coordinator = coordinator(&device, Some(Duration::from_secs(10)));
    let (_, callback) = counter();

    coordinator.add_listener(callback).remove();

    advance(60).await;
    assert_eq!(device.calls(), 0);
    assert_eq!(coordinator.listener_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_last_of_two_listeners_stops_polling() {
    let device = FakeDevice::new();
    let coordinator = coordinator(&device, Some(Duration::from_secs(10)));
    let (_, first) = counter();
    let (_, second) = counter();

    let first = coordinator.add_listener(first);
    let second = coordinator.add_listener(second);

    first.remove();
    assert!(coordinator.is_polling());
    second.remove();
    assert!(!coordinator.is_polling());
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_failures_keep_polling() {
    let device = FakeDevice::new();
    device.set_error(Some(UpdateError::failed("timeout")));
    let coordinator = coordinator(&device, Some(Duration::from_secs(10)));
    let (_, callback) = counter();
    let _listener = coordinator.add_listener(callback);

    advance(31).await;
    assert_eq!(device.calls(), 3);
    assert!(coordinator.is_polling());
}

#[tokio::test(start_paused = true)]
async fn test_next_tick_counts_from_cycle_end() {
    let device = FakeDevice::new();
    device.set_delay(Duration::from_secs(3));
    let coordinator = coordinator(&device, Some(Duration::from_secs(10)));
    let (_, callback) = counter();
    let _listener = coordinator.add_listener(callback);

    // Fetch starts at 10s and ends at 13s, so the next one starts at 23s
    advance(22).await;
    assert_eq!(device.calls(), 1);
    advance(2).await;
    assert_eq!(device.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_manual_refresh_without_interval() {
    let device = FakeDevice::new();
    let coordinator = coordinator(&device, None);
    let (_, callback) = counter();
    let _listener = coordinator.add_listener(callback);

    coordinator.refresh().await.unwrap();
    assert!(!coordinator.is_polling());

    advance(3600).await;
    assert_eq!(device.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_set_update_interval_reschedules_pending_tick() {
    let device = FakeDevice::new();
    let coordinator = coordinator(&device, Some(Duration::from_secs(30)));
    let (_, callback) = counter();
    let _listener = coordinator.add_listener(callback);

    // First cycle at 30s
    advance(31).await;
    assert_eq!(device.calls(), 1);

    coordinator.set_update_interval(Some(Duration::from_secs(5)));
    assert_eq!(coordinator.update_interval(), Some(Duration::from_secs(5)));

    // Next tick is 5s after the cycle that ended at 30s
    advance(3).await;
    assert_eq!(device.calls(), 1);
    advance(2).await;
    assert_eq!(device.calls(), 2);
    advance(5).await;
    assert_eq!(device.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_set_update_interval_none_stops_polling() {
    let device = FakeDevice::new();
    let coordinator = coordinator(&device, Some(Duration::from_secs(10)));
    let (_, callback) = counter();
    let _listener = coordinator.add_listener(callback);

    coordinator.set_update_interval(None);
    assert!(!coordinator.is_polling());

    advance(60).await;
    assert_eq!(device.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_set_update_interval_restarts_polling() {
    let device = FakeDevice::new();
    let coordinator = coordinator(&device, Some(Duration::from_secs(10)));
    let (_, callback) = counter();
    let _listener = coordinator.add_listener(callback);

    coordinator.set_update_interval(None);
    advance(60).await;
    assert_eq!(device.calls(), 0);

    coordinator.set_update_interval(Some(Duration::from_secs(5)));
    assert!(coordinator.is_polling());

    advance(6).await;
    assert_eq!(device.calls(), 1);
    advance(5).await;
    assert_eq!(device.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_set_update_interval_starts_polling_without_initial_interval() {
    let device = FakeDevice::new();
    let coordinator = coordinator(&device, None);
    let (_, callback) = counter();
    let _listener = coordinator.add_listener(callback);
    assert!(!coordinator.is_polling());

    coordinator.set_update_interval(Some(Duration::from_secs(5)));
    assert!(coordinator.is_polling());

    advance(6).await;
    assert_eq!(device.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_set_update_interval_without_listeners_does_not_poll() {
    let device = FakeDevice::new();
    let coordinator = coordinator(&device, None);

    coordinator.set_update_interval(Some(Duration::from_secs(5)));
    assert!(!coordinator.is_polling());

    advance(60).await;
    assert_eq!(device.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_set_updated_data_resets_schedule() {
    let device = FakeDevice::new();
    let coordinator = coordinator(&device, Some(Duration::from_secs(10)));
    let (notified, callback) = counter();
    let _listener = coordinator.add_listener(callback);

    advance(6).await;
    coordinator.set_updated_data(HashMap::from([("temp".to_string(), 21)]));

    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert!(coordinator.last_update_success());
    assert_eq!(coordinator.data().unwrap()["temp"], 21);

    // The tick moved from 10s to 16s
    advance(5).await;
    assert_eq!(device.calls(), 0);
    advance(6).await;
    assert_eq!(device.calls(), 1);
}

// ============================================================================
// Authentication failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_scheduled_auth_failure_calls_hook_and_stops() {
    let hook_calls = Arc::new(AtomicUsize::new(0));
    let device = FakeDevice::new();
    let coordinator = DataUpdateCoordinator::new(
        CoordinatorConfig::<Payload>::new("thermostat", device.clone())
            .with_update_interval(Duration::from_secs(10))
            .with_auth_failed_hook({
                let hook_calls = hook_calls.clone();
                move |err| {
                    assert!(err.is_auth_failed());
                    hook_calls.fetch_add(1, Ordering::SeqCst);
                }
            }),
    );
    coordinator.first_refresh().await.unwrap();

    let (_, callback) = counter();
    let _listener = coordinator.add_listener(callback);
    device.set_error(Some(UpdateError::auth_failed("token revoked")));

    advance(11).await;
    assert_eq!(device.calls(), 2);
    assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
    assert!(!coordinator.is_polling());

    advance(60).await;
    assert_eq!(device.calls(), 2);

    // New credentials: a successful refresh resumes polling
    device.set_error(None);
    coordinator.refresh().await.unwrap();
    assert!(coordinator.is_polling());
}

// ============================================================================
// Debounced requests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_debounced_requests_coalesce() {
    let device = FakeDevice::new();
    let coordinator = DataUpdateCoordinator::new(
        CoordinatorConfig::<Payload>::new("thermostat", device.clone())
            .with_request_refresh_debouncer(Duration::from_secs(10), true),
    );

    coordinator.request_refresh().await.unwrap();
    assert_eq!(device.calls(), 1);

    coordinator.request_refresh().await.unwrap();
    coordinator.request_refresh().await.unwrap();
    assert_eq!(device.calls(), 1);

    advance(11).await;
    assert_eq!(device.calls(), 2);

    // Direct refreshes bypass the cooldown
    coordinator.refresh().await.unwrap();
    assert_eq!(device.calls(), 3);
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_everything() {
    let device = FakeDevice::new();
    let coordinator = DataUpdateCoordinator::new(
        CoordinatorConfig::<Payload>::new("thermostat", device.clone())
            .with_update_interval(Duration::from_secs(10))
            .with_request_refresh_debouncer(Duration::from_secs(10), true),
    );
    let (_, callback) = counter();
    let _listener = coordinator.add_listener(callback);

    coordinator.shutdown();
    assert!(coordinator.is_shutdown());
    assert!(!coordinator.is_polling());

    // Both paths agree once shut down
    assert_eq!(coordinator.request_refresh().await, Ok(()));
    assert_eq!(coordinator.refresh().await, Ok(()));

    advance(60).await;
    assert_eq!(device.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_during_fetch_lets_it_finish() {
    let device = FakeDevice::new();
    device.set_delay(Duration::from_secs(5));
    let coordinator = coordinator(&device, Some(Duration::from_secs(10)));
    let (notified, callback) = counter();
    let _listener = coordinator.add_listener(callback);

    let refresh = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.refresh().await }
    });
    advance(1).await;
    coordinator.shutdown();

    refresh.await.unwrap().unwrap();
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert!(!coordinator.is_polling());

    advance(60).await;
    assert_eq!(device.calls(), 1);
}
