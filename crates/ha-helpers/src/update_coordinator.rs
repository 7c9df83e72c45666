//! Polling data update coordinator
//!
//! A [`DataUpdateCoordinator`] owns the refresh cycle of one connection:
//! it calls the integration's [`UpdateMethod`] on a fixed interval or on
//! demand, keeps the last payload and the last error, and notifies every
//! registered listener after each completed cycle. Entities read the
//! coordinator's data instead of fetching per entity.
//!
//! # Cycle guarantees
//!
//! - At most one fetch is in flight. Refresh requests made while a cycle is
//!   running wait for that cycle and resolve with its outcome.
//! - A cycle stores its payload and success flag before any listener runs,
//!   so a listener always observes the cycle that notified it.
//! - Failures of scheduled cycles become state (`last_update_success`,
//!   `last_exception`) and never stop the schedule, except authentication
//!   failures, which stop polling until a refresh succeeds again.
//! - Polling only happens while at least one listener is registered.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use ha_core::ConfigEntryError;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::debounce::Debouncer;
use crate::event::{self, ScheduledCall};
use crate::listeners::{ListenerId, ListenerRegistry};
use crate::sync::lock;

/// Cooldown commonly used for request-refresh debouncing
pub const REQUEST_REFRESH_DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

/// Failure of an update method
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UpdateError {
    /// Transient failure: network, protocol, rate limit
    #[error("{0}")]
    UpdateFailed(String),

    /// Credentials were rejected
    #[error("authentication failed: {0}")]
    AuthFailed(String),
}

impl UpdateError {
    pub fn failed(reason: impl fmt::Display) -> Self {
        UpdateError::UpdateFailed(reason.to_string())
    }

    pub fn auth_failed(reason: impl fmt::Display) -> Self {
        UpdateError::AuthFailed(reason.to_string())
    }

    pub fn is_auth_failed(&self) -> bool {
        matches!(self, UpdateError::AuthFailed(_))
    }
}

impl From<UpdateError> for ConfigEntryError {
    /// Setup-time view of a failed first refresh
    fn from(err: UpdateError) -> Self {
        match err {
            UpdateError::AuthFailed(reason) => ConfigEntryError::AuthFailed(reason),
            UpdateError::UpdateFailed(reason) => ConfigEntryError::NotReady(reason),
        }
    }
}

/// Fetches one payload from a device or service
///
/// Implementations enforce their own timeouts; the coordinator waits for
/// as long as the fetch takes.
#[async_trait]
pub trait UpdateMethod<T>: Send + Sync {
    async fn update(&self) -> Result<T, UpdateError>;
}

struct FnUpdateMethod<F>(F);

#[async_trait]
impl<T, F, Fut> UpdateMethod<T> for FnUpdateMethod<F>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, UpdateError>> + Send,
{
    async fn update(&self) -> Result<T, UpdateError> {
        (self.0)().await
    }
}

/// Use an async closure as an update method
pub fn update_method_fn<T, F, Fut>(function: F) -> Arc<dyn UpdateMethod<T>>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, UpdateError>> + Send + 'static,
{
    Arc::new(FnUpdateMethod(function))
}

type AuthFailedHook = Arc<dyn Fn(&UpdateError) + Send + Sync>;

/// Construction parameters of a coordinator
pub struct CoordinatorConfig<T> {
    name: String,
    update_method: Arc<dyn UpdateMethod<T>>,
    update_interval: Option<Duration>,
    request_refresh_debouncer: Option<(Duration, bool)>,
    on_auth_failed: Option<AuthFailedHook>,
}

impl<T: Send + 'static> CoordinatorConfig<T> {
    /// A coordinator without an interval; it refreshes only on request
    pub fn new(name: impl Into<String>, update_method: Arc<dyn UpdateMethod<T>>) -> Self {
        Self {
            name: name.into(),
            update_method,
            update_interval: None,
            request_refresh_debouncer: None,
            on_auth_failed: None,
        }
    }

    /// Shorthand for [`new`](Self::new) with [`update_method_fn`]
    pub fn from_fn<F, Fut>(name: impl Into<String>, function: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, UpdateError>> + Send + 'static,
    {
        Self::new(name, update_method_fn(function))
    }

    /// Poll every `interval` while listeners are registered
    pub fn with_update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = Some(interval);
        self
    }

    /// Route [`DataUpdateCoordinator::request_refresh`] through a [`Debouncer`]
    pub fn with_request_refresh_debouncer(mut self, cooldown: Duration, immediate: bool) -> Self {
        self.request_refresh_debouncer = Some((cooldown, immediate));
        self
    }

    /// Called when a non-setup refresh fails authentication
    ///
    /// The setup layer uses this to start a re-authentication flow.
    pub fn with_auth_failed_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&UpdateError) + Send + Sync + 'static,
    {
        self.on_auth_failed = Some(Arc::new(hook));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshKind {
    /// Awaited during config entry setup; failures are the caller's to report
    First,
    Scheduled,
    Requested,
}

type RefreshFuture = Shared<BoxFuture<'static, Result<(), UpdateError>>>;

struct CoordinatorState<T> {
    data: Option<Arc<T>>,
    last_exception: Option<UpdateError>,
    last_update_success: bool,
    last_update_success_time: Option<DateTime<Utc>>,
    /// Outcome of the previous cycle, `None` before the first one
    previous_success: Option<bool>,
    auth_failed: bool,
}

#[derive(Default)]
struct RefreshSlot {
    generation: u64,
    in_flight: Option<RefreshFuture>,
}

#[derive(Default)]
struct Schedule {
    update_interval: Option<Duration>,
    pending: Option<ScheduledCall>,
    last_cycle_finished: Option<Instant>,
    shutdown: bool,
}

struct Inner<T> {
    name: String,
    update_method: Arc<dyn UpdateMethod<T>>,
    state: Mutex<CoordinatorState<T>>,
    listeners: ListenerRegistry,
    refresh: Mutex<RefreshSlot>,
    schedule: Mutex<Schedule>,
    debouncer: Option<Debouncer>,
    on_auth_failed: Option<AuthFailedHook>,
}

/// Polls one data source and fans the result out to listeners
///
/// Cloning is cheap and every clone drives the same coordinator. Entities
/// receive a clone at construction.
pub struct DataUpdateCoordinator<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for DataUpdateCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> DataUpdateCoordinator<T> {
    /// Create a coordinator; nothing is fetched until the first refresh
    pub fn new(config: CoordinatorConfig<T>) -> Self {
        let debouncer = config
            .request_refresh_debouncer
            .map(|(cooldown, immediate)| {
                Debouncer::new(format!("{} request refresh", config.name), cooldown, immediate)
            });

        let inner = Arc::new(Inner {
            name: config.name,
            update_method: config.update_method,
            state: Mutex::new(CoordinatorState {
                data: None,
                last_exception: None,
                last_update_success: false,
                last_update_success_time: None,
                previous_success: None,
                auth_failed: false,
            }),
            listeners: ListenerRegistry::new(),
            refresh: Mutex::new(RefreshSlot::default()),
            schedule: Mutex::new(Schedule {
                update_interval: config.update_interval,
                ..Schedule::default()
            }),
            debouncer,
            on_auth_failed: config.on_auth_failed,
        });

        if let Some(debouncer) = &inner.debouncer {
            let weak = Arc::downgrade(&inner);
            debouncer.set_function(move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        let _ = Self { inner }.refresh_as(RefreshKind::Requested).await;
                    }
                }
            });
        }

        Self { inner }
    }

    /// Name used in diagnostics
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Payload of the last successful cycle, kept across failures
    pub fn data(&self) -> Option<Arc<T>> {
        lock(&self.inner.state).data.clone()
    }

    /// Whether the last cycle succeeded; `false` until the first success
    pub fn last_update_success(&self) -> bool {
        lock(&self.inner.state).last_update_success
    }

    /// When the last successful cycle completed
    pub fn last_update_success_time(&self) -> Option<DateTime<Utc>> {
        lock(&self.inner.state).last_update_success_time
    }

    /// Error of the last cycle, cleared by the next success
    pub fn last_exception(&self) -> Option<UpdateError> {
        lock(&self.inner.state).last_exception.clone()
    }

    pub fn update_interval(&self) -> Option<Duration> {
        lock(&self.inner.schedule).update_interval
    }

    pub fn listener_count(&self) -> usize {
        self.inner.listeners.len()
    }

    /// Whether a fetch is in flight
    pub fn is_refreshing(&self) -> bool {
        lock(&self.inner.refresh).in_flight.is_some()
    }

    /// Whether a scheduled tick is pending
    pub fn is_polling(&self) -> bool {
        lock(&self.inner.schedule).pending.is_some()
    }

    pub fn is_shutdown(&self) -> bool {
        lock(&self.inner.schedule).shutdown
    }

    /// Register a callback invoked after every completed cycle
    ///
    /// The first listener starts polling when an update interval is set.
    /// Keep the returned handle and [`remove`](ListenerHandle::remove) it
    /// when the listener goes away; removing the last listener stops
    /// polling.
    pub fn add_listener<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (id, first) = self.inner.listeners.add(callback);
        if first {
            self.inner.schedule_refresh_at(Instant::now());
        }

        let owner = Arc::downgrade(&self.inner);
        let owner: Weak<dyn ListenerOwner> = owner;
        ListenerHandle { owner, id }
    }

    /// Ask for fresh data
    ///
    /// Without a debouncer this joins the cycle in flight or starts one, and
    /// resolves with that cycle's outcome. With a debouncer the request may
    /// be deferred to the end of the cooldown; the coordinator's current
    /// outcome is returned. After [`shutdown`](Self::shutdown) this does
    /// nothing and returns `Ok(())`, like [`refresh`](Self::refresh).
    pub async fn request_refresh(&self) -> Result<(), UpdateError> {
        match &self.inner.debouncer {
            Some(_) if self.is_shutdown() => {
                debug!(name = %self.inner.name, "Refresh request ignored after shutdown");
                Ok(())
            }
            Some(debouncer) => {
                debouncer.async_call().await;
                self.current_outcome()
            }
            None => self.refresh_as(RefreshKind::Requested).await,
        }
    }

    /// Refresh now, bypassing any debouncer
    pub async fn refresh(&self) -> Result<(), UpdateError> {
        self.refresh_as(RefreshKind::Requested).await
    }

    /// Initial refresh during config entry setup
    ///
    /// An authentication failure becomes [`ConfigEntryError::AuthFailed`] so
    /// the caller can start re-authentication; any other failure becomes
    /// [`ConfigEntryError::NotReady`] so the caller can retry setup later.
    /// Neither is logged as a warning here, the caller reports them.
    pub async fn first_refresh(&self) -> Result<(), ConfigEntryError> {
        if self.is_shutdown() {
            return Err(ConfigEntryError::Failed(format!(
                "coordinator {} is shut down",
                self.inner.name
            )));
        }
        self.refresh_as(RefreshKind::First)
            .await
            .map_err(ConfigEntryError::from)
    }

    /// Hand in a payload obtained without fetching, e.g. from a push message
    ///
    /// Treated like a successful cycle: data and success state are stored,
    /// listeners notified and the next tick rescheduled from now.
    pub fn set_updated_data(&self, data: T) {
        self.inner.cancel_scheduled_tick();
        self.inner.store_success(data);
        let now = Instant::now();
        lock(&self.inner.schedule).last_cycle_finished = Some(now);
        self.inner.listeners.notify_all();
        self.inner.schedule_refresh_at(now);
    }

    /// Change the polling interval
    ///
    /// The next tick is placed `new interval` after the last completed
    /// cycle, or after now if none has run, which also restarts polling
    /// that was stopped with `None`. A cycle in flight schedules its
    /// successor with the new interval. `None` stops polling.
    pub fn set_update_interval(&self, interval: Option<Duration>) {
        let last_finished = {
            let mut schedule = lock(&self.inner.schedule);
            schedule.update_interval = interval;
            schedule.last_cycle_finished
        };
        debug!(name = %self.inner.name, ?interval, "Update interval changed");

        if interval.is_none() {
            self.inner.cancel_scheduled_tick();
        } else {
            // A tick firing while a cycle is in flight joins that cycle
            self.inner
                .schedule_refresh_at(last_finished.unwrap_or_else(Instant::now));
        }
    }

    /// Stop polling for good
    ///
    /// Cancels the pending tick and any debounced request. A fetch already
    /// in flight runs to completion and its waiters resolve normally, but
    /// no further cycle is started.
    pub fn shutdown(&self) {
        {
            let mut schedule = lock(&self.inner.schedule);
            schedule.shutdown = true;
            if let Some(pending) = schedule.pending.take() {
                pending.cancel();
            }
        }
        if let Some(debouncer) = &self.inner.debouncer {
            debouncer.async_shutdown();
        }
        debug!(name = %self.inner.name, "Coordinator shut down");
    }

    fn current_outcome(&self) -> Result<(), UpdateError> {
        let state = lock(&self.inner.state);
        if state.last_update_success {
            return Ok(());
        }
        Err(state
            .last_exception
            .clone()
            .unwrap_or_else(|| UpdateError::failed("no successful refresh yet")))
    }

    async fn refresh_as(&self, kind: RefreshKind) -> Result<(), UpdateError> {
        if self.is_shutdown() {
            debug!(name = %self.inner.name, ?kind, "Refresh ignored after shutdown");
            return Ok(());
        }
        self.join_or_start_cycle(kind).await
    }

    fn join_or_start_cycle(&self, kind: RefreshKind) -> RefreshFuture {
        let mut slot = lock(&self.inner.refresh);
        if let Some(in_flight) = &slot.in_flight {
            trace!(name = %self.inner.name, ?kind, "Joining refresh in flight");
            return in_flight.clone();
        }

        slot.generation += 1;
        let generation = slot.generation;
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(inner.run_cycle(kind, generation));

        let cycle = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(err) => Err(UpdateError::failed(format!("refresh task failed: {err}"))),
            }
        }
        .boxed()
        .shared();

        slot.in_flight = Some(cycle.clone());
        cycle
    }
}

impl<T: Send + Sync + 'static> Inner<T> {
    /// One refresh cycle: fetch, store, notify, reschedule
    async fn run_cycle(self: Arc<Self>, kind: RefreshKind, generation: u64) -> Result<(), UpdateError> {
        let in_flight = InFlight {
            slot: &self.refresh,
            generation,
        };
        // The successor is scheduled when this cycle completes
        self.cancel_scheduled_tick();

        let started = Instant::now();
        let fetched = AssertUnwindSafe(self.update_method.update())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(UpdateError::failed(format!(
                    "update method panicked: {}",
                    panic_message(panic.as_ref())
                )))
            });
        let outcome = match fetched {
            Ok(data) => {
                self.store_success(data);
                Ok(())
            }
            Err(err) => {
                self.store_failure(&err, kind);
                Err(err)
            }
        };
        let finished = Instant::now();
        lock(&self.schedule).last_cycle_finished = Some(finished);

        debug!(
            name = %self.name,
            ?kind,
            success = outcome.is_ok(),
            elapsed_ms = finished.duration_since(started).as_millis() as u64,
            "Finished fetching data"
        );

        // Listeners run while the slot is held; no later cycle can store
        // its payload underneath them
        self.listeners.notify_all();

        if let Err(err) = &outcome {
            if err.is_auth_failed() && kind != RefreshKind::First {
                if let Some(hook) = &self.on_auth_failed {
                    hook(err);
                }
            }
        }
        self.schedule_refresh_at(finished);
        drop(in_flight);

        outcome
    }

    fn store_success(&self, data: T) {
        let recovered = {
            let mut state = lock(&self.state);
            let recovered = state.previous_success == Some(false);
            state.data = Some(Arc::new(data));
            state.last_exception = None;
            state.last_update_success = true;
            state.last_update_success_time = Some(Utc::now());
            state.previous_success = Some(true);
            state.auth_failed = false;
            recovered
        };

        if recovered {
            info!(name = %self.name, "Fetching data recovered");
        }
    }

    fn store_failure(&self, err: &UpdateError, kind: RefreshKind) {
        let newly_failing = {
            let mut state = lock(&self.state);
            let newly_failing = state.previous_success != Some(false);
            state.last_exception = Some(err.clone());
            state.last_update_success = false;
            state.previous_success = Some(false);
            state.auth_failed = err.is_auth_failed();
            newly_failing
        };

        if kind == RefreshKind::First || !newly_failing {
            debug!(name = %self.name, ?kind, error = %err, "Error fetching data");
        } else if err.is_auth_failed() {
            warn!(name = %self.name, error = %err, "Authentication failed while fetching data");
        } else {
            warn!(name = %self.name, error = %err, "Error fetching data");
        }
    }

    fn cancel_scheduled_tick(&self) {
        if let Some(pending) = lock(&self.schedule).pending.take() {
            pending.cancel();
        }
    }

    /// Replace the pending tick with one at `base + update_interval`
    ///
    /// No tick is scheduled after shutdown, after an authentication
    /// failure, without listeners or without an interval.
    fn schedule_refresh_at(self: &Arc<Self>, base: Instant) {
        let auth_failed = lock(&self.state).auth_failed;
        let mut schedule = lock(&self.schedule);
        if let Some(pending) = schedule.pending.take() {
            pending.cancel();
        }

        let Some(interval) = schedule.update_interval else {
            return;
        };
        if schedule.shutdown || auth_failed || self.listeners.is_empty() {
            return;
        }

        let weak = Arc::downgrade(self);
        schedule.pending = Some(event::call_at(base + interval, move || async move {
            if let Some(inner) = weak.upgrade() {
                let coordinator = DataUpdateCoordinator { inner };
                let _ = coordinator.refresh_as(RefreshKind::Scheduled).await;
            }
        }));
        trace!(name = %self.name, ?interval, "Next refresh scheduled");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Clears the in-flight slot when a cycle ends, including by panic
struct InFlight<'a> {
    slot: &'a Mutex<RefreshSlot>,
    generation: u64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut slot = lock(self.slot);
        if slot.generation == self.generation {
            slot.in_flight = None;
        }
    }
}

trait ListenerOwner: Send + Sync {
    fn remove_listener(&self, id: ListenerId);
}

impl<T: Send + Sync + 'static> ListenerOwner for Inner<T> {
    fn remove_listener(&self, id: ListenerId) {
        if self.listeners.remove(id) == Some(true) {
            trace!(name = %self.name, "Last listener removed, polling stopped");
            self.cancel_scheduled_tick();
        }
    }
}

/// Registration of a coordinator listener
#[must_use = "the listener stays registered until the handle is removed"]
pub struct ListenerHandle {
    owner: Weak<dyn ListenerOwner>,
    id: ListenerId,
}

impl ListenerHandle {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Unregister the listener; a no-op if the coordinator is gone
    pub fn remove(self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.remove_listener(self.id);
        }
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerHandle").field("id", &self.id).finish()
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for DataUpdateCoordinator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataUpdateCoordinator")
            .field("name", &self.inner.name)
            .field("last_update_success", &self.last_update_success())
            .field("update_interval", &self.update_interval())
            .field("listeners", &self.listener_count())
            .finish()
    }
}
