//! Cooldown-based call coalescing
//!
//! A [`Debouncer`] wraps an async function. In immediate mode the first
//! call runs right away and opens a cooldown; calls made during the
//! cooldown collapse into a single run when it ends. In deferred mode every
//! call waits for the end of a cooldown.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tracing::debug;

use crate::event::{self, ScheduledCall};
use crate::sync::lock;

type DebouncedFunction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Coalesces bursts of calls to an async function
#[derive(Clone)]
pub struct Debouncer {
    inner: Arc<DebouncerInner>,
}

struct DebouncerInner {
    name: String,
    cooldown: Duration,
    immediate: bool,
    function: Mutex<Option<DebouncedFunction>>,
    timer: Mutex<Option<ScheduledCall>>,
    execute_at_end_of_timer: AtomicBool,
    execute_lock: tokio::sync::Mutex<()>,
    shutdown: AtomicBool,
}

impl Debouncer {
    /// Create a debouncer without a function; see [`set_function`](Self::set_function)
    pub fn new(name: impl Into<String>, cooldown: Duration, immediate: bool) -> Self {
        Self {
            inner: Arc::new(DebouncerInner {
                name: name.into(),
                cooldown,
                immediate,
                function: Mutex::new(None),
                timer: Mutex::new(None),
                execute_at_end_of_timer: AtomicBool::new(false),
                execute_lock: tokio::sync::Mutex::new(()),
                shutdown: AtomicBool::new(false),
            }),
        }
    }

    /// Set the function being debounced
    pub fn set_function<F, Fut>(&self, function: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let function: DebouncedFunction = Arc::new(move || function().boxed());
        *lock(&self.inner.function) = Some(function);
    }

    /// Cooldown between two runs
    pub fn cooldown(&self) -> Duration {
        self.inner.cooldown
    }

    /// Request a run
    ///
    /// Returns once the function ran, when running immediately, or as soon
    /// as the run is deferred to the end of the cooldown.
    pub async fn async_call(&self) {
        let inner = &self.inner;
        if inner.shutdown.load(Ordering::SeqCst) {
            debug!(debouncer = %inner.name, "Call ignored after shutdown");
            return;
        }

        if inner.timer_active() {
            inner.execute_at_end_of_timer.store(true, Ordering::SeqCst);
            return;
        }

        if !inner.immediate {
            inner.execute_at_end_of_timer.store(true, Ordering::SeqCst);
            inner.schedule_timer();
            return;
        }

        let Ok(_guard) = inner.execute_lock.try_lock() else {
            inner.execute_at_end_of_timer.store(true, Ordering::SeqCst);
            return;
        };

        inner.run_function().await;
        inner.schedule_timer();
    }

    /// Cancel a pending trailing run
    pub fn async_cancel(&self) {
        if let Some(timer) = lock(&self.inner.timer).take() {
            timer.cancel();
        }
        self.inner
            .execute_at_end_of_timer
            .store(false, Ordering::SeqCst);
    }

    /// Cancel pending work and ignore every later call
    pub fn async_shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.async_cancel();
    }
}

impl DebouncerInner {
    fn timer_active(&self) -> bool {
        lock(&self.timer).is_some()
    }

    async fn run_function(&self) {
        let function = lock(&self.function).clone();
        match function {
            Some(function) => function().await,
            None => debug!(debouncer = %self.name, "No function set"),
        }
    }

    fn schedule_timer(self: &Arc<Self>) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let weak = Arc::downgrade(self);
        let timer = event::call_later(self.cooldown, move || async move {
            if let Some(inner) = weak.upgrade() {
                inner.on_timer_finished().await;
            }
        });

        if let Some(previous) = lock(&self.timer).replace(timer) {
            previous.cancel();
        }
    }

    async fn on_timer_finished(self: Arc<Self>) {
        lock(&self.timer).take();

        if !self.execute_at_end_of_timer.swap(false, Ordering::SeqCst) {
            return;
        }

        // A run is already underway; it opens a new cooldown when done
        let Ok(_guard) = self.execute_lock.try_lock() else {
            return;
        };
        if self.timer_active() {
            return;
        }

        debug!(debouncer = %self.name, "Running deferred call");
        self.run_function().await;
        self.schedule_timer();
    }
}

impl fmt::Debug for Debouncer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Debouncer")
            .field("name", &self.inner.name)
            .field("cooldown", &self.inner.cooldown)
            .field("immediate", &self.inner.immediate)
            .finish()
    }
}
