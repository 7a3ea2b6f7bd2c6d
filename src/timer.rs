use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

pub type TaskFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Body of a periodic job. Invoked once per tick; must not assume exactly-once delivery.
pub type PeriodicTask = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// A cancelable registration returned by the timer and activity ports.
///
/// Dropping it cancels the registration.
pub struct Registration {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Registration {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn from_task(handle: JoinHandle<()>) -> Self {
        Self::new(move || handle.abort())
    }

    /// Chains two registrations so they are cancelled together.
    pub fn join(self, other: Registration) -> Self {
        Self::new(move || {
            drop(self);
            drop(other);
        })
    }

    pub fn cancel(mut self) {
        self.run_cancel();
    }

    fn run_cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.run_cancel();
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration").field("armed", &self.cancel.is_some()).finish()
    }
}

pub trait Scheduler: Send + Sync {
    fn schedule_periodic(&self, interval: Duration, task: PeriodicTask) -> Registration;
}

/// Scheduler backed by `tokio::time::interval`. Must be used from within a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule_periodic(&self, interval: Duration, task: PeriodicTask) -> Registration {
        let handle = tokio::spawn(async move {
            // First tick fires one interval from now, not immediately.
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                task().await;
            }
        });
        debug!(interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX), "periodic task scheduled");

        Registration::from_task(handle)
    }
}
