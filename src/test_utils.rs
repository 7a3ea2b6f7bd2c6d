use crate::clock::ManualClock;
use crate::config::Config;
use crate::coordinator::{Ports, SessionCoordinator};
use crate::error::store_error::StoreError;
use crate::models::event::SessionEvent;
use crate::store::{MemoryStore, PersistentStore};
use crate::timer::{PeriodicTask, Registration, Scheduler};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast};

struct ScheduledTask {
    task: PeriodicTask,
    cancelled: Arc<AtomicBool>,
}

/// Scheduler whose ticks are driven by the test instead of by time.
#[derive(Default)]
pub struct ManualScheduler {
    tasks: Mutex<Vec<ScheduledTask>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every live task once, in registration order.
    pub async fn tick(&self) {
        let tasks: Vec<PeriodicTask> = self
            .tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|scheduled| !scheduled.cancelled.load(Ordering::SeqCst))
            .map(|scheduled| scheduled.task.clone())
            .collect();

        for task in tasks {
            task().await;
        }
    }

    pub fn active_count(&self) -> usize {
        self.tasks
            .lock()
            .unwrap()
            .iter()
            .filter(|scheduled| !scheduled.cancelled.load(Ordering::SeqCst))
            .count()
    }

    pub fn registered_count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule_periodic(&self, _interval: Duration, task: PeriodicTask) -> Registration {
        let cancelled = Arc::new(AtomicBool::new(false));
        self.tasks.lock().unwrap().push(ScheduledTask {
            task,
            cancelled: cancelled.clone(),
        });

        Registration::new(move || cancelled.store(true, Ordering::SeqCst))
    }
}

/// In-memory store that can be switched into a failing mode.
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Reads a record regardless of the failing mode.
    pub async fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.get(key).await.unwrap()
    }

    /// Writes a record regardless of the failing mode.
    pub async fn put(&self, key: &str, value: &[u8]) {
        self.inner.set(key, value).await.unwrap();
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store switched off by test".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PersistentStore for FailingStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.check()?;
        self.inner.delete(key).await
    }
}

/// In-memory store whose writes park until the gate is opened. Deletes and reads pass through.
pub struct GatedStore {
    inner: MemoryStore,
    closed: AtomicBool,
    gate: Semaphore,
    waiting: AtomicUsize,
}

impl Default for GatedStore {
    fn default() -> Self {
        Self {
            inner: MemoryStore::new(),
            closed: AtomicBool::new(false),
            gate: Semaphore::new(0),
            waiting: AtomicUsize::new(0),
        }
    }
}

impl GatedStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn open(&self) {
        self.closed.store(false, Ordering::SeqCst);
        self.gate.add_permits(1);
    }

    /// Writes currently parked at the gate.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub async fn raw(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.get(key).await.unwrap()
    }
}

#[async_trait]
impl PersistentStore for GatedStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) {
            self.waiting.fetch_add(1, Ordering::SeqCst);
            let _permit = self.gate.acquire().await.unwrap();
            self.waiting.fetch_sub(1, Ordering::SeqCst);
        }
        self.inner.set(key, value).await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.inner.delete(key).await
    }
}

/// A coordinator wired to a manual clock starting at the Unix epoch, a manual scheduler and
/// a switchable in-memory store.
pub struct Harness {
    pub config: Config,
    pub clock: Arc<ManualClock>,
    pub store: Arc<FailingStore>,
    pub scheduler: Arc<ManualScheduler>,
    pub coordinator: SessionCoordinator,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(Config::default()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let clock = Arc::new(ManualClock::at_epoch());
        let store = Arc::new(FailingStore::new());
        let scheduler = Arc::new(ManualScheduler::new());
        let ports = Ports {
            clock: clock.clone(),
            store: store.clone(),
            scheduler: scheduler.clone(),
        };
        let coordinator = SessionCoordinator::open(&config, ports).await.unwrap();

        Self {
            config,
            clock,
            store,
            scheduler,
            coordinator,
        }
    }

    /// Opens a second coordinator over the same store and clock, as a restarted process would.
    pub async fn reopen(&self) -> SessionCoordinator {
        let ports = Ports {
            clock: self.clock.clone(),
            store: self.store.clone(),
            scheduler: self.scheduler.clone(),
        };
        SessionCoordinator::open(&self.config, ports).await.unwrap()
    }

    pub async fn stored<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.store.raw(key).await?;
        Some(serde_json::from_slice(&bytes).unwrap())
    }
}

/// Gives spawned tasks on the current-thread runtime a chance to run until they block.
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

pub fn drain_events(receiver: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    events
}
