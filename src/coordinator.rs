//! Public facade over the session state machine and the attempt ledger.
//!
//! Locking: the session machine and the ledger each sit behind one `tokio::sync::Mutex`.
//! Locks are always taken in the order `session -> activity_source -> guards` and
//! `session -> ledger`. State is mutated first; the matching writer lock is acquired before
//! the state lock is released and held across the store I/O, so records reach the store in
//! the same order the mutations happened without blocking readers on I/O.

use crate::activity::{ActivityCallback, ActivitySource};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, SessionPolicy};
use crate::error::app_error::SessionError;
use crate::error::store_error::StoreError;
use crate::ledger::{AttemptLedger, LedgerRestore};
use crate::models::activity::ActivityEvent;
use crate::models::event::SessionEvent;
use crate::models::login_attempt::{LockoutStatus, LoginAttempt};
use crate::models::session::{Session, SessionSnapshot, default_device_info};
use crate::session::{SessionMachine, Transition};
use crate::store::PersistentStore;
use crate::timer::{PeriodicTask, Registration, Scheduler, TaskFuture, TokioScheduler};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, MutexGuard, broadcast, mpsc, watch};
use tracing::{debug, info, trace, warn};

const EVENT_CAPACITY: usize = 64;

/// External collaborators the coordinator is wired to.
#[derive(Clone)]
pub struct Ports {
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn PersistentStore>,
    pub scheduler: Arc<dyn Scheduler>,
}

impl Ports {
    /// Wall clock and tokio timers around the given store.
    pub fn system(store: Arc<dyn PersistentStore>) -> Self {
        Self {
            clock: Arc::new(SystemClock),
            store,
            scheduler: Arc::new(TokioScheduler),
        }
    }
}

/// Durability of a mutating operation. In-memory state is authoritative in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Persisted,
    NoOp,
    Degraded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionRestore {
    #[default]
    Absent,
    Restored,
    Expired,
    Corrupt,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RestoreReport {
    pub session: SessionRestore,
    pub ledger: LedgerRestore,
    pub ledger_corrupt: bool,
    /// The attempt history could not be read. It is loaded and merged on first use instead,
    /// and nothing is written to the attempts key until that succeeds.
    pub ledger_unavailable: bool,
}

#[derive(Debug, Clone, Copy)]
enum CloseReason {
    Ended,
    Expired,
}

enum Loaded<T> {
    Missing,
    Unavailable,
    Corrupt,
    Value(T),
}

/// Registrations that live exactly as long as the active session.
#[derive(Debug, Default)]
struct SessionGuards {
    timer: Option<Registration>,
    activity: Option<Registration>,
}

struct Inner {
    policy: SessionPolicy,
    activity_events: Vec<ActivityEvent>,
    session_key: String,
    attempts_key: String,
    clock: Arc<dyn Clock>,
    store: Arc<dyn PersistentStore>,
    scheduler: Arc<dyn Scheduler>,
    session: Mutex<SessionMachine>,
    ledger: Mutex<AttemptLedger>,
    /// Whether the persisted attempt history has been read. Only changes under the ledger lock.
    ledger_loaded: AtomicBool,
    session_writer: Mutex<()>,
    ledger_writer: Mutex<()>,
    activity_source: Mutex<Option<Arc<dyn ActivitySource>>>,
    guards: Mutex<SessionGuards>,
    snapshot: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    restore_report: OnceLock<RestoreReport>,
}

/// Owns the single session and the attempt ledger. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionCoordinator {
    inner: Arc<Inner>,
}

impl SessionCoordinator {
    /// Builds a coordinator and restores any persisted session and attempt history.
    pub async fn open(config: &Config, ports: Ports) -> Result<Self, SessionError> {
        config.validate()?;

        let policy = config.policy.clone();
        let (snapshot, _) = watch::channel(SessionSnapshot::empty());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let coordinator = Self {
            inner: Arc::new(Inner {
                session: Mutex::new(SessionMachine::new(&policy)),
                ledger: Mutex::new(AttemptLedger::new(&policy)),
                ledger_loaded: AtomicBool::new(false),
                policy,
                activity_events: config.activity.events.clone(),
                session_key: config.storage.session_key.clone(),
                attempts_key: config.storage.attempts_key.clone(),
                clock: ports.clock,
                store: ports.store,
                scheduler: ports.scheduler,
                session_writer: Mutex::new(()),
                ledger_writer: Mutex::new(()),
                activity_source: Mutex::new(None),
                guards: Mutex::new(SessionGuards::default()),
                snapshot,
                events,
                restore_report: OnceLock::new(),
            }),
        };

        let report = coordinator.restore().await;
        let _ = coordinator.inner.restore_report.set(report);

        Ok(coordinator)
    }

    pub fn policy(&self) -> &SessionPolicy {
        &self.inner.policy
    }

    pub fn restore_report(&self) -> RestoreReport {
        self.inner.restore_report.get().copied().unwrap_or_default()
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    // ---- session lifecycle ----

    pub async fn start_session(&self, identity: &str, remember: bool) -> Result<Session, SessionError> {
        self.start_session_with_device(identity, remember, default_device_info()).await
    }

    /// Starts a session and records a successful attempt for `identity`.
    ///
    /// Callers must not record the success themselves. A previous session that has already
    /// expired (but not yet been swept by the periodic check) is closed first; a still valid
    /// one makes this fail with [`SessionError::SessionAlreadyActive`].
    pub async fn start_session_with_device(&self, identity: &str, remember: bool, device_info: String) -> Result<Session, SessionError> {
        let inner = &self.inner;
        let mut machine = inner.session.lock().await;
        let now = inner.clock.now();

        if let Transition::Expired(stale) = machine.check_expiry(now) {
            info!(identity = %stale.identity, "expired session replaced by a new login");
            self.publish(SessionEvent::Expired { identity: stale.identity });
        }

        let session = machine.start(identity, remember, device_info, now)?;
        let payload = encode(&inner.session_key, &session);

        let guards = self.arm().await;
        let previous = std::mem::replace(&mut *inner.guards.lock().await, guards);

        let writer = inner.session_writer.lock().await;
        inner.snapshot.send_replace(machine.snapshot(now));
        drop(machine);

        self.write_record(&inner.session_key, payload, writer).await;
        drop(previous);

        info!(
            identity = %session.identity,
            remember,
            expires_at = %session.expires_at,
            "session started"
        );
        self.publish(SessionEvent::Started {
            identity: session.identity.clone(),
            expires_at: session.expires_at,
        });

        self.record_attempt_with_agent(&session.identity, true, Some(session.device_info.clone()))
            .await;

        Ok(session)
    }

    /// Ends the session, if any, and deletes its persisted record. Safe to call repeatedly.
    pub async fn end_session(&self) -> WriteOutcome {
        let mut machine = self.inner.session.lock().await;
        match machine.end() {
            Transition::Ended(session) => self.close(machine, session, CloseReason::Ended).await,
            _ => WriteOutcome::NoOp,
        }
    }

    /// Bumps `last_activity`. No-op without a session; an expired session is closed instead.
    pub async fn update_activity(&self) -> WriteOutcome {
        let inner = &self.inner;
        let mut machine = inner.session.lock().await;
        let now = inner.clock.now();

        match machine.touch(now) {
            Transition::Refreshed => {
                let payload = machine.current().and_then(|session| encode(&inner.session_key, session));
                let writer = inner.session_writer.lock().await;
                drop(machine);

                trace!(at = %now, "session activity recorded");
                self.write_record(&inner.session_key, payload, writer).await
            }
            Transition::Expired(session) => self.close(machine, session, CloseReason::Expired).await,
            _ => WriteOutcome::NoOp,
        }
    }

    /// Slides the expiry forward. No-op without a session; an expired session is closed instead.
    pub async fn extend_session(&self) -> WriteOutcome {
        let inner = &self.inner;
        let mut machine = inner.session.lock().await;
        let now = inner.clock.now();

        match machine.extend(now) {
            Transition::Extended => {
                let Some(session) = machine.current().cloned() else {
                    return WriteOutcome::NoOp;
                };
                let payload = encode(&inner.session_key, &session);
                let writer = inner.session_writer.lock().await;
                inner.snapshot.send_replace(machine.snapshot(now));
                drop(machine);

                debug!(identity = %session.identity, expires_at = %session.expires_at, "session extended");
                self.publish(SessionEvent::Extended {
                    identity: session.identity,
                    expires_at: session.expires_at,
                });
                self.write_record(&inner.session_key, payload, writer).await
            }
            Transition::Expired(session) => self.close(machine, session, CloseReason::Expired).await,
            _ => WriteOutcome::NoOp,
        }
    }

    /// Body of the periodic tick: closes the session once `now >= expires_at` and republishes
    /// the countdown otherwise. Returns whether this call expired the session.
    pub async fn check_expiry(&self) -> bool {
        let inner = &self.inner;
        let mut machine = inner.session.lock().await;
        let now = inner.clock.now();

        match machine.check_expiry(now) {
            Transition::Expired(session) => {
                self.close(machine, session, CloseReason::Expired).await;
                true
            }
            _ => {
                inner.snapshot.send_replace(machine.snapshot(now));
                false
            }
        }
    }

    pub async fn is_session_valid(&self) -> bool {
        let machine = self.inner.session.lock().await;
        machine.is_valid(self.inner.clock.now())
    }

    /// Whole seconds left, floored. A countdown that has run out closes the session the same
    /// way the periodic check does.
    pub async fn time_remaining_seconds(&self) -> u64 {
        let mut machine = self.inner.session.lock().await;
        let now = self.inner.clock.now();

        if let Transition::Expired(session) = machine.check_expiry(now) {
            self.close(machine, session, CloseReason::Expired).await;
            return 0;
        }
        machine.time_remaining_seconds(now)
    }

    pub async fn current_session(&self) -> Option<Session> {
        self.inner.session.lock().await.current().cloned()
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        let machine = self.inner.session.lock().await;
        machine.snapshot(self.inner.clock.now())
    }

    // ---- attempt ledger ----

    pub async fn record_attempt(&self, identity: &str, success: bool) -> WriteOutcome {
        self.record_attempt_with_agent(identity, success, None).await
    }

    /// Appends an attempt. Never rejected: callers consult [`Self::lockout_status`] first.
    pub async fn record_attempt_with_agent(&self, identity: &str, success: bool, agent: Option<String>) -> WriteOutcome {
        let inner = &self.inner;
        let mut ledger = self.ledger().await;
        let now = inner.clock.now();

        let was_locked = ledger.is_locked(identity, now);
        let attempt = ledger.record(identity, success, agent, now);
        let newly_locked = if success || was_locked {
            None
        } else {
            ledger.locked_until(&attempt.identity, now)
        };

        let loaded = inner.ledger_loaded.load(Ordering::SeqCst);
        let payload = encode(&inner.attempts_key, ledger.attempts());
        let retained = ledger.len();
        let writer = inner.ledger_writer.lock().await;
        drop(ledger);

        match newly_locked {
            Some(until) => {
                warn!(identity = %attempt.identity, until = %until, "identity locked out after repeated failed logins");
                self.publish(SessionEvent::LockedOut {
                    identity: attempt.identity.clone(),
                    until,
                });
            }
            None => debug!(identity = %attempt.identity, success, retained, "login attempt recorded"),
        }

        self.write_ledger(loaded, payload, writer).await
    }

    /// Removes the failed attempts of `identity`, resetting its remaining attempts.
    pub async fn clear_attempts(&self, identity: &str) -> WriteOutcome {
        let inner = &self.inner;
        let mut ledger = self.ledger().await;
        let now = inner.clock.now();

        let removed = ledger.clear(identity);
        if removed == 0 {
            return WriteOutcome::NoOp;
        }
        ledger.prune(now);

        let loaded = inner.ledger_loaded.load(Ordering::SeqCst);
        let payload = encode(&inner.attempts_key, ledger.attempts());
        let writer = inner.ledger_writer.lock().await;
        drop(ledger);

        debug!(identity = %identity, removed, "failed attempts cleared");
        self.write_ledger(loaded, payload, writer).await
    }

    pub async fn remaining_attempts(&self, identity: &str) -> u32 {
        let ledger = self.ledger().await;
        ledger.remaining_attempts(identity, self.inner.clock.now())
    }

    pub async fn is_locked(&self, identity: &str) -> bool {
        let ledger = self.ledger().await;
        ledger.is_locked(identity, self.inner.clock.now())
    }

    pub async fn lockout_remaining_seconds(&self, identity: &str) -> u64 {
        let ledger = self.ledger().await;
        ledger.lockout_remaining_seconds(identity, self.inner.clock.now())
    }

    pub async fn lockout_status(&self, identity: &str) -> LockoutStatus {
        let ledger = self.ledger().await;
        ledger.status(identity, self.inner.clock.now())
    }

    // ---- activity ----

    /// Registers the coordinator as a sink of `source`. The subscription is only held while a
    /// session is active, so activity while logged out causes no work at all.
    pub async fn attach_activity_source(&self, source: Arc<dyn ActivitySource>) {
        let inner = &self.inner;
        let machine = inner.session.lock().await;
        *inner.activity_source.lock().await = Some(source.clone());

        if machine.current().is_some() {
            let registration = self.subscribe_activity(source.as_ref());
            let previous = inner.guards.lock().await.activity.replace(registration);
            drop(machine);
            drop(previous);
        }
    }

    pub async fn detach_activity_source(&self) {
        let inner = &self.inner;
        let _machine = inner.session.lock().await;
        inner.activity_source.lock().await.take();
        let previous = inner.guards.lock().await.activity.take();
        if let Some(registration) = previous {
            registration.cancel();
        }
    }

    // ---- internals ----

    /// Creates fresh timer and activity registrations for a session that just became active.
    async fn arm(&self) -> SessionGuards {
        let weak = Arc::downgrade(&self.inner);
        let task: PeriodicTask = Arc::new(move || -> TaskFuture {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(inner) = weak.upgrade() {
                    SessionCoordinator { inner }.check_expiry().await;
                }
            })
        });
        let timer = self.inner.scheduler.schedule_periodic(self.inner.policy.check_interval(), task);

        let source = self.inner.activity_source.lock().await.clone();
        let activity = source.map(|source| self.subscribe_activity(source.as_ref()));

        SessionGuards {
            timer: Some(timer),
            activity,
        }
    }

    fn subscribe_activity(&self, source: &dyn ActivitySource) -> Registration {
        // Capacity one: while an update is pending, further events in the burst are dropped.
        let (tx, mut rx) = mpsc::channel::<ActivityEvent>(1);
        let callback: ActivityCallback = Arc::new(move |event| {
            let _ = tx.try_send(event);
        });
        let subscription = source.subscribe(&self.inner.activity_events, callback);

        let weak = Arc::downgrade(&self.inner);
        let pump = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                trace!(event = %event, "activity observed");
                SessionCoordinator { inner }.update_activity().await;
            }
        });

        subscription.join(Registration::from_task(pump))
    }

    /// Finishes a transition that already moved the machine to `NoSession`.
    async fn close(&self, machine: MutexGuard<'_, SessionMachine>, session: Session, reason: CloseReason) -> WriteOutcome {
        let inner = &self.inner;
        let guards = std::mem::take(&mut *inner.guards.lock().await);
        let writer = inner.session_writer.lock().await;
        inner.snapshot.send_replace(SessionSnapshot::empty());
        drop(machine);

        let outcome = self.delete_record(&inner.session_key, writer).await;

        match reason {
            CloseReason::Ended => {
                info!(identity = %session.identity, "session ended");
                self.publish(SessionEvent::Ended { identity: session.identity });
            }
            CloseReason::Expired => {
                info!(identity = %session.identity, expires_at = %session.expires_at, "session expired");
                self.publish(SessionEvent::Expired { identity: session.identity });
            }
        }

        // Last: this may cancel the very task (timer or activity pump) running this future.
        drop(guards);
        outcome
    }

    async fn restore(&self) -> RestoreReport {
        let now = self.inner.clock.now();
        let session = self.restore_session(now).await;
        let (ledger, ledger_corrupt) = self.restore_ledger(now).await;
        let ledger_unavailable = !self.inner.ledger_loaded.load(Ordering::SeqCst);

        info!(
            session = ?session,
            attempts_retained = ledger.retained,
            attempts_expired = ledger.expired,
            attempts_future_dated = ledger.future_dated,
            ledger_corrupt,
            ledger_unavailable,
            "persisted state restored"
        );

        RestoreReport {
            session,
            ledger,
            ledger_corrupt,
            ledger_unavailable,
        }
    }

    async fn restore_session(&self, now: chrono::DateTime<chrono::Utc>) -> SessionRestore {
        let inner = &self.inner;
        let record = match self.load::<Session>(&inner.session_key).await {
            Loaded::Missing => return SessionRestore::Absent,
            Loaded::Unavailable => return SessionRestore::Unavailable,
            Loaded::Corrupt => {
                self.discard(&inner.session_key).await;
                return SessionRestore::Corrupt;
            }
            Loaded::Value(record) => record,
        };

        let Some(restored) = SessionMachine::restore(&inner.policy, record, now) else {
            info!("persisted session has expired; discarding it");
            self.discard(&inner.session_key).await;
            return SessionRestore::Expired;
        };

        let mut machine = inner.session.lock().await;
        *machine = restored;
        let guards = self.arm().await;
        *inner.guards.lock().await = guards;
        inner.snapshot.send_replace(machine.snapshot(now));

        if let Some(session) = machine.current() {
            info!(identity = %session.identity, expires_at = %session.expires_at, "session restored");
        }
        SessionRestore::Restored
    }

    async fn restore_ledger(&self, now: chrono::DateTime<chrono::Utc>) -> (LedgerRestore, bool) {
        let inner = &self.inner;
        let attempts = match self.load::<Vec<LoginAttempt>>(&inner.attempts_key).await {
            Loaded::Unavailable => return (LedgerRestore::default(), false),
            Loaded::Missing => {
                inner.ledger_loaded.store(true, Ordering::SeqCst);
                return (LedgerRestore::default(), false);
            }
            Loaded::Corrupt => {
                inner.ledger_loaded.store(true, Ordering::SeqCst);
                self.discard(&inner.attempts_key).await;
                return (LedgerRestore::default(), true);
            }
            Loaded::Value(attempts) => attempts,
        };

        let (restored, report) = AttemptLedger::restore(&inner.policy, attempts, now);
        let mut ledger = inner.ledger.lock().await;
        *ledger = restored;
        inner.ledger_loaded.store(true, Ordering::SeqCst);

        if report.expired + report.future_dated > 0 {
            let payload = encode(&inner.attempts_key, ledger.attempts());
            let writer = inner.ledger_writer.lock().await;
            drop(ledger);
            self.write_record(&inner.attempts_key, payload, writer).await;
        }

        (report, false)
    }

    /// Locks the ledger, first merging in the persisted history if restore could not read it.
    async fn ledger(&self) -> MutexGuard<'_, AttemptLedger> {
        let mut ledger = self.inner.ledger.lock().await;
        if !self.inner.ledger_loaded.load(Ordering::SeqCst) {
            self.reload_ledger(&mut ledger).await;
        }
        ledger
    }

    async fn reload_ledger(&self, ledger: &mut AttemptLedger) {
        let inner = &self.inner;
        let persisted = match self.load::<Vec<LoginAttempt>>(&inner.attempts_key).await {
            Loaded::Unavailable => return,
            Loaded::Missing | Loaded::Corrupt => Vec::new(),
            Loaded::Value(attempts) => attempts,
        };

        let now = inner.clock.now();
        let had_local = !ledger.is_empty();
        let report = ledger.absorb(persisted, now);
        inner.ledger_loaded.store(true, Ordering::SeqCst);

        info!(
            attempts_retained = report.retained,
            attempts_expired = report.expired,
            attempts_local = had_local,
            "attempt history loaded after the store recovered"
        );

        if had_local || report.expired + report.future_dated > 0 {
            let payload = encode(&inner.attempts_key, ledger.attempts());
            let writer = inner.ledger_writer.lock().await;
            self.write_record(&inner.attempts_key, payload, writer).await;
        }
    }

    /// Writes the attempt history unless the persisted copy has not been read yet, in which
    /// case the in-memory history would overwrite it.
    async fn write_ledger(&self, loaded: bool, payload: Option<Vec<u8>>, writer: MutexGuard<'_, ()>) -> WriteOutcome {
        if !loaded {
            warn!(key = %self.inner.attempts_key, "attempt history not loaded yet; keeping the change in memory");
            return WriteOutcome::Degraded;
        }
        self.write_record(&self.inner.attempts_key, payload, writer).await
    }

    async fn load<T: DeserializeOwned>(&self, key: &str) -> Loaded<T> {
        match self.inner.store.get(key).await {
            Ok(None) => Loaded::Missing,
            Ok(Some(bytes)) => match serde_json::from_slice(&bytes) {
                Ok(value) => Loaded::Value(value),
                Err(err) => {
                    warn!(key = %key, error = %err, "discarding corrupt persisted record");
                    Loaded::Corrupt
                }
            },
            Err(err) => {
                self.degraded(key, &err);
                Loaded::Unavailable
            }
        }
    }

    async fn discard(&self, key: &str) {
        let writer = if key == self.inner.session_key {
            self.inner.session_writer.lock().await
        } else {
            self.inner.ledger_writer.lock().await
        };
        self.delete_record(key, writer).await;
    }

    async fn write_record(&self, key: &str, payload: Option<Vec<u8>>, _writer: MutexGuard<'_, ()>) -> WriteOutcome {
        let Some(bytes) = payload else {
            return WriteOutcome::Degraded;
        };

        match self.inner.store.set(key, &bytes).await {
            Ok(()) => WriteOutcome::Persisted,
            Err(err) => {
                self.degraded(key, &err);
                WriteOutcome::Degraded
            }
        }
    }

    async fn delete_record(&self, key: &str, _writer: MutexGuard<'_, ()>) -> WriteOutcome {
        match self.inner.store.delete(key).await {
            Ok(()) => WriteOutcome::Persisted,
            Err(err) => {
                self.degraded(key, &err);
                WriteOutcome::Degraded
            }
        }
    }

    fn degraded(&self, key: &str, err: &StoreError) {
        warn!(key = %key, error = ?err, "persistent store unavailable; continuing with in-memory state");
        self.publish(SessionEvent::StoreDegraded {
            key: key.to_string(),
            reason: err.to_string(),
        });
    }

    fn publish(&self, event: SessionEvent) {
        // No subscribers is not an error.
        let _ = self.inner.events.send(event);
    }
}

fn encode<T: Serialize + ?Sized>(key: &str, value: &T) -> Option<Vec<u8>> {
    match serde_json::to_vec(value) {
        Ok(bytes) => Some(bytes),
        Err(err) => {
            warn!(key = %key, error = %err, "failed to serialize record");
            None
        }
    }
}
