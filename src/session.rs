use crate::config::{SessionPolicy, offset};
use crate::error::app_error::SessionError;
use crate::models::login_attempt::normalize_identity;
use crate::models::session::{Session, SessionSnapshot};
use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionState {
    NoSession,
    Active(Session),
}

/// Result of driving the machine. `Expired` and `Ended` carry the session that was closed;
/// the machine is already back in `NoSession` when either is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Refreshed,
    Extended,
    Ended(Session),
    Expired(Session),
    Unchanged,
}

/// Lifecycle of the single live session: `NoSession -> Active -> (Expired) -> NoSession`.
///
/// Pure over the `now` it is handed; persistence, timers and locking belong to the coordinator.
#[derive(Debug, Clone)]
pub struct SessionMachine {
    state: SessionState,
    timeout: TimeDelta,
    remember_me: TimeDelta,
    extend_uses_remember_me: bool,
}

impl SessionMachine {
    pub fn new(policy: &SessionPolicy) -> Self {
        Self {
            state: SessionState::NoSession,
            timeout: policy.session_timeout(),
            remember_me: policy.remember_me(),
            extend_uses_remember_me: policy.extend_uses_remember_me,
        }
    }

    /// Reinstates a persisted session if it is still valid at `now`.
    ///
    /// Timestamps recorded in the future are clamped to `now`; `expires_at` is never moved.
    pub fn restore(policy: &SessionPolicy, mut record: Session, now: DateTime<Utc>) -> Option<Self> {
        if !record.is_valid_at(now) {
            return None;
        }

        record.identity = normalize_identity(&record.identity);
        record.login_time = record.login_time.min(now);
        record.last_activity = record.last_activity.min(now);

        let mut machine = Self::new(policy);
        machine.state = SessionState::Active(record);
        Some(machine)
    }

    pub fn start(&mut self, identity: &str, remember: bool, device_info: String, now: DateTime<Utc>) -> Result<Session, SessionError> {
        if let SessionState::Active(current) = &self.state {
            return Err(SessionError::SessionAlreadyActive {
                identity: current.identity.clone(),
            });
        }

        let ttl = if remember { self.remember_me } else { self.timeout };
        let session = Session {
            id: Uuid::new_v4(),
            identity: normalize_identity(identity),
            login_time: now,
            last_activity: now,
            expires_at: offset(now, ttl),
            device_info,
            is_remembered: remember,
        };
        self.state = SessionState::Active(session.clone());

        Ok(session)
    }

    /// Records user activity. Does not move `expires_at`.
    pub fn touch(&mut self, now: DateTime<Utc>) -> Transition {
        if let Some(expired) = self.expire_if_due(now) {
            return expired;
        }

        match &mut self.state {
            SessionState::Active(session) => {
                session.last_activity = now.max(session.last_activity);
                Transition::Refreshed
            }
            SessionState::NoSession => Transition::Unchanged,
        }
    }

    /// Slides expiry to `now + timeout`. An already expired session is closed instead.
    pub fn extend(&mut self, now: DateTime<Utc>) -> Transition {
        if let Some(expired) = self.expire_if_due(now) {
            return expired;
        }

        let (timeout, remember_me, inherit) = (self.timeout, self.remember_me, self.extend_uses_remember_me);
        match &mut self.state {
            SessionState::Active(session) => {
                let ttl = if inherit && session.is_remembered { remember_me } else { timeout };
                session.expires_at = offset(now, ttl);
                session.last_activity = now.max(session.last_activity);
                Transition::Extended
            }
            SessionState::NoSession => Transition::Unchanged,
        }
    }

    pub fn end(&mut self) -> Transition {
        match std::mem::replace(&mut self.state, SessionState::NoSession) {
            SessionState::Active(session) => Transition::Ended(session),
            SessionState::NoSession => Transition::Unchanged,
        }
    }

    /// The authoritative expiry check. Idempotent: a second call after expiry is `Unchanged`.
    pub fn check_expiry(&mut self, now: DateTime<Utc>) -> Transition {
        self.expire_if_due(now).unwrap_or(Transition::Unchanged)
    }

    fn expire_if_due(&mut self, now: DateTime<Utc>) -> Option<Transition> {
        let due = self.current().is_some_and(|session| !session.is_valid_at(now));
        if !due {
            return None;
        }

        match std::mem::replace(&mut self.state, SessionState::NoSession) {
            SessionState::Active(session) => Some(Transition::Expired(session)),
            SessionState::NoSession => None,
        }
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.current().is_some_and(|session| session.is_valid_at(now))
    }

    pub fn time_remaining_seconds(&self, now: DateTime<Utc>) -> u64 {
        self.current().map_or(0, |session| session.seconds_remaining_at(now))
    }

    pub fn current(&self) -> Option<&Session> {
        match &self.state {
            SessionState::Active(session) => Some(session),
            SessionState::NoSession => None,
        }
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> SessionSnapshot {
        self.current().map_or_else(SessionSnapshot::empty, |session| SessionSnapshot::of(session, now))
    }
}
