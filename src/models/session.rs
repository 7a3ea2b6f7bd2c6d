use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The single authenticated session owned by a coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub identity: String,
    pub login_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Informational only; never used for authorization.
    pub device_info: String,
    pub is_remembered: bool,
}

impl Session {
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    /// Whole seconds left before expiry, rounded down.
    pub fn seconds_remaining_at(&self, now: DateTime<Utc>) -> u64 {
        let remaining_ms = (self.expires_at - now).num_milliseconds();
        u64::try_from(remaining_ms / 1000).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    NoSession,
    Active,
}

/// Read-only projection published to UI-facing subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    pub identity: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub time_remaining_seconds: u64,
}

impl SessionSnapshot {
    pub fn empty() -> Self {
        Self {
            phase: SessionPhase::NoSession,
            identity: None,
            expires_at: None,
            time_remaining_seconds: 0,
        }
    }

    pub fn of(session: &Session, now: DateTime<Utc>) -> Self {
        Self {
            phase: SessionPhase::Active,
            identity: Some(session.identity.clone()),
            expires_at: Some(session.expires_at),
            time_remaining_seconds: session.seconds_remaining_at(now),
        }
    }
}

pub fn default_device_info() -> String {
    format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH)
}
