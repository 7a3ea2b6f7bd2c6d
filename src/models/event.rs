use chrono::{DateTime, Utc};
use serde::Serialize;

/// Notifications pushed to subscribers of `SessionCoordinator::subscribe_events`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Started { identity: String, expires_at: DateTime<Utc> },
    Extended { identity: String, expires_at: DateTime<Utc> },
    Ended { identity: String },
    Expired { identity: String },
    LockedOut { identity: String, until: DateTime<Utc> },
    StoreDegraded { key: String, reason: String },
}
