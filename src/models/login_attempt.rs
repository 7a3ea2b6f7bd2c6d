use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One recorded login attempt. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginAttempt {
    pub timestamp: DateTime<Utc>,
    pub identity: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

impl LoginAttempt {
    pub fn new(identity: &str, success: bool, agent: Option<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            identity: normalize_identity(identity),
            success,
            agent,
        }
    }
}

/// Case-folds an identity so `A@X.com` and `a@x.com ` share one attempt history.
pub fn normalize_identity(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Lockout state of an identity, as reported to login flows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LockoutStatus {
    Allowed { remaining_attempts: u32 },
    Locked { until: DateTime<Utc>, remaining_seconds: u64 },
}

impl LockoutStatus {
    pub fn is_locked(&self) -> bool {
        matches!(self, LockoutStatus::Locked { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_identity_is_case_folded_and_trimmed() {
        assert_eq!(normalize_identity("  Alice@Example.COM "), "alice@example.com");
    }

    #[test]
    fn test_timestamps_serialize_as_iso_8601() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let attempt = LoginAttempt::new("A@x.com", false, None, at);

        let json = serde_json::to_value(&attempt).unwrap();
        assert_eq!(json["timestamp"], "2024-05-01T12:30:00Z");
        assert_eq!(json["identity"], "a@x.com");
        assert!(json.get("agent").is_none());

        let parsed: LoginAttempt = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.timestamp, at);
    }

    #[test]
    fn test_lockout_status_is_tagged() {
        let status = LockoutStatus::Allowed { remaining_attempts: 3 };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "allowed");
        assert_eq!(json["remaining_attempts"], 3);
        assert!(!status.is_locked());
    }
}
