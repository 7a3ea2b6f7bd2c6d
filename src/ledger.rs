use crate::config::{SessionPolicy, offset};
use crate::models::login_attempt::{LockoutStatus, LoginAttempt, normalize_identity};
use chrono::{DateTime, TimeDelta, Utc};

/// Append-only, time-pruned history of login attempts.
///
/// Lockout is never stored: it is derived from the retained failures on every query.
/// Every failure still inside the retention window counts towards the limit, including
/// failures that precede a later success; only [`AttemptLedger::clear`] resets the count.
#[derive(Debug, Clone)]
pub struct AttemptLedger {
    attempts: Vec<LoginAttempt>,
    max_attempts: u32,
    lockout: TimeDelta,
    retention: TimeDelta,
}

/// What a restore kept and what it threw away.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerRestore {
    pub retained: usize,
    pub expired: usize,
    pub future_dated: usize,
}

impl AttemptLedger {
    pub fn new(policy: &SessionPolicy) -> Self {
        Self {
            attempts: Vec::new(),
            max_attempts: policy.max_attempts,
            lockout: policy.lockout(),
            retention: policy.retention(),
        }
    }

    /// Rebuilds a ledger from persisted attempts, revalidated against `now`.
    pub fn restore(policy: &SessionPolicy, attempts: Vec<LoginAttempt>, now: DateTime<Utc>) -> (Self, LedgerRestore) {
        let mut ledger = Self::new(policy);
        let report = ledger.absorb(attempts, now);
        (ledger, report)
    }

    /// Folds persisted attempts into this ledger, keeping the history ordered by time.
    ///
    /// Attempts stamped after `now` are dropped so a skewed clock can never extend a lockout,
    /// and attempts older than the retention window are pruned. Attempts already held in
    /// memory are kept. The report counts persisted attempts only.
    pub fn absorb(&mut self, persisted: Vec<LoginAttempt>, now: DateTime<Utc>) -> LedgerRestore {
        let total = persisted.len();
        let cutoff = self.retention_cutoff(now);

        let mut incoming: Vec<LoginAttempt> = persisted
            .into_iter()
            .filter(|attempt| attempt.timestamp <= now)
            .map(|attempt| LoginAttempt {
                identity: normalize_identity(&attempt.identity),
                ..attempt
            })
            .collect();
        let future_dated = total - incoming.len();

        let dated = incoming.len();
        incoming.retain(|attempt| attempt.timestamp > cutoff);
        let expired = dated - incoming.len();
        let retained = incoming.len();

        incoming.append(&mut self.attempts);
        incoming.sort_by_key(|attempt| attempt.timestamp);
        self.attempts = incoming;
        self.prune(now);

        LedgerRestore {
            retained,
            expired,
            future_dated,
        }
    }

    /// Appends an attempt stamped `now`, then prunes everything outside the retention window.
    pub fn record(&mut self, identity: &str, success: bool, agent: Option<String>, now: DateTime<Utc>) -> LoginAttempt {
        let attempt = LoginAttempt::new(identity, success, agent, now);
        self.attempts.push(attempt.clone());
        self.prune(now);
        attempt
    }

    /// Removes attempts older than the retention window. Returns how many were removed.
    pub fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = self.retention_cutoff(now);
        let before = self.attempts.len();
        self.attempts.retain(|attempt| attempt.timestamp > cutoff);
        before - self.attempts.len()
    }

    /// Drops every failed attempt for `identity`. Successes are kept.
    pub fn clear(&mut self, identity: &str) -> usize {
        let identity = normalize_identity(identity);
        let before = self.attempts.len();
        self.attempts.retain(|attempt| attempt.success || attempt.identity != identity);
        before - self.attempts.len()
    }

    pub fn failed_count(&self, identity: &str, now: DateTime<Utc>) -> u32 {
        let count = self.failures(identity, now).count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }

    pub fn remaining_attempts(&self, identity: &str, now: DateTime<Utc>) -> u32 {
        self.max_attempts.saturating_sub(self.failed_count(identity, now))
    }

    /// End of the current lockout, or `None` when the identity may attempt a login.
    pub fn locked_until(&self, identity: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.failed_count(identity, now) < self.max_attempts {
            return None;
        }

        let last_failure = self.failures(identity, now).map(|attempt| attempt.timestamp).max()?;
        let until = offset(last_failure, self.lockout);
        (now < until).then_some(until)
    }

    pub fn is_locked(&self, identity: &str, now: DateTime<Utc>) -> bool {
        self.locked_until(identity, now).is_some()
    }

    /// Seconds until the lockout ends, rounded up so a locked identity never reports zero.
    pub fn lockout_remaining_seconds(&self, identity: &str, now: DateTime<Utc>) -> u64 {
        self.locked_until(identity, now).map_or(0, |until| ceil_seconds(until - now))
    }

    pub fn status(&self, identity: &str, now: DateTime<Utc>) -> LockoutStatus {
        match self.locked_until(identity, now) {
            Some(until) => LockoutStatus::Locked {
                until,
                remaining_seconds: ceil_seconds(until - now),
            },
            None => LockoutStatus::Allowed {
                remaining_attempts: self.remaining_attempts(identity, now),
            },
        }
    }

    pub fn attempts(&self) -> &[LoginAttempt] {
        &self.attempts
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }

    // Queries apply the retention window too, so a ledger that has not been written
    // to for a day reads the same as one that was just pruned.
    fn failures<'a>(&'a self, identity: &str, now: DateTime<Utc>) -> impl Iterator<Item = &'a LoginAttempt> + 'a {
        let identity = normalize_identity(identity);
        let cutoff = self.retention_cutoff(now);
        self.attempts
            .iter()
            .filter(move |attempt| !attempt.success && attempt.identity == identity && attempt.timestamp > cutoff)
    }

    fn retention_cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.retention).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

fn ceil_seconds(delta: TimeDelta) -> u64 {
    let ms = delta.num_milliseconds().max(0);
    u64::try_from((ms + 999) / 1000).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn at(ms: i64) -> DateTime<Utc> {
        DateTime::<Utc>::UNIX_EPOCH + TimeDelta::milliseconds(ms)
    }

    fn ledger() -> AttemptLedger {
        AttemptLedger::new(&SessionPolicy::default())
    }

    const MINUTE: i64 = 60_000;

    #[test]
    fn test_five_failures_lock_for_fifteen_minutes() {
        let mut ledger = ledger();
        for t in 0..5 {
            ledger.record("a@x.com", false, None, at(t));
        }

        assert!(ledger.is_locked("a@x.com", at(4)));
        assert_eq!(ledger.lockout_remaining_seconds("a@x.com", at(4)), 900);
        assert_eq!(ledger.remaining_attempts("a@x.com", at(4)), 0);

        assert!(ledger.is_locked("a@x.com", at(4 + 15 * MINUTE - 1)));
        assert!(!ledger.is_locked("a@x.com", at(4 + 15 * MINUTE)));
        assert_eq!(ledger.lockout_remaining_seconds("a@x.com", at(4 + 15 * MINUTE)), 0);
    }

    #[test]
    fn test_identity_lookup_is_case_insensitive() {
        let mut ledger = ledger();
        for t in 0..5 {
            ledger.record(if t % 2 == 0 { "A@X.com" } else { "a@x.COM" }, false, None, at(t));
        }

        assert!(ledger.is_locked("a@x.com", at(10)));
        assert!(ledger.is_locked(" A@x.com ", at(10)));
        assert!(!ledger.is_locked("b@x.com", at(10)));
    }

    #[test]
    fn test_success_does_not_reset_the_failure_count() {
        let mut ledger = ledger();
        for t in 0..5 {
            ledger.record("a@x.com", false, None, at(t));
        }
        ledger.record("a@x.com", true, None, at(10));

        assert!(ledger.is_locked("a@x.com", at(11)));
        assert_eq!(ledger.remaining_attempts("a@x.com", at(11)), 0);

        assert_eq!(ledger.clear("a@x.com"), 5);
        assert!(!ledger.is_locked("a@x.com", at(12)));
        assert_eq!(ledger.remaining_attempts("a@x.com", at(12)), 5);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_clear_only_touches_the_given_identity() {
        let mut ledger = ledger();
        ledger.record("a@x.com", false, None, at(0));
        ledger.record("b@x.com", false, None, at(1));

        ledger.clear("A@X.COM");
        assert_eq!(ledger.remaining_attempts("a@x.com", at(2)), 5);
        assert_eq!(ledger.remaining_attempts("b@x.com", at(2)), 4);
    }

    #[test]
    fn test_record_prunes_attempts_outside_retention() {
        let mut ledger = ledger();
        ledger.record("a@x.com", false, None, at(0));
        ledger.record("a@x.com", false, None, at(MINUTE));

        let day = 24 * 60 * MINUTE;
        ledger.record("b@x.com", true, Some("cli".to_string()), at(day + 1));

        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.remaining_attempts("a@x.com", at(day + 1)), 4);
        assert_eq!(ledger.attempts()[1].agent.as_deref(), Some("cli"));
    }

    #[test]
    fn test_queries_ignore_stale_failures_before_any_write() {
        let mut ledger = ledger();
        ledger.record("a@x.com", false, None, at(0));

        let day = 24 * 60 * MINUTE;
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger.remaining_attempts("a@x.com", at(day)), 5);
    }

    #[test]
    fn test_lockout_is_measured_from_the_most_recent_failure() {
        let mut ledger = ledger();
        for t in 0..4 {
            ledger.record("a@x.com", false, None, at(t * MINUTE));
        }
        ledger.record("a@x.com", false, None, at(10 * MINUTE));

        assert_eq!(ledger.locked_until("a@x.com", at(10 * MINUTE)), Some(at(25 * MINUTE)));
    }

    #[test]
    fn test_failure_after_an_elapsed_lockout_relocks_immediately() {
        let mut ledger = ledger();
        for t in 0..5 {
            ledger.record("a@x.com", false, None, at(t));
        }
        let later = 20 * MINUTE;
        assert!(!ledger.is_locked("a@x.com", at(later)));

        ledger.record("a@x.com", false, None, at(later));
        assert!(ledger.is_locked("a@x.com", at(later)));
    }

    #[test]
    fn test_status_reports_countdown_when_locked() {
        let mut ledger = ledger();
        assert_eq!(ledger.status("a@x.com", at(0)), LockoutStatus::Allowed { remaining_attempts: 5 });

        for t in 0..5 {
            ledger.record("a@x.com", false, None, at(t));
        }
        assert_eq!(
            ledger.status("a@x.com", at(500)),
            LockoutStatus::Locked {
                until: at(4 + 15 * MINUTE),
                remaining_seconds: 900,
            }
        );
    }

    #[test]
    fn test_restore_drops_future_and_expired_attempts() {
        let policy = SessionPolicy::default();
        let now = at(48 * 60 * MINUTE);
        let attempts = vec![
            LoginAttempt::new("a@x.com", false, None, at(0)),
            LoginAttempt::new("a@x.com", false, None, now - TimeDelta::minutes(1)),
            LoginAttempt::new("a@x.com", false, None, now + TimeDelta::minutes(5)),
            LoginAttempt {
                identity: "B@X.COM".to_string(),
                ..LoginAttempt::new("b@x.com", false, None, now)
            },
        ];

        let (ledger, report) = AttemptLedger::restore(&policy, attempts, now);
        assert_eq!(
            report,
            LedgerRestore {
                retained: 2,
                expired: 1,
                future_dated: 1,
            }
        );
        assert_eq!(ledger.remaining_attempts("b@x.com", now), 4);
    }

    #[test]
    fn test_restored_lockout_does_not_resurrect_after_it_elapsed() {
        let policy = SessionPolicy::default();
        let attempts: Vec<_> = (0..5).map(|t| LoginAttempt::new("a@x.com", false, None, at(t))).collect();

        let (ledger, _) = AttemptLedger::restore(&policy, attempts.clone(), at(5));
        assert!(ledger.is_locked("a@x.com", at(5)));

        let (ledger, _) = AttemptLedger::restore(&policy, attempts, at(16 * MINUTE));
        assert!(!ledger.is_locked("a@x.com", at(16 * MINUTE)));
    }

    #[test]
    fn test_absorb_merges_persisted_history_with_local_attempts() {
        let mut ledger = ledger();
        ledger.record("b@x.com", false, None, at(10 * MINUTE));

        let persisted: Vec<_> = (0..5).map(|t| LoginAttempt::new("a@x.com", false, None, at(t * MINUTE))).collect();
        let report = ledger.absorb(persisted, at(10 * MINUTE));

        assert_eq!(report.retained, 5);
        assert_eq!(ledger.len(), 6);
        assert!(ledger.is_locked("a@x.com", at(10 * MINUTE)));
        assert_eq!(ledger.remaining_attempts("b@x.com", at(10 * MINUTE)), 4);
        assert!(ledger.attempts().windows(2).all(|pair| pair[0].timestamp <= pair[1].timestamp));
    }

    proptest! {
        #[test]
        fn test_remaining_attempts_drop_by_one_per_failure(gaps in proptest::collection::vec(0i64..60_000, 1..12)) {
            let mut ledger = ledger();
            let mut now = 0;
            let mut previous = ledger.remaining_attempts("p@x.com", at(now));
            prop_assert_eq!(previous, 5);

            for gap in gaps {
                now += gap;
                ledger.record("p@x.com", false, None, at(now));
                let remaining = ledger.remaining_attempts("p@x.com", at(now));
                prop_assert_eq!(remaining, previous.saturating_sub(1));
                previous = remaining;
            }

            ledger.clear("p@x.com");
            prop_assert_eq!(ledger.remaining_attempts("p@x.com", at(now)), 5);
        }

        #[test]
        fn test_lock_holds_until_last_failure_plus_lockout(
            gaps in proptest::collection::vec(0i64..120_000, 5..10),
            offset in 0i64..(20 * MINUTE),
        ) {
            let mut ledger = ledger();
            let mut now = 0;
            for gap in gaps {
                now += gap;
                ledger.record("p@x.com", false, None, at(now));
            }
            let last_failure = now;

            prop_assert!(ledger.is_locked("p@x.com", at(last_failure)));
            let later = last_failure + offset;
            prop_assert_eq!(ledger.is_locked("p@x.com", at(later)), offset < 15 * MINUTE);
        }
    }
}
