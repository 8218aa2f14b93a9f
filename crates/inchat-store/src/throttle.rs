//! Brute-force protection for logins.
//!
//! Each account moves through three states:
//!
//! ```text
//! Clear ──fail──► Accumulating(n) ──n reaches limit──► Blocked(until)
//!   ▲                   │                                  │
//!   └──── success ──────┘◄──────── first check after until ┘
//! ```
//!
//! Any attempt made while blocked re-arms the cooldown, so an attacker who
//! keeps probing never gets through. State lives in a [`DashMap`]; the entry
//! guard makes each check-and-record atomic per account without serializing
//! unrelated accounts.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ThrottleConfig;

/// Result of one login attempt as seen by the throttle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LoginOutcome {
    /// Password matched and the account is not locked out.
    Allowed,
    /// Wrong password; `failures` consecutive failures so far.
    Denied { failures: u32 },
    /// Locked out until `until`.
    Blocked { until: DateTime<Utc> },
}

/// Throttle bookkeeping for one account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttemptState {
    pub failures: u32,
    pub blocked_until: Option<DateTime<Utc>>,
}

/// Process-wide login attempt tracker.
#[derive(Debug)]
pub struct LoginThrottle {
    states: DashMap<Uuid, AttemptState>,
    max_failures: u32,
    cooldown: chrono::Duration,
}

impl LoginThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        let cooldown = chrono::Duration::from_std(config.cooldown())
            .unwrap_or_else(|_| chrono::Duration::seconds(i64::from(u32::MAX)));
        Self {
            states: DashMap::new(),
            max_failures: config.max_failures.max(1),
            cooldown,
        }
    }

    /// Record an attempt for `account` at the current time.
    pub fn check_and_record(&self, account: Uuid, password_matches: bool) -> LoginOutcome {
        self.check_and_record_at(account, password_matches, Utc::now())
    }

    /// Record an attempt for `account` made at `now`.
    pub fn check_and_record_at(
        &self,
        account: Uuid,
        password_matches: bool,
        now: DateTime<Utc>,
    ) -> LoginOutcome {
        let mut entry = self.states.entry(account).or_default();
        let state = entry.value_mut();

        if let Some(until) = state.blocked_until {
            if now < until {
                let until = self.lockout_from(now);
                state.blocked_until = Some(until);
                warn!(%account, %until, "login attempt during lockout, cooldown re-armed");
                return LoginOutcome::Blocked { until };
            }
            *state = AttemptState::default();
        }

        if password_matches {
            *state = AttemptState::default();
            return LoginOutcome::Allowed;
        }

        state.failures += 1;
        if state.failures >= self.max_failures {
            let until = self.lockout_from(now);
            *state = AttemptState {
                failures: 0,
                blocked_until: Some(until),
            };
            warn!(%account, %until, "too many failed logins, account locked");
            return LoginOutcome::Blocked { until };
        }

        debug!(%account, failures = state.failures, "failed login recorded");
        LoginOutcome::Denied {
            failures: state.failures,
        }
    }

    /// End of a lockout starting at `now`, saturating at the latest
    /// representable instant.
    fn lockout_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.cooldown)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Snapshot of the bookkeeping for `account`.
    pub fn state(&self, account: Uuid) -> AttemptState {
        self.states
            .get(&account)
            .map(|entry| *entry.value())
            .unwrap_or_default()
    }

    /// Forget everything about `account` (for example when it is deleted).
    pub fn forget(&self, account: Uuid) {
        self.states.remove(&account);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;

    fn throttle() -> LoginThrottle {
        LoginThrottle::new(ThrottleConfig::default())
    }

    #[test]
    fn tenth_failure_blocks() {
        let throttle = throttle();
        let account = Uuid::now_v7();
        let start = Utc::now();

        for n in 1..10 {
            assert_eq!(
                throttle.check_and_record_at(account, false, start),
                LoginOutcome::Denied { failures: n }
            );
        }
        let outcome = throttle.check_and_record_at(account, false, start);
        assert_eq!(
            outcome,
            LoginOutcome::Blocked {
                until: start + Duration::minutes(10)
            }
        );
        assert_eq!(throttle.state(account).failures, 0);
    }

    #[test]
    fn attempt_during_lockout_extends_it() {
        let throttle = throttle();
        let account = Uuid::now_v7();
        let start = Utc::now();
        for _ in 0..10 {
            throttle.check_and_record_at(account, false, start);
        }

        let later = start + Duration::minutes(4);
        assert_eq!(
            throttle.check_and_record_at(account, true, later),
            LoginOutcome::Blocked {
                until: later + Duration::minutes(10)
            }
        );
        assert_eq!(
            throttle.state(account).blocked_until,
            Some(later + Duration::minutes(10))
        );
    }

    #[test]
    fn success_after_expiry_clears_state() {
        let throttle = throttle();
        let account = Uuid::now_v7();
        let start = Utc::now();
        for _ in 0..10 {
            throttle.check_and_record_at(account, false, start);
        }

        let after = start + Duration::minutes(10);
        assert_eq!(
            throttle.check_and_record_at(account, true, after),
            LoginOutcome::Allowed
        );
        assert_eq!(throttle.state(account), AttemptState::default());
    }

    #[test]
    fn failure_after_expiry_starts_counting_again() {
        let throttle = throttle();
        let account = Uuid::now_v7();
        let start = Utc::now();
        for _ in 0..10 {
            throttle.check_and_record_at(account, false, start);
        }

        let after = start + Duration::minutes(11);
        assert_eq!(
            throttle.check_and_record_at(account, false, after),
            LoginOutcome::Denied { failures: 1 }
        );
        assert_eq!(throttle.state(account).blocked_until, None);
    }

    #[test]
    fn success_resets_failure_count() {
        let throttle = throttle();
        let account = Uuid::now_v7();
        for _ in 0..5 {
            throttle.check_and_record(account, false);
        }
        assert_eq!(throttle.check_and_record(account, true), LoginOutcome::Allowed);
        assert_eq!(
            throttle.check_and_record(account, false),
            LoginOutcome::Denied { failures: 1 }
        );
    }

    #[test]
    fn accounts_are_tracked_independently() {
        let throttle = throttle();
        let a = Uuid::now_v7();
        let b = Uuid::now_v7();
        for _ in 0..10 {
            throttle.check_and_record(a, false);
        }
        assert_eq!(throttle.check_and_record(b, true), LoginOutcome::Allowed);
        assert!(matches!(
            throttle.check_and_record(a, true),
            LoginOutcome::Blocked { .. }
        ));

        throttle.forget(a);
        assert_eq!(throttle.state(a), AttemptState::default());
    }

    #[test]
    fn concurrent_failures_are_not_lost() {
        let throttle = Arc::new(LoginThrottle::new(ThrottleConfig {
            max_failures: 1_000,
            cooldown_secs: 60,
        }));
        let account = Uuid::now_v7();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let throttle = Arc::clone(&throttle);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        throttle.check_and_record(account, false);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(throttle.state(account).failures, 400);
    }

    #[test]
    fn huge_cooldown_saturates_instead_of_overflowing() {
        let throttle = LoginThrottle::new(ThrottleConfig {
            max_failures: 1,
            cooldown_secs: 10_000_000_000_000,
        });
        let account = Uuid::now_v7();
        let now = Utc::now();

        let locked = LoginOutcome::Blocked {
            until: DateTime::<Utc>::MAX_UTC,
        };
        assert_eq!(throttle.check_and_record_at(account, false, now), locked);
        assert_eq!(throttle.check_and_record_at(account, true, now), locked);
    }
}
