//! Per-user monthly budget ledger with optimistic reservations.
//!
//! A request reserves its estimated cost before execution and commits the
//! actual cost afterwards; reservation and commit for one user run under the
//! same per-user lock. A request is admitted while the user's committed
//! spend is strictly under the cap, so one in-flight request may carry the
//! ledger past the cap by at most its own estimate (the single-request
//! tolerance). The ledger resets when the `YYYY-MM` period key rolls over.

use chrono::{DateTime, Datelike, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::BudgetConfig;
use crate::error::{Error, Result};

/// The period key for a timestamp, e.g. `2026-08`.
#[must_use]
pub fn period_key(at: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", at.year(), at.month())
}

/// Ledger state for one user and period.
#[derive(Debug, Clone)]
pub struct UserBudget {
    /// Owning user.
    pub user_id: String,
    /// `YYYY-MM` of the current period.
    pub period_key: String,
    /// Committed spend this period.
    pub spend_units: f64,
    /// Sum of outstanding reservations.
    pub reserved_units: f64,
    /// Cap for this period.
    pub cap_units: f64,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

/// An admitted reservation; must be committed or released exactly once.
#[derive(Debug)]
#[must_use = "reservations must be committed or released"]
pub struct Reservation {
    user_id: String,
    estimate: f64,
}

impl Reservation {
    /// The reserved estimate.
    #[must_use]
    pub fn estimate(&self) -> f64 {
        self.estimate
    }

    /// The reserving user.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

/// Monthly budget accounting across users.
pub struct BudgetLedger {
    accounts: DashMap<String, Mutex<UserBudget>>,
    config: BudgetConfig,
}

impl BudgetLedger {
    /// Build a ledger from configuration.
    #[must_use]
    pub fn new(config: BudgetConfig) -> Self {
        Self {
            accounts: DashMap::new(),
            config,
        }
    }

    /// Override a user's cap (tier upgrades, enterprise contracts).
    pub fn set_cap(&self, user_id: &str, cap_units: f64, now: DateTime<Utc>) {
        let account = self.account(user_id, now);
        let mut budget = account.lock();
        self.rollover(&mut budget, now);
        budget.cap_units = cap_units;
        budget.updated_at = now;
    }

    /// Reserve `estimate` units for a request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BudgetExceeded`] once committed plus reserved spend
    /// has reached the cap.
    pub fn reserve(&self, user_id: &str, estimate: f64, now: DateTime<Utc>) -> Result<Reservation> {
        let estimate = estimate.max(0.0);
        let account = self.account(user_id, now);
        let mut budget = account.lock();
        self.rollover(&mut budget, now);

        if budget.spend_units + budget.reserved_units >= budget.cap_units {
            return Err(Error::BudgetExceeded {
                user_id: user_id.to_string(),
            });
        }
        budget.reserved_units += estimate;
        budget.updated_at = now;
        Ok(Reservation {
            user_id: user_id.to_string(),
            estimate,
        })
    }

    /// Commit the actual cost of a completed request.
    pub fn commit(&self, reservation: Reservation, actual: f64, now: DateTime<Utc>) {
        let account = self.account(&reservation.user_id, now);
        let mut budget = account.lock();
        self.rollover(&mut budget, now);
        budget.reserved_units = (budget.reserved_units - reservation.estimate).max(0.0);
        budget.spend_units += actual.max(0.0);
        budget.updated_at = now;
    }

    /// Release a reservation without spending (failures, cancellations).
    pub fn release(&self, reservation: Reservation, now: DateTime<Utc>) {
        let account = self.account(&reservation.user_id, now);
        let mut budget = account.lock();
        budget.reserved_units = (budget.reserved_units - reservation.estimate).max(0.0);
        budget.updated_at = now;
    }

    /// Snapshot a user's ledger state.
    #[must_use]
    pub fn snapshot(&self, user_id: &str, now: DateTime<Utc>) -> UserBudget {
        let account = self.account(user_id, now);
        let mut budget = account.lock();
        self.rollover(&mut budget, now);
        budget.clone()
    }

    fn account(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> dashmap::mapref::one::Ref<'_, String, Mutex<UserBudget>> {
        if let Some(existing) = self.accounts.get(user_id) {
            return existing;
        }
        self.accounts
            .entry(user_id.to_string())
            .or_insert_with(|| {
                Mutex::new(UserBudget {
                    user_id: user_id.to_string(),
                    period_key: period_key(now),
                    spend_units: 0.0,
                    reserved_units: 0.0,
                    cap_units: self.config.default_monthly_cap,
                    updated_at: now,
                })
            })
            .downgrade()
    }

    fn rollover(&self, budget: &mut UserBudget, now: DateTime<Utc>) {
        let current = period_key(now);
        if budget.period_key != current {
            tracing::info!(
                user = %budget.user_id,
                from = %budget.period_key,
                to = %current,
                "budget period rollover"
            );
            budget.period_key = current;
            budget.spend_units = 0.0;
            // Reservations in flight across the boundary count against the
            // new period when they commit.
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(year: i32, month: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(year, month, 15, 12, 0, 0).unwrap()
    }

    fn ledger(cap: f64) -> BudgetLedger {
        BudgetLedger::new(BudgetConfig {
            default_monthly_cap: cap,
        })
    }

    #[test]
    fn test_reserve_commit_accumulates() {
        let ledger = ledger(1.0);
        let now = at(2026, 8);
        let res = ledger.reserve("u", 0.1, now).unwrap();
        ledger.commit(res, 0.08, now);
        let budget = ledger.snapshot("u", now);
        assert!((budget.spend_units - 0.08).abs() < 1e-9);
        assert!(budget.reserved_units.abs() < 1e-9);
    }

    #[test]
    fn test_single_request_tolerance() {
        // Cap 1.0, spend 0.98: one more request is admitted and may
        // overshoot by its own estimate, then the ledger closes.
        let ledger = ledger(1.0);
        let now = at(2026, 8);
        let res = ledger.reserve("u", 0.98, now).unwrap();
        ledger.commit(res, 0.98, now);

        let res = ledger.reserve("u", 0.05, now).unwrap();
        ledger.commit(res, 0.05, now);
        let budget = ledger.snapshot("u", now);
        assert!((budget.spend_units - 1.03).abs() < 1e-9);

        let err = ledger.reserve("u", 0.05, now).unwrap_err();
        assert!(matches!(err, Error::BudgetExceeded { .. }));
    }

    #[test]
    fn test_outstanding_reservation_blocks_at_cap() {
        let ledger = ledger(1.0);
        let now = at(2026, 8);
        // A pending reservation of the whole cap blocks new admissions.
        let pending = ledger.reserve("u", 1.0, now).unwrap();
        assert!(ledger.reserve("u", 0.01, now).is_err());
        // Releasing it re-opens the ledger.
        ledger.release(pending, now);
        assert!(ledger.reserve("u", 0.01, now).is_ok());
    }

    #[test]
    fn test_month_rollover_resets_spend() {
        let ledger = ledger(1.0);
        let august = at(2026, 8);
        let res = ledger.reserve("u", 0.9, august).unwrap();
        ledger.commit(res, 0.9, august);
        assert!((ledger.snapshot("u", august).spend_units - 0.9).abs() < 1e-9);

        let september = at(2026, 9);
        let budget = ledger.snapshot("u", september);
        assert_eq!(budget.period_key, "2026-09");
        assert!(budget.spend_units.abs() < 1e-9);
        assert!(ledger.reserve("u", 0.5, september).is_ok());
    }

    #[test]
    fn test_users_are_independent() {
        let ledger = ledger(0.1);
        let now = at(2026, 8);
        let res = ledger.reserve("a", 0.1, now).unwrap();
        ledger.commit(res, 0.2, now);
        assert!(ledger.reserve("a", 0.01, now).is_err());
        assert!(ledger.reserve("b", 0.01, now).is_ok());
    }

    #[test]
    fn test_period_key_format() {
        assert_eq!(period_key(at(2026, 8)), "2026-08");
        assert_eq!(period_key(at(2026, 12)), "2026-12");
    }
}
