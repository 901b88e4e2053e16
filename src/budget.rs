// src/budget.rs
// Shared cost accounting for analyzer invocations

use chrono::{NaiveDate, Utc};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::error::{Result, SleuthError};

const MICROS_PER_USD: f64 = 1_000_000.0;

fn to_micros(usd: f64) -> u64 {
    (usd.max(0.0) * MICROS_PER_USD).round() as u64
}

fn to_usd(micros: u64) -> f64 {
    micros as f64 / MICROS_PER_USD
}

/// A reservation taken out against the ledger before a backend call.
/// Committed with the actual cost afterwards, or released on failure.
/// Dropping an unsettled reservation leaks the reserved amount for the
/// rest of the run, which errs on the safe side of the ceiling.
#[derive(Debug)]
#[must_use]
pub struct Reservation {
    micros: u64,
}

/// Explicit, per-run shared cost counter. Instantiated by the caller and
/// passed into the controller and gateway, never ambient process state, so
/// tests can run independent ledgers side by side.
///
/// Ceilings are enforced with reserve-then-commit: a reservation atomically
/// claims headroom before the spend happens, so concurrent deep-tier calls
/// can never overshoot.
pub struct CostLedger {
    run_ceiling: u64,
    daily_ceiling: u64,
    run_spent: AtomicU64,
    daily_spent: AtomicU64,
    day: Mutex<NaiveDate>,
}

impl CostLedger {
    pub fn new(run_ceiling_usd: f64, daily_ceiling_usd: f64) -> Self {
        Self {
            run_ceiling: to_micros(run_ceiling_usd),
            daily_ceiling: to_micros(daily_ceiling_usd),
            run_spent: AtomicU64::new(0),
            daily_spent: AtomicU64::new(0),
            day: Mutex::new(Utc::now().date_naive()),
        }
    }

    /// Atomically claim `estimate_usd` of headroom against both ceilings.
    /// Fails with `BudgetExceeded` when either ceiling would be crossed.
    pub fn reserve(&self, estimate_usd: f64) -> Result<Reservation> {
        self.roll_day();
        let micros = to_micros(estimate_usd);

        claim(&self.run_spent, self.run_ceiling, micros).map_err(|spent| {
            SleuthError::BudgetExceeded(format!(
                "run ceiling {:.4} USD reached (spent {:.4})",
                to_usd(self.run_ceiling),
                to_usd(spent),
            ))
        })?;

        if let Err(spent) = claim(&self.daily_spent, self.daily_ceiling, micros) {
            // Undo the run claim so the two counters stay consistent.
            self.run_spent.fetch_sub(micros, Ordering::SeqCst);
            return Err(SleuthError::BudgetExceeded(format!(
                "daily ceiling {:.4} USD reached (spent {:.4})",
                to_usd(self.daily_ceiling),
                to_usd(spent),
            )));
        }

        Ok(Reservation { micros })
    }

    /// Settle a reservation with the actual cost of the call. Overshoot
    /// beyond the estimate is charged as-is; it was already bounded by the
    /// per-call estimate being conservative.
    pub fn commit(&self, reservation: Reservation, actual_usd: f64) {
        let actual = to_micros(actual_usd);
        let reserved = reservation.micros;
        if actual >= reserved {
            let extra = actual - reserved;
            self.run_spent.fetch_add(extra, Ordering::SeqCst);
            self.daily_spent.fetch_add(extra, Ordering::SeqCst);
        } else {
            let refund = reserved - actual;
            self.run_spent.fetch_sub(refund, Ordering::SeqCst);
            self.daily_spent.fetch_sub(refund, Ordering::SeqCst);
        }
        debug!(cost_usd = actual_usd, "analyzer cost committed");
    }

    /// Return a reservation unspent (the call never went out).
    pub fn release(&self, reservation: Reservation) {
        self.run_spent.fetch_sub(reservation.micros, Ordering::SeqCst);
        self.daily_spent.fetch_sub(reservation.micros, Ordering::SeqCst);
    }

    /// Whether `estimate_usd` still fits under both ceilings. Advisory
    /// only; `reserve` remains the authoritative gate under concurrency.
    pub fn can_afford(&self, estimate_usd: f64) -> bool {
        let micros = to_micros(estimate_usd);
        self.run_spent.load(Ordering::SeqCst) + micros <= self.run_ceiling
            && self.daily_spent.load(Ordering::SeqCst) + micros <= self.daily_ceiling
    }

    pub fn run_spent_usd(&self) -> f64 {
        to_usd(self.run_spent.load(Ordering::SeqCst))
    }

    pub fn daily_spent_usd(&self) -> f64 {
        to_usd(self.daily_spent.load(Ordering::SeqCst))
    }

    fn roll_day(&self) {
        let today = Utc::now().date_naive();
        let mut day = self.day.lock().expect("day lock");
        if *day != today {
            info!(spent_usd = self.daily_spent_usd(), "daily budget counter reset");
            self.daily_spent.store(0, Ordering::SeqCst);
            *day = today;
        }
    }
}

/// Increment-then-compare claim against a single counter. On overflow the
/// claim is rolled back and the pre-claim spend is returned.
fn claim(counter: &AtomicU64, ceiling: u64, micros: u64) -> std::result::Result<(), u64> {
    let prior = counter.fetch_add(micros, Ordering::SeqCst);
    if prior + micros > ceiling {
        counter.fetch_sub(micros, Ordering::SeqCst);
        Err(prior)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_reserve_within_ceiling() {
        let ledger = CostLedger::new(1.0, 5.0);
        let r = ledger.reserve(0.10).unwrap();
        ledger.commit(r, 0.08);
        assert!((ledger.run_spent_usd() - 0.08).abs() < 1e-9);
    }

    #[test]
    fn test_reserve_rejects_over_run_ceiling() {
        let ledger = CostLedger::new(0.05, 5.0);
        let r = ledger.reserve(0.05).unwrap();
        ledger.commit(r, 0.05);
        assert!(matches!(
            ledger.reserve(0.01),
            Err(SleuthError::BudgetExceeded(_))
        ));
    }

    #[test]
    fn test_release_returns_headroom() {
        let ledger = CostLedger::new(0.10, 5.0);
        let r = ledger.reserve(0.10).unwrap();
        ledger.release(r);
        assert!(ledger.reserve(0.10).is_ok());
    }

    #[test]
    fn test_commit_refunds_unspent_estimate() {
        let ledger = CostLedger::new(0.10, 5.0);
        let r = ledger.reserve(0.10).unwrap();
        ledger.commit(r, 0.02);
        assert!(ledger.can_afford(0.08));
    }

    #[test]
    fn test_daily_ceiling_enforced_independently() {
        let ledger = CostLedger::new(10.0, 0.05);
        let r = ledger.reserve(0.05).unwrap();
        ledger.commit(r, 0.05);
        let err = ledger.reserve(0.01).unwrap_err();
        assert!(err.to_string().contains("daily"));
        // the failed daily claim must not leak into the run counter
        assert!((ledger.run_spent_usd() - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_ceiling() {
        // 10 threads race for a ceiling that fits only 4 reservations.
        let ledger = Arc::new(CostLedger::new(0.40, 5.0));
        let mut handles = Vec::new();
        for _ in 0..10 {
            let ledger = Arc::clone(&ledger);
            handles.push(std::thread::spawn(move || {
                ledger.reserve(0.10).map(|r| ledger.commit(r, 0.10)).is_ok()
            }));
        }
        let granted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|granted| *granted)
            .count();
        assert_eq!(granted, 4);
        assert!(ledger.run_spent_usd() <= 0.40 + 1e-9);
    }
}
