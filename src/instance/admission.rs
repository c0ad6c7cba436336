//! Memory-budget admission control.
//!
//! A start is admitted when
//!
//! ```text
//! free_mb - min_reserved_mb - in_flight * per_instance_budget_mb >= per_instance_budget_mb
//! ```
//!
//! `in_flight` counts starts that passed the check but whose launch has not
//! finished yet. A freshly launched session has not consumed its budget when
//! the next request reads free memory, so each admitted start holds a
//! [`Reservation`] until its launch completes.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::warn;

use crate::error::{KeeperError, KeeperResult};

pub const DEFAULT_MIN_RESERVED_MB: u64 = 1024;
pub const DEFAULT_PER_INSTANCE_BUDGET_MB: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    pub min_reserved_mb: u64,
    pub per_instance_budget_mb: u64,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            min_reserved_mb: DEFAULT_MIN_RESERVED_MB,
            per_instance_budget_mb: DEFAULT_PER_INSTANCE_BUDGET_MB,
        }
    }
}

impl AdmissionPolicy {
    pub fn admits(&self, free_mb: u64, in_flight: u64) -> bool {
        let headroom = i128::from(free_mb)
            - i128::from(self.min_reserved_mb)
            - i128::from(in_flight) * i128::from(self.per_instance_budget_mb);
        headroom >= i128::from(self.per_instance_budget_mb)
    }
}

/// Counts admitted starts whose launch is still running.
#[derive(Debug, Default)]
pub struct AdmissionLedger {
    in_flight: Arc<Mutex<u64>>,
}

impl AdmissionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> u64 {
        *lock(&self.in_flight)
    }

    /// Check `free_mb` against `policy` and, if admitted, take a reservation.
    /// The check and the increment happen under one lock.
    pub fn try_reserve(&self, policy: &AdmissionPolicy, free_mb: u64) -> KeeperResult<Reservation> {
        let mut in_flight = lock(&self.in_flight);
        if !policy.admits(free_mb, *in_flight) {
            return Err(KeeperError::CapacityExceeded {
                free_mb,
                min_reserved_mb: policy.min_reserved_mb,
                per_instance_budget_mb: policy.per_instance_budget_mb,
                in_flight: *in_flight,
            });
        }
        *in_flight += 1;
        Ok(Reservation {
            in_flight: Arc::clone(&self.in_flight),
        })
    }
}

/// Held for the duration of one launch; released on drop.
#[derive(Debug)]
pub struct Reservation {
    in_flight: Arc<Mutex<u64>>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut in_flight = lock(&self.in_flight);
        *in_flight = in_flight.saturating_sub(1);
    }
}

fn lock(counter: &Mutex<u64>) -> MutexGuard<'_, u64> {
    match counter.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("admission ledger mutex poisoned; recovering");
            poisoned.into_inner()
        }
    }
}
