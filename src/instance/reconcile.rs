//! Expiration sweep: reconciles registry records against process liveness
//! and session expiry.
//!
//! Each record is judged on its own, in this order:
//!
//! 1. no usable pid            → removed (corrupt record)
//! 2. pid not alive            → removed, nothing to signal
//! 3. no `expires_at`          → SIGTERM (best effort), removed
//! 4. expiry > 50 years out    → timer disabled, kept
//! 5. `now >= expires_at`      → SIGTERM (best effort), removed
//! 6. otherwise                → kept

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::liveness::ProcessTable;
use super::{Expiry, InstanceRecord, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    MissingPid,
    ProcessExited,
    LegacyRecord,
    Expired,
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingPid => write!(f, "missing pid"),
            Self::ProcessExited => write!(f, "process exited"),
            Self::LegacyRecord => write!(f, "legacy record without expiry"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<(u16, RemovalReason)>,
    pub retained: usize,
}

impl SweepReport {
    pub fn changed(&self) -> bool {
        !self.removed.is_empty()
    }
}

/// Decide what to do with one record. `None` keeps it.
pub fn judge(
    record: &InstanceRecord,
    now: DateTime<Utc>,
    processes: &dyn ProcessTable,
) -> Option<RemovalReason> {
    let Some(pid) = record.live_pid() else {
        return Some(RemovalReason::MissingPid);
    };
    if !processes.probe(pid).is_alive() {
        return Some(RemovalReason::ProcessExited);
    }
    match record.expiry(now) {
        Expiry::Legacy => Some(RemovalReason::LegacyRecord),
        Expiry::Disabled => None,
        Expiry::At(at) if now >= at => Some(RemovalReason::Expired),
        Expiry::At(_) => None,
    }
}

/// Sweep `registry` in place, signalling processes whose records are removed
/// for legacy or expiry reasons. Signal failures are ignored.
///
/// The caller persists the registry once afterwards if anything changed.
pub fn sweep(
    registry: &mut Registry,
    now: DateTime<Utc>,
    processes: &dyn ProcessTable,
) -> SweepReport {
    let mut report = SweepReport::default();

    registry.retain(|port, record| {
        let Some(reason) = judge(record, now, processes) else {
            report.retained += 1;
            return true;
        };

        if matches!(reason, RemovalReason::LegacyRecord | RemovalReason::Expired) {
            if let Some(pid) = record.live_pid() {
                if let Err(e) = processes.terminate(pid) {
                    debug!(port, pid, error = %e, "SIGTERM failed (ignoring)");
                }
            }
        }

        info!(port, pid = ?record.pid, %reason, "removing instance record");
        report.removed.push((*port, reason));
        false
    });

    report
}
