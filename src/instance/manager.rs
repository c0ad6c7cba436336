//! The lifecycle manager: ties the registry, liveness probe, memory gauge,
//! admission ledger and launcher together behind `list`, `start` and `stop`.
//!
//! Every read path (`list`, `start`, `capacity`) runs the reconciliation
//! sweep first.

use std::ops::RangeInclusive;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::admission::{AdmissionLedger, AdmissionPolicy, Reservation};
use super::credentials::{PasswordHasher, Sha256Hasher, generate_password};
use super::gauge::{MemoryGauge, ProcMemory, total_tracked_memory_mb};
use super::launcher::{LaunchRequest, Launcher};
use super::liveness::{HostProcesses, ProcessTable};
use super::reconcile::{SweepReport, sweep};
use super::registry::InstanceRegistry;
use super::{
    Expiry, InstanceRecord, Registry, TIMER_DISABLED_HORIZON_YEARS, disabled_timer_sentinel,
};
use crate::error::{KeeperError, KeeperResult};

/// Policy knobs for the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSettings {
    pub policy: AdmissionPolicy,
    pub default_session_minutes: u32,
    pub max_session_minutes: Option<u32>,
    pub port_range: RangeInclusive<u16>,
    pub password_length_bytes: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            policy: AdmissionPolicy::default(),
            default_session_minutes: 60,
            max_session_minutes: None,
            port_range: 8000..=9999,
            password_length_bytes: 10,
        }
    }
}

/// Parameters of one `start` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartRequest {
    pub session_minutes: Option<u32>,
    /// `None` (or `Some(0)`) lets the launcher pick the port.
    pub port: Option<u16>,
    /// Empty or `None` generates a password.
    pub password: Option<String>,
    pub disable_timer: bool,
}

/// Result of a successful `start`. This is the only place the plaintext
/// password is ever returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedInstance {
    pub port: u16,
    pub pid: i32,
    pub password: String,
    /// `None` when the timer is disabled.
    pub expires_at: Option<DateTime<Utc>>,
}

/// One tracked session as reported by `list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceView {
    pub port: u16,
    pub pid: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    /// `None` when the timer is disabled.
    pub expires_at: Option<DateTime<Utc>>,
    pub password: Option<String>,
    pub running: bool,
    pub estimated_memory_mb: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacityReport {
    pub free_mb: u64,
    pub tracked_mb: u64,
    pub in_flight: u64,
    pub policy: AdmissionPolicy,
    pub admissible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionTimer {
    Disabled,
    Minutes(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeOutcome {
    Inserted,
    Replaced,
    KeptLauncherRecord,
    Occupied { owner: i32 },
}

pub struct InstanceManager {
    settings: ManagerSettings,
    registry: InstanceRegistry,
    processes: Arc<dyn ProcessTable>,
    memory: Arc<dyn MemoryGauge>,
    launcher: Arc<dyn Launcher>,
    hasher: Arc<dyn PasswordHasher>,
    ledger: AdmissionLedger,
}

impl InstanceManager {
    /// A manager using the host's process table, `/proc` and the SHA-256
    /// hasher. Swap any of them with the `with_*` methods.
    pub fn new(
        settings: ManagerSettings,
        registry: InstanceRegistry,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        Self {
            settings,
            registry,
            processes: Arc::new(HostProcesses),
            memory: Arc::new(ProcMemory::default()),
            launcher,
            hasher: Arc::new(Sha256Hasher),
            ledger: AdmissionLedger::new(),
        }
    }

    pub fn with_processes(mut self, processes: Arc<dyn ProcessTable>) -> Self {
        self.processes = processes;
        self
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryGauge>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn PasswordHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    pub fn registry_path(&self) -> &Path {
        self.registry.path()
    }

    /// Run the expiration sweep and persist once if anything was removed.
    pub fn reconcile(&self) -> KeeperResult<SweepReport> {
        let now = Utc::now();
        let report = self
            .registry
            .update(|registry| Ok(sweep(registry, now, self.processes.as_ref())))?;
        if report.changed() {
            info!(
                removed = report.removed.len(),
                retained = report.retained,
                "registry reconciled"
            );
        }
        Ok(report)
    }

    pub fn list(&self) -> KeeperResult<Vec<InstanceView>> {
        self.reconcile()?;
        let registry = self.registry.load()?;
        let now = Utc::now();
        Ok(registry
            .iter()
            .map(|(port, record)| self.view(port, record, now))
            .collect())
    }

    pub fn capacity(&self) -> KeeperResult<CapacityReport> {
        self.reconcile()?;
        let free_mb = self.free_memory_mb()?;
        let registry = self.registry.load()?;
        let tracked_mb =
            total_tracked_memory_mb(&registry, self.processes.as_ref(), self.memory.as_ref());
        let in_flight = self.ledger.in_flight();
        Ok(CapacityReport {
            free_mb,
            tracked_mb,
            in_flight,
            policy: self.settings.policy,
            admissible: self.settings.policy.admits(free_mb, in_flight),
        })
    }

    /// Start a session. Registry and memory access run on the blocking pool;
    /// only the hasher and the launcher are awaited on the runtime.
    pub async fn start(self: &Arc<Self>, request: StartRequest) -> KeeperResult<StartedInstance> {
        let timer = self.resolve_timer(&request)?;
        let requested_port = request.port.filter(|port| *port != 0);
        if let Some(port) = requested_port {
            if !self.settings.port_range.contains(&port) {
                return Err(KeeperError::InvalidRequest(format!(
                    "port {port} outside {}..={}",
                    self.settings.port_range.start(),
                    self.settings.port_range.end()
                )));
            }
        }

        let (free_mb, _reservation) = self
            .blocking(move |manager| manager.admit(requested_port))
            .await?;

        let password = match request.password.filter(|p| !p.is_empty()) {
            Some(password) => password,
            None => generate_password(self.settings.password_length_bytes)?,
        };
        let password_hash = self.hasher.hash(&password).await?;

        let now = Utc::now();
        let (expires_at, ttl_minutes) = match timer {
            SessionTimer::Disabled => (disabled_timer_sentinel(now), None),
            SessionTimer::Minutes(minutes) => (session_expiry(now, minutes)?, Some(minutes)),
        };

        info!(
            port = ?requested_port,
            ttl_minutes = ?ttl_minutes,
            free_mb,
            "starting session"
        );

        let launch = LaunchRequest {
            password: password.clone(),
            password_hash: password_hash.clone(),
            expires_at,
            ttl_minutes,
            port: requested_port,
        };
        let output = self.launcher.launch(&launch).await?;

        let record = InstanceRecord::new(0, now, expires_at, password_hash);
        let (port, pid) = self
            .blocking(move |manager| manager.record_launch(output.reported, requested_port, record))
            .await?;

        Ok(StartedInstance {
            port,
            pid,
            password,
            expires_at: ttl_minutes.map(|_| expires_at),
        })
    }

    /// Signal the session on `port` and drop its record. Signal failures are
    /// ignored; the process may already be gone.
    pub fn stop(&self, port: u16) -> KeeperResult<()> {
        let removed = self.registry.update(|registry| {
            let record = registry.get(port).ok_or(KeeperError::NotFound(port))?;
            if let Some(pid) = record.live_pid() {
                if let Err(e) = self.processes.terminate(pid) {
                    debug!(port, pid, error = %e, "SIGTERM failed (ignoring)");
                }
            }
            Ok(registry.remove(port))
        })?;
        info!(port, pid = ?removed.and_then(|r| r.pid), "session stopped");
        Ok(())
    }

    /// Run [`Self::reconcile`] every `interval` on a blocking thread.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; startup already swept.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let manager = Arc::clone(&manager);
                match tokio::task::spawn_blocking(move || manager.reconcile()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "periodic sweep failed"),
                    Err(e) => warn!(error = %e, "periodic sweep panicked"),
                }
            }
        })
    }

    /// Run a synchronous manager call on the blocking pool.
    pub async fn blocking<T, F>(self: &Arc<Self>, f: F) -> KeeperResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&InstanceManager) -> KeeperResult<T> + Send + 'static,
    {
        let manager = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&manager))
            .await
            .map_err(|e| KeeperError::io("manager task", std::io::Error::other(e)))?
    }

    /// Sweep, check the requested port, then take an admission reservation.
    fn admit(&self, requested_port: Option<u16>) -> KeeperResult<(u64, Reservation)> {
        self.reconcile()?;
        if let Some(port) = requested_port {
            if self.registry.load()?.contains(port) {
                return Err(KeeperError::PortInUse(port));
            }
        }

        let free_mb = self.free_memory_mb()?;
        let reservation = self
            .ledger
            .try_reserve(&self.settings.policy, free_mb)
            .inspect_err(|e| warn!(error = %e, "start rejected"))?;
        Ok((free_mb, reservation))
    }

    /// Resolve `(port, pid)` for a finished launch and merge its record.
    ///
    /// A port still owned by another live tracked process is never taken
    /// over: the new process is signalled and the start fails.
    fn record_launch(
        &self,
        reported: Option<(u16, i32)>,
        requested_port: Option<u16>,
        mut record: InstanceRecord,
    ) -> KeeperResult<(u16, i32)> {
        let (port, pid) = match reported {
            Some(reported) => reported,
            None => self.recover_launch_result(requested_port)?,
        };
        record.pid = Some(pid);

        let processes = self.processes.as_ref();
        let outcome = self
            .registry
            .update(|registry| Ok(merge_launched(registry, port, record, processes)))?;

        if let MergeOutcome::Occupied { owner } = outcome {
            warn!(port, pid, owner, "launcher reported a port owned by a live session");
            if let Err(e) = self.processes.terminate(pid) {
                debug!(port, pid, error = %e, "SIGTERM failed (ignoring)");
            }
            return Err(KeeperError::PortInUse(port));
        }

        info!(port, pid, ?outcome, "session started");
        Ok((port, pid))
    }

    fn resolve_timer(&self, request: &StartRequest) -> KeeperResult<SessionTimer> {
        if request.disable_timer {
            return Ok(SessionTimer::Disabled);
        }
        let minutes = request
            .session_minutes
            .unwrap_or(self.settings.default_session_minutes);
        if minutes == 0 {
            return Err(KeeperError::InvalidRequest(
                "session_minutes must be at least 1".into(),
            ));
        }
        if minutes >= MAX_TIMED_SESSION_MINUTES {
            return Err(KeeperError::InvalidRequest(format!(
                "session_minutes {minutes} reaches the {TIMER_DISABLED_HORIZON_YEARS}-year horizon; \
                 use disable_timer for open-ended sessions"
            )));
        }
        if let Some(max) = self.settings.max_session_minutes {
            if minutes > max {
                return Err(KeeperError::InvalidRequest(format!(
                    "session_minutes {minutes} exceeds the {max} minute limit"
                )));
            }
        }
        Ok(SessionTimer::Minutes(minutes))
    }

    /// The launcher printed nothing: accept a record it wrote itself for the
    /// requested port.
    fn recover_launch_result(&self, requested_port: Option<u16>) -> KeeperResult<(u16, i32)> {
        let missing = || {
            KeeperError::LauncherOutputMalformed(
                "Script returned no output and state file not updated".into(),
            )
        };
        let port = requested_port.ok_or_else(missing)?;
        let registry = self.registry.load()?;
        let pid = registry
            .get(port)
            .and_then(InstanceRecord::live_pid)
            .ok_or_else(missing)?;
        info!(port, pid, "recovered launch result from state file");
        Ok((port, pid))
    }

    fn free_memory_mb(&self) -> KeeperResult<u64> {
        self.memory
            .free_memory_mb()
            .map_err(|e| KeeperError::io("reading free memory", e))
    }

    fn view(&self, port: u16, record: &InstanceRecord, now: DateTime<Utc>) -> InstanceView {
        let pid = record.live_pid();
        let running = pid.is_some_and(|pid| self.processes.probe(pid).is_alive());
        let estimated_memory_mb = match pid {
            Some(pid) if running => self.memory.resident_memory_mb(pid).unwrap_or(0),
            _ => 0,
        };
        let expires_at = match record.expiry(now) {
            Expiry::At(at) => Some(at),
            Expiry::Disabled | Expiry::Legacy => None,
        };
        InstanceView {
            port,
            pid: record.pid,
            started_at: record.started_at,
            expires_at,
            password: record.password.clone(),
            running,
            estimated_memory_mb,
        }
    }
}

/// Longest timed session: anything at or past the disabled-timer horizon
/// would read back as "timer disabled".
const MAX_TIMED_SESSION_MINUTES: u32 =
    (TIMER_DISABLED_HORIZON_YEARS * 365.25 * 24.0 * 60.0) as u32;

fn session_expiry(now: DateTime<Utc>, minutes: u32) -> KeeperResult<DateTime<Utc>> {
    now.checked_add_signed(chrono::Duration::minutes(i64::from(minutes)))
        .ok_or_else(|| {
            KeeperError::InvalidRequest(format!("session_minutes {minutes} is out of range"))
        })
}

/// Make the launched session's record visible exactly once, whichever side
/// wrote it first. A record held by a different live process is left alone.
fn merge_launched(
    registry: &mut Registry,
    port: u16,
    record: InstanceRecord,
    processes: &dyn ProcessTable,
) -> MergeOutcome {
    match registry.get(port) {
        Some(existing) if existing.live_pid() == record.pid && existing.expires_at.is_some() => {
            MergeOutcome::KeptLauncherRecord
        }
        Some(existing) => match existing.live_pid() {
            Some(owner) if Some(owner) != record.pid && processes.probe(owner).is_alive() => {
                MergeOutcome::Occupied { owner }
            }
            _ => {
                registry.insert(port, record);
                MergeOutcome::Replaced
            }
        },
        None => {
            registry.insert(port, record);
            MergeOutcome::Inserted
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::liveness::Liveness;

    /// Only the listed pids are running.
    struct Running(Vec<i32>);

    impl ProcessTable for Running {
        fn probe(&self, pid: i32) -> Liveness {
            if self.0.contains(&pid) {
                Liveness::Alive
            } else {
                Liveness::Dead
            }
        }

        fn terminate(&self, _pid: i32) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn record(pid: i32) -> InstanceRecord {
        let now = Utc::now();
        InstanceRecord::new(pid, now, now + chrono::Duration::hours(1), "ours".into())
    }

    #[test]
    fn merge_inserts_when_launcher_wrote_nothing() {
        let mut registry = Registry::new();
        assert_eq!(
            merge_launched(&mut registry, 9001, record(10), &Running(vec![10])),
            MergeOutcome::Inserted
        );
        assert_eq!(registry.get(9001).unwrap().pid, Some(10));
    }

    #[test]
    fn merge_is_idempotent_against_launcher_record() {
        let running = Running(vec![10]);
        let mut launcher_written = record(10);
        launcher_written.password = Some("theirs".into());
        let mut registry: Registry = [(9001, launcher_written.clone())].into_iter().collect();

        assert_eq!(
            merge_launched(&mut registry, 9001, record(10), &running),
            MergeOutcome::KeptLauncherRecord
        );
        assert_eq!(registry.get(9001), Some(&launcher_written));
        // A second merge changes nothing either.
        merge_launched(&mut registry, 9001, record(10), &running);
        assert_eq!(registry.get(9001), Some(&launcher_written));
    }

    #[test]
    fn merge_replaces_stale_or_partial_records() {
        let running = Running(vec![10, 11]);
        let mut partial = record(10);
        partial.expires_at = None;
        let mut registry: Registry = [(9001, partial), (9002, record(99))].into_iter().collect();

        assert_eq!(
            merge_launched(&mut registry, 9001, record(10), &running),
            MergeOutcome::Replaced
        );
        assert!(registry.get(9001).unwrap().expires_at.is_some());

        // pid 99 is gone, so its port is free to take over.
        assert_eq!(
            merge_launched(&mut registry, 9002, record(11), &running),
            MergeOutcome::Replaced
        );
        assert_eq!(registry.get(9002).unwrap().pid, Some(11));
    }

    #[test]
    fn merge_never_evicts_a_live_owner() {
        let running = Running(vec![50, 51]);
        let owner = record(50);
        let mut registry: Registry = [(9003, owner.clone())].into_iter().collect();

        assert_eq!(
            merge_launched(&mut registry, 9003, record(51), &running),
            MergeOutcome::Occupied { owner: 50 }
        );
        assert_eq!(registry.get(9003), Some(&owner));
    }

    #[test]
    fn timed_sessions_stay_below_the_disabled_horizon() {
        let manager = InstanceManager::new(
            ManagerSettings::default(),
            InstanceRegistry::new("/nonexistent/state.json"),
            Arc::new(crate::instance::launcher::ScriptLauncher::new(
                "/bin/false",
                Duration::from_secs(1),
            )),
        );
        let timed = |minutes| StartRequest {
            session_minutes: Some(minutes),
            ..StartRequest::default()
        };

        assert_eq!(
            manager.resolve_timer(&timed(MAX_TIMED_SESSION_MINUTES - 1)).unwrap(),
            SessionTimer::Minutes(MAX_TIMED_SESSION_MINUTES - 1)
        );
        for minutes in [MAX_TIMED_SESSION_MINUTES, u32::MAX] {
            assert!(matches!(
                manager.resolve_timer(&timed(minutes)),
                Err(KeeperError::InvalidRequest(_))
            ));
        }

        let now = Utc::now();
        let expiry = session_expiry(now, MAX_TIMED_SESSION_MINUTES - 1).unwrap();
        assert!(!crate::instance::timer_disabled(expiry, now));
    }
}
