//! In-memory stand-ins for the host: a process table, a memory gauge and a
//! launcher. Shared by the lifecycle and HTTP tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use jupyter_keeper::error::{KeeperError, KeeperResult};
use jupyter_keeper::instance::gauge::MemoryGauge;
use jupyter_keeper::instance::launcher::{LaunchOutput, LaunchRequest, Launcher};
use jupyter_keeper::instance::liveness::{Liveness, ProcessTable};
use jupyter_keeper::instance::registry::InstanceRegistry;
use jupyter_keeper::instance::{InstanceManager, InstanceRecord, ManagerSettings};

pub const RSS_MB: u64 = 180;

// ---------------------------------------------------------------------------
// Process table
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeProcesses {
    alive: Mutex<HashSet<i32>>,
    terminated: Mutex<Vec<i32>>,
}

impl FakeProcesses {
    pub fn spawn(&self, pid: i32) {
        self.alive.lock().unwrap().insert(pid);
    }

    pub fn terminated(&self) -> Vec<i32> {
        self.terminated.lock().unwrap().clone()
    }
}

impl ProcessTable for FakeProcesses {
    fn probe(&self, pid: i32) -> Liveness {
        if self.alive.lock().unwrap().contains(&pid) {
            Liveness::Alive
        } else {
            Liveness::Dead
        }
    }

    fn terminate(&self, pid: i32) -> io::Result<()> {
        self.terminated.lock().unwrap().push(pid);
        if self.alive.lock().unwrap().remove(&pid) {
            Ok(())
        } else {
            Err(io::Error::from_raw_os_error(libc::ESRCH))
        }
    }
}

// ---------------------------------------------------------------------------
// Memory gauge
// ---------------------------------------------------------------------------

pub struct FakeMemory {
    free_mb: AtomicU64,
}

impl FakeMemory {
    pub fn new(free_mb: u64) -> Self {
        Self {
            free_mb: AtomicU64::new(free_mb),
        }
    }

    pub fn set_free(&self, free_mb: u64) {
        self.free_mb.store(free_mb, Ordering::SeqCst);
    }
}

impl MemoryGauge for FakeMemory {
    fn free_memory_mb(&self) -> io::Result<u64> {
        Ok(self.free_mb.load(Ordering::SeqCst))
    }

    fn resident_memory_mb(&self, _pid: i32) -> Option<u64> {
        Some(RSS_MB)
    }
}

// ---------------------------------------------------------------------------
// Launcher
// ---------------------------------------------------------------------------

pub enum LaunchMode {
    /// Print `<port> <pid>` on stdout.
    Report,
    /// Write the record into the state file and print nothing.
    Silent { state_file: PathBuf },
    /// Exit non-zero with this diagnostic.
    Fail(String),
}

pub struct FakeLauncher {
    mode: LaunchMode,
    delay: Duration,
    processes: Arc<FakeProcesses>,
    next_pid: AtomicI32,
    next_port: AtomicU16,
    requests: Mutex<Vec<LaunchRequest>>,
}

impl FakeLauncher {
    pub fn new(mode: LaunchMode, processes: Arc<FakeProcesses>) -> Self {
        Self {
            mode,
            delay: Duration::ZERO,
            processes,
            next_pid: AtomicI32::new(4000),
            next_port: AtomicU16::new(8000),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn requests(&self) -> Vec<LaunchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, request: &LaunchRequest) -> KeeperResult<LaunchOutput> {
        self.requests.lock().unwrap().push(request.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let port = request
            .port
            .unwrap_or_else(|| self.next_port.fetch_add(1, Ordering::SeqCst));
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);

        match &self.mode {
            LaunchMode::Report => {
                self.processes.spawn(pid);
                Ok(LaunchOutput {
                    reported: Some((port, pid)),
                })
            }
            LaunchMode::Silent { state_file } => {
                self.processes.spawn(pid);
                let record = InstanceRecord::new(
                    pid,
                    Utc::now(),
                    request.expires_at,
                    "written-by-launcher".into(),
                );
                InstanceRegistry::new(state_file).update(|registry| {
                    registry.insert(port, record);
                    Ok(())
                })?;
                Ok(LaunchOutput { reported: None })
            }
            LaunchMode::Fail(diagnostic) => Err(KeeperError::LauncherFailure(diagnostic.clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub dir: tempfile::TempDir,
    pub state_file: PathBuf,
    pub processes: Arc<FakeProcesses>,
    pub memory: Arc<FakeMemory>,
    pub launcher: Arc<FakeLauncher>,
    pub manager: Arc<InstanceManager>,
}

impl Harness {
    /// A manager with default settings, `free_mb` of free memory and a
    /// launcher that reports on stdout.
    pub fn new(free_mb: u64) -> Self {
        Self::build(free_mb, |_, processes| {
            FakeLauncher::new(LaunchMode::Report, processes)
        })
    }

    pub fn build(
        free_mb: u64,
        launcher: impl FnOnce(&Path, Arc<FakeProcesses>) -> FakeLauncher,
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let state_file = dir.path().join("instances").join("jupyter_instances.json");
        let processes = Arc::new(FakeProcesses::default());
        let memory = Arc::new(FakeMemory::new(free_mb));
        let launcher = Arc::new(launcher(&state_file, Arc::clone(&processes)));

        let manager = InstanceManager::new(
            ManagerSettings::default(),
            InstanceRegistry::new(&state_file),
            launcher.clone(),
        )
        .with_processes(processes.clone())
        .with_memory(memory.clone());

        Self {
            dir,
            state_file,
            processes,
            memory,
            launcher,
            manager: Arc::new(manager),
        }
    }

    pub fn write_state(&self, json: &str) {
        std::fs::create_dir_all(self.state_file.parent().unwrap()).unwrap();
        std::fs::write(&self.state_file, json).unwrap();
    }

    pub fn read_state(&self) -> String {
        std::fs::read_to_string(&self.state_file).unwrap()
    }

    pub fn state_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.read_state()).unwrap()
    }
}
