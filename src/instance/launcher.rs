//! External session launcher.
//!
//! The launcher is an opaque program invoked with five positional arguments:
//!
//! ```text
//! <launcher> <password> <password_hash> <expires_at_iso8601> <ttl_minutes|""> <port|"">
//! ```
//!
//! On success it exits 0 and prints `<port> <pid>` on stdout. It may instead
//! print nothing and only write the record into the state file itself; the
//! admission path in [`super::manager`] handles both.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::{KeeperError, KeeperResult};

/// Everything the launcher is told about a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub password: String,
    pub password_hash: String,
    pub expires_at: DateTime<Utc>,
    /// `None` tells the launcher not to arm its own auto-kill timer.
    pub ttl_minutes: Option<u32>,
    /// `None` lets the launcher pick a port.
    pub port: Option<u16>,
}

impl LaunchRequest {
    /// Positional arguments in launcher order.
    pub fn to_args(&self) -> [String; 5] {
        [
            self.password.clone(),
            self.password_hash.clone(),
            super::format_timestamp(&self.expires_at),
            self.ttl_minutes.map(|m| m.to_string()).unwrap_or_default(),
            self.port.map(|p| p.to_string()).unwrap_or_default(),
        ]
    }
}

/// A successful launcher run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutput {
    /// `(port, pid)` from stdout, or `None` if stdout was empty.
    pub reported: Option<(u16, i32)>,
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, request: &LaunchRequest) -> KeeperResult<LaunchOutput>;
}

/// Runs the launcher program as a subprocess with a hard timeout.
#[derive(Debug, Clone)]
pub struct ScriptLauncher {
    program: PathBuf,
    timeout: Duration,
}

impl ScriptLauncher {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl Launcher for ScriptLauncher {
    async fn launch(&self, request: &LaunchRequest) -> KeeperResult<LaunchOutput> {
        let mut cmd = Command::new(&self.program);
        cmd.args(request.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            program = %self.program.display(),
            port = ?request.port,
            ttl_minutes = ?request.ttl_minutes,
            "running launcher"
        );

        let child = cmd.spawn().map_err(|e| {
            KeeperError::LauncherFailure(format!(
                "could not run {}: {e}",
                self.program.display()
            ))
        })?;

        // Dropping the wait future on timeout kills the child (kill_on_drop),
        // but anything it already forked is not reaped here.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(KeeperError::LauncherFailure(format!(
                    "waiting for launcher: {e}"
                )));
            }
            Err(_) => {
                warn!(program = %self.program.display(), timeout_secs = self.timeout.as_secs(), "launcher timed out");
                return Err(KeeperError::LauncherTimeout(self.timeout.as_secs()));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if !output.status.success() {
            let diagnostic = [stderr.trim(), stdout.trim()]
                .into_iter()
                .find(|s| !s.is_empty())
                .unwrap_or("Unknown error")
                .to_string();
            warn!(
                exit_code = output.status.code().unwrap_or(-1),
                diagnostic = %diagnostic,
                "launcher failed"
            );
            return Err(KeeperError::LauncherFailure(diagnostic));
        }

        if !stderr.trim().is_empty() {
            debug!(stderr = %stderr.trim(), "launcher stderr");
        }

        let reported = parse_launch_output(&stdout)?;
        info!(reported = ?reported, "launcher finished");
        Ok(LaunchOutput { reported })
    }
}

/// Parse `<port> <pid>` from launcher stdout.
///
/// Empty output is `Ok(None)`. Otherwise the last non-empty line must start
/// with a port and a pid, so launchers that log progress to stdout still work.
pub fn parse_launch_output(stdout: &str) -> KeeperResult<Option<(u16, i32)>> {
    let Some(line) = stdout.lines().map(str::trim).rfind(|l| !l.is_empty()) else {
        return Ok(None);
    };

    let mut parts = line.split_whitespace();
    let (Some(port), Some(pid)) = (parts.next(), parts.next()) else {
        return Err(KeeperError::LauncherOutputMalformed(format!(
            "Unexpected script output format: {line}"
        )));
    };

    let port = port.parse::<u16>().map_err(|_| {
        KeeperError::LauncherOutputMalformed(format!("port {port:?} is not a port number"))
    })?;
    let pid = pid
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .ok_or_else(|| KeeperError::LauncherOutputMalformed(format!("pid {pid:?} is not a pid")))?;

    Ok(Some((port, pid)))
}
