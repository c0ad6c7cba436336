//! End-to-end lifecycle tests against a temp state file and fake host.
//!
//! Tested in this file:
//! - sweeping expired, dead and legacy records on list
//! - start with and without the session timer
//! - admission under concurrent starts
//! - session lengths that would overflow the stored timestamp
//! - launcher ports already owned by a live session
//! - starts waiting on a locked registry without stalling the runtime
//! - stop, including unknown ports
//! - recovering the launch result from the state file
//! - corrupt state handling

mod common;

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use common::{FakeLauncher, Harness, LaunchMode, RSS_MB};
use jupyter_keeper::error::KeeperError;
use jupyter_keeper::instance::{StartRequest, format_timestamp};
use jupyter_keeper::instance::credentials::Sha256Hasher;
use jupyter_keeper::instance::registry::InstanceRegistry;

fn ts(value: &serde_json::Value) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value.as_str().unwrap())
        .unwrap()
        .with_timezone(&Utc)
}

// ---------------------------------------------------------------------------
// Reconciliation
// ---------------------------------------------------------------------------

#[test]
fn list_sweeps_expired_sessions_and_signals_them() {
    let h = Harness::new(8192);
    h.processes.spawn(4242);
    h.write_state(
        r#"{"9001": {"pid": 4242, "started_at": "2020-01-01T00:00:00+00:00",
                     "expires_at": "2020-01-01T01:00:00+00:00", "password": "h"}}"#,
    );

    let sessions = h.manager.list().unwrap();

    assert!(sessions.is_empty());
    assert_eq!(h.processes.terminated(), vec![4242]);
    assert_eq!(h.state_json(), serde_json::json!({}));
}

#[test]
fn list_drops_dead_and_legacy_records_but_keeps_live_ones() {
    let h = Harness::new(8192);
    h.processes.spawn(10);
    h.processes.spawn(30);
    let later = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
    h.write_state(&format!(
        r#"{{
            "8001": {{"pid": 10, "started_at": "2026-01-01T00:00:00", "expires_at": "{later}"}},
            "8002": {{"pid": 20, "started_at": "2026-01-01T00:00:00", "expires_at": "{later}"}},
            "8003": {{"pid": 30, "started_at": "2026-01-01T00:00:00"}}
        }}"#
    ));

    let sessions = h.manager.list().unwrap();

    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].port, 8001);
    assert!(sessions[0].running);
    assert_eq!(sessions[0].estimated_memory_mb, RSS_MB);
    // The dead pid is not signalled; the legacy one is.
    assert_eq!(h.processes.terminated(), vec![30]);
}

#[test]
fn sweep_without_removals_leaves_the_file_untouched() {
    let h = Harness::new(8192);
    h.processes.spawn(77);
    let later = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
    // Compact on purpose: any rewrite would pretty-print it.
    let original = format!(
        r#"{{"8500":{{"pid":77,"started_at":"2026-01-01T00:00:00+00:00","expires_at":"{later}"}}}}"#
    );
    h.write_state(&original);

    let report = h.manager.reconcile().unwrap();

    assert!(!report.changed());
    assert_eq!(h.read_state(), original);
}

#[test]
fn corrupt_state_is_reported_and_left_alone() {
    let h = Harness::new(8192);
    h.write_state("{not json");

    assert!(matches!(
        h.manager.list(),
        Err(KeeperError::CorruptState { .. })
    ));
    assert_eq!(h.read_state(), "{not json");
}

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_hands_the_launcher_a_hash_and_records_it() {
    let h = Harness::new(8192);

    let started = h
        .manager
        .start(StartRequest {
            session_minutes: Some(30),
            ..StartRequest::default()
        })
        .await
        .unwrap();

    let requests = h.launcher.requests();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.ttl_minutes, Some(30));
    assert_eq!(request.port, None);
    assert_eq!(request.password, started.password);
    assert!(Sha256Hasher::verify(&started.password, &request.password_hash));

    let expires_at = started.expires_at.unwrap();
    let ttl = expires_at - Utc::now();
    assert!(ttl > chrono::Duration::minutes(29) && ttl <= chrono::Duration::minutes(30));

    let state = h.state_json();
    let record = &state[started.port.to_string()];
    assert_eq!(record["pid"], serde_json::json!(started.pid));
    assert_eq!(record["password"], serde_json::json!(request.password_hash));
    assert_eq!(record["expires_at"], format_timestamp(&expires_at));
}

#[tokio::test]
async fn disabled_timer_session_lists_without_expiry() {
    let h = Harness::new(8192);

    let started = h
        .manager
        .start(StartRequest {
            disable_timer: true,
            password: Some("hunter2".into()),
            ..StartRequest::default()
        })
        .await
        .unwrap();

    assert_eq!(started.password, "hunter2");
    assert_eq!(started.expires_at, None);
    assert_eq!(h.launcher.requests()[0].ttl_minutes, None);

    // The wire keeps a far-future timestamp.
    let stored = ts(&h.state_json()[started.port.to_string()]["expires_at"]);
    assert!(stored - Utc::now() > chrono::Duration::days(365 * 99));

    let sessions = h.manager.list().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].expires_at, None);
    assert!(sessions[0].running);
}

#[tokio::test]
async fn start_is_refused_when_memory_is_short() {
    let h = Harness::new(2047);

    let err = h.manager.start(StartRequest::default()).await.unwrap_err();

    assert!(matches!(err, KeeperError::CapacityExceeded { free_mb: 2047, .. }));
    assert!(err.to_string().starts_with("Not enough free RAM"));
    assert!(h.launcher.requests().is_empty());
    assert!(!h.state_file.exists());
}

#[tokio::test]
async fn concurrent_starts_admit_only_what_fits() {
    let h = Harness::build(2048, |_, processes| {
        FakeLauncher::new(LaunchMode::Report, processes).with_delay(Duration::from_millis(50))
    });

    let (first, second) = tokio::join!(
        h.manager.start(StartRequest::default()),
        h.manager.start(StartRequest::default()),
    );

    let outcomes = [first, second];
    let admitted = outcomes.iter().filter(|r| r.is_ok()).count();
    let refused = outcomes
        .iter()
        .filter(|r| matches!(r, Err(KeeperError::CapacityExceeded { .. })))
        .count();
    assert_eq!((admitted, refused), (1, 1));
    assert_eq!(h.launcher.requests().len(), 1);
    assert_eq!(h.manager.capacity().unwrap().in_flight, 0);
}

#[tokio::test]
async fn requested_port_must_be_free_and_in_range() {
    let h = Harness::new(8192);
    h.manager
        .start(StartRequest {
            port: Some(8800),
            ..StartRequest::default()
        })
        .await
        .unwrap();

    let taken = h
        .manager
        .start(StartRequest {
            port: Some(8800),
            ..StartRequest::default()
        })
        .await;
    assert!(matches!(taken, Err(KeeperError::PortInUse(8800))));

    let outside = h
        .manager
        .start(StartRequest {
            port: Some(22),
            ..StartRequest::default()
        })
        .await;
    assert!(matches!(outside, Err(KeeperError::InvalidRequest(_))));
    assert_eq!(h.launcher.requests().len(), 1);
}

#[tokio::test]
async fn zero_minute_session_is_invalid() {
    let h = Harness::new(8192);
    let err = h
        .manager
        .start(StartRequest {
            session_minutes: Some(0),
            ..StartRequest::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, KeeperError::InvalidRequest(_)));
}

#[tokio::test]
async fn overlong_session_is_invalid_and_state_stays_readable() {
    let h = Harness::new(8192);

    let err = h
        .manager
        .start(StartRequest {
            session_minutes: Some(u32::MAX),
            ..StartRequest::default()
        })
        .await
        .unwrap_err();

    assert!(matches!(err, KeeperError::InvalidRequest(_)));
    assert!(h.launcher.requests().is_empty());
    assert_eq!(h.manager.capacity().unwrap().in_flight, 0);

    // A bounded session afterwards still round-trips through the file.
    let started = h
        .manager
        .start(StartRequest {
            session_minutes: Some(60 * 24 * 365 * 10),
            ..StartRequest::default()
        })
        .await
        .unwrap();
    let sessions = h.manager.list().unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].port, started.port);
    assert_eq!(
        sessions[0].expires_at.as_ref().map(format_timestamp),
        started.expires_at.as_ref().map(format_timestamp)
    );
}

#[tokio::test]
async fn launcher_port_owned_by_a_live_session_is_not_taken_over() {
    let h = Harness::new(8192);
    h.processes.spawn(10);
    let later = format_timestamp(&(Utc::now() + chrono::Duration::hours(1)));
    h.write_state(&format!(
        r#"{{"8000": {{"pid": 10, "started_at": "2026-01-01T00:00:00+00:00",
                      "expires_at": "{later}", "password": "owner"}}}}"#
    ));

    // The fake launcher hands out 8000 when no port is requested.
    let err = h.manager.start(StartRequest::default()).await.unwrap_err();

    assert!(matches!(err, KeeperError::PortInUse(8000)));
    assert_eq!(h.processes.terminated(), vec![4000]);
    let state = h.state_json();
    assert_eq!(state.as_object().unwrap().len(), 1);
    assert_eq!(state["8000"]["pid"], 10);
    assert_eq!(state["8000"]["password"], "owner");
    assert_eq!(h.manager.capacity().unwrap().in_flight, 0);
}

#[tokio::test]
async fn start_behind_a_held_registry_lock_keeps_the_runtime_responsive() {
    let h = Harness::new(8192);
    let (locked_tx, locked_rx) = mpsc::channel();
    let state_file = h.state_file.clone();
    let holder = thread::spawn(move || {
        InstanceRegistry::new(state_file)
            .update(|_| {
                locked_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(500));
                Ok(())
            })
            .unwrap();
    });
    locked_rx.recv().unwrap();

    let ticker = tokio::spawn(async {
        let mut worst = Duration::ZERO;
        let mut last = Instant::now();
        for _ in 0..40 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let now = Instant::now();
            worst = worst.max(now - last);
            last = now;
        }
        worst
    });

    let started = h.manager.start(StartRequest::default()).await;
    let worst = ticker.await.unwrap();
    holder.join().unwrap();

    assert!(started.is_ok(), "{started:?}");
    assert!(worst < Duration::from_millis(250), "runtime stalled for {worst:?}");
}

#[tokio::test]
async fn launcher_failure_releases_the_reservation() {
    let h = Harness::build(2048, |_, processes| {
        FakeLauncher::new(LaunchMode::Fail("port busy".into()), processes)
    });

    let err = h.manager.start(StartRequest::default()).await.unwrap_err();

    assert_eq!(err.to_string(), "Failed to start Jupyter: port busy");
    let capacity = h.manager.capacity().unwrap();
    assert_eq!(capacity.in_flight, 0);
    assert!(capacity.admissible);
    assert!(h.manager.list().unwrap().is_empty());
}

#[tokio::test]
async fn silent_launcher_is_recovered_from_the_state_file() {
    let h = Harness::build(8192, |state_file, processes| {
        FakeLauncher::new(
            LaunchMode::Silent {
                state_file: state_file.to_path_buf(),
            },
            processes,
        )
    });

    let started = h
        .manager
        .start(StartRequest {
            port: Some(8123),
            ..StartRequest::default()
        })
        .await
        .unwrap();

    assert_eq!(started.port, 8123);
    assert_eq!(started.pid, 4000);
    // The launcher's own record is kept rather than duplicated.
    let state = h.state_json();
    assert_eq!(state.as_object().unwrap().len(), 1);
    assert_eq!(state["8123"]["password"], "written-by-launcher");
}

#[tokio::test]
async fn silent_launcher_without_a_port_is_an_error() {
    let h = Harness::build(8192, |state_file, processes| {
        FakeLauncher::new(
            LaunchMode::Silent {
                state_file: state_file.to_path_buf(),
            },
            processes,
        )
    });

    let err = h.manager.start(StartRequest::default()).await.unwrap_err();

    assert!(matches!(err, KeeperError::LauncherOutputMalformed(_)));
}

// ---------------------------------------------------------------------------
// Stop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_signals_and_forgets_the_session() {
    let h = Harness::new(8192);
    let started = h.manager.start(StartRequest::default()).await.unwrap();

    h.manager.stop(started.port).unwrap();

    assert_eq!(h.processes.terminated(), vec![started.pid]);
    assert_eq!(h.state_json(), serde_json::json!({}));
    assert!(matches!(
        h.manager.stop(started.port),
        Err(KeeperError::NotFound(port)) if port == started.port
    ));
}

#[test]
fn stop_unknown_port_is_not_found() {
    let h = Harness::new(8192);
    h.write_state("{}");

    let err = h.manager.stop(9999).unwrap_err();

    assert!(matches!(err, KeeperError::NotFound(9999)));
    assert_eq!(h.read_state(), "{}");
}

#[test]
fn stop_of_an_exited_process_still_removes_the_record() {
    let h = Harness::new(8192);
    h.write_state(r#"{"8001": {"pid": 555, "started_at": "2026-01-01T00:00:00+00:00"}}"#);

    h.manager.stop(8001).unwrap();

    assert_eq!(h.processes.terminated(), vec![555]);
    assert_eq!(h.state_json(), serde_json::json!({}));
}
