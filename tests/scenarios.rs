//! End-to-end scenarios against real child processes (spec §8 S1-S6).

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use taskmasterd::descriptor::{AutoRestart, ProgramDescriptor, StopSignal};
use taskmasterd::supervisor::{ProgramState, SupervisorHandle};

fn descriptor(name: &str, cmd: &str) -> ProgramDescriptor {
    ProgramDescriptor {
        name: name.to_string(),
        cmd: cmd.to_string(),
        numprocs: 1,
        umask: 0o022,
        workingdir: PathBuf::from("/tmp"),
        autostart: false,
        autorestart: AutoRestart::Unexpected,
        exitcodes: BTreeSet::from([0]),
        startretries: 3,
        starttime: 1,
        stopsignal: StopSignal::Term,
        stoptime: 2,
        stdout: None,
        stderr: None,
        env: HashMap::new(),
    }
}

async fn wait_until<F: Fn(ProgramState) -> bool>(
    handle: &SupervisorHandle,
    predicate: F,
    timeout: Duration,
) -> ProgramState {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let snapshot = handle.status().await.expect("supervisor alive");
        if predicate(snapshot.state) {
            return snapshot.state;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for state");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

// S1 — clean start/stop.
#[tokio::test]
async fn clean_start_then_stop() {
    let mut desc = descriptor("sleepy", "sleep 60");
    desc.numprocs = 2;
    let handle = SupervisorHandle::spawn(desc);

    handle.start().await;
    let state = wait_until(&handle, |s| s == ProgramState::Running, Duration::from_secs(5)).await;
    assert_eq!(state, ProgramState::Running);

    let snapshot = handle.status().await.unwrap();
    assert_eq!(snapshot.instances.len(), 2);
    assert!(snapshot.instances.iter().all(|i| i.pid.is_some()));

    handle.stop().await;
    let state = wait_until(&handle, |s| s == ProgramState::Stopped, Duration::from_secs(10)).await;
    assert_eq!(state, ProgramState::Stopped);

    let snapshot = handle.status().await.unwrap();
    assert!(snapshot.instances.is_empty());

    handle.shutdown().await;
}

// S2 — failed start exhausts retries.
#[tokio::test]
async fn failed_start_exhausts_retries_then_fatal() {
    let mut desc = descriptor("doomed", "false");
    desc.startretries = 3;
    desc.starttime = 1;
    let handle = SupervisorHandle::spawn(desc);

    handle.start().await;
    let state = wait_until(&handle, |s| s == ProgramState::Fatal, Duration::from_secs(15)).await;
    assert_eq!(state, ProgramState::Fatal);

    let snapshot = handle.status().await.unwrap();
    assert_eq!(snapshot.failed_starts, 4);

    handle.shutdown().await;
}

// S3 — expected exit under autorestart=never goes straight to EXITED.
#[tokio::test]
async fn never_restart_goes_to_exited_on_clean_exit() {
    let mut desc = descriptor("onceoff", "true");
    desc.autorestart = AutoRestart::Never;
    let handle = SupervisorHandle::spawn(desc);

    handle.start().await;
    let state = wait_until(&handle, |s| s == ProgramState::Exited, Duration::from_secs(5)).await;
    assert_eq!(state, ProgramState::Exited);

    let snapshot = handle.status().await.unwrap();
    assert_eq!(snapshot.failed_starts, 0);

    handle.shutdown().await;
}

// S4 — graceful escalation when the child ignores stopsignal.
#[tokio::test]
async fn stop_escalates_to_kill_when_signal_is_ignored() {
    let mut desc = descriptor("stubborn", "trap '' TERM; sleep 300");
    desc.stoptime = 1;
    let handle = SupervisorHandle::spawn(desc);

    handle.start().await;
    wait_until(&handle, |s| s == ProgramState::Running, Duration::from_secs(5)).await;

    let started = tokio::time::Instant::now();
    handle.stop().await;
    let state = wait_until(&handle, |s| s == ProgramState::Stopped, Duration::from_secs(10)).await;
    assert_eq!(state, ProgramState::Stopped);
    // Escalation to KILL is bounded by stoptime, not sleep 300's duration.
    assert!(started.elapsed() < Duration::from_secs(10));

    handle.shutdown().await;
}

// start() issued while BACKOFF resets the retry counter and respawns
// immediately, instead of being silently dropped as a no-op.
#[tokio::test]
async fn start_during_backoff_respawns_immediately() {
    let mut desc = descriptor("flappy", "false");
    desc.startretries = 10;
    desc.starttime = 3;
    let handle = SupervisorHandle::spawn(desc);

    handle.start().await;
    let state = wait_until(&handle, |s| s == ProgramState::Backoff, Duration::from_secs(5)).await;
    assert_eq!(state, ProgramState::Backoff);

    let started = tokio::time::Instant::now();
    handle.start().await;
    let state = wait_until(&handle, |s| s == ProgramState::Starting, Duration::from_secs(2)).await;
    assert_eq!(state, ProgramState::Starting);
    // Respawned right away rather than waiting out the 3s backoff delay.
    assert!(started.elapsed() < Duration::from_secs(2));

    let snapshot = handle.status().await.unwrap();
    assert_eq!(snapshot.failed_starts, 0);

    handle.shutdown().await;
}

// L1 — start is idempotent.
#[tokio::test]
async fn repeated_start_is_idempotent() {
    let desc = descriptor("idempotent", "sleep 60");
    let handle = SupervisorHandle::spawn(desc);

    handle.start().await;
    wait_until(&handle, |s| s == ProgramState::Running, Duration::from_secs(5)).await;
    let pid_before = handle.status().await.unwrap().instances[0].pid;

    handle.start().await;
    tokio::time::sleep(Duration::from_millis(250)).await;
    let pid_after = handle.status().await.unwrap().instances[0].pid;
    assert_eq!(pid_before, pid_after);

    handle.shutdown().await;
}
