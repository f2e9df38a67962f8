//! Supervisor behaviour against real processes.
//!
//! Uses `sleep` and `sh`, so these tests only run on unix hosts.
#![cfg(unix)]

use slimforge_runtime::{
    CancelFlag, CommandSpec, NeverCancel, Outcome, ProcessSupervisor, RuntimeError,
    SupervisorPolicy,
};
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

fn supervisor(timeout: Option<Duration>, grace: Duration) -> ProcessSupervisor {
    ProcessSupervisor::new(SupervisorPolicy {
        timeout,
        poll_interval: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(300),
        grace_period: grace,
    })
}

#[test]
fn long_process_times_out_near_limit() {
    let sup = supervisor(Some(Duration::from_secs(2)), Duration::from_secs(1));
    let start = Instant::now();
    let run = sup
        .run(&CommandSpec::new("sleep").arg("10"), &NeverCancel)
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(run.outcome, Outcome::TimedOut);
    assert!(elapsed >= Duration::from_secs(2), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "took too long: {elapsed:?}");
    assert!(!Path::new(&format!("/proc/{}", run.pid)).exists());
}

#[test]
fn cancellation_stops_process_within_grace() {
    let sup = supervisor(None, Duration::from_secs(2));
    let flag = CancelFlag::new();
    let trigger = flag.clone();
    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_secs(1));
        trigger.cancel();
    });

    let start = Instant::now();
    let run = sup
        .run(&CommandSpec::new("sleep").arg("10"), &flag)
        .unwrap();
    let elapsed = start.elapsed();
    canceller.join().unwrap();

    assert_eq!(run.outcome, Outcome::Cancelled);
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(4), "took too long: {elapsed:?}");
    assert!(!Path::new(&format!("/proc/{}", run.pid)).exists());
}

#[test]
fn term_ignoring_process_is_killed_after_grace() {
    let sup = supervisor(None, Duration::from_millis(500));
    let flag = CancelFlag::new();
    flag.cancel();

    let start = Instant::now();
    let run = sup
        .run(
            &CommandSpec::new("sh").args([
                "-c",
                "trap '' TERM; while true; do sleep 0.1; done",
            ]),
            &flag,
        )
        .unwrap();

    assert_eq!(run.outcome, Outcome::Cancelled);
    assert!(start.elapsed() >= Duration::from_millis(500));
    assert!(start.elapsed() < Duration::from_secs(5));
}

#[test]
fn captures_exit_code_and_output() {
    let sup = supervisor(Some(Duration::from_secs(10)), Duration::from_secs(1));
    let run = sup
        .run(
            &CommandSpec::new("sh").args(["-c", "echo mounted; echo 'Error: 87' >&2; exit 3"]),
            &NeverCancel,
        )
        .unwrap();

    assert_eq!(run.outcome, Outcome::Completed { code: 3 });
    assert_eq!(run.stdout.trim(), "mounted");
    assert_eq!(run.diagnostic(), "Error: 87");
    match run.into_success().unwrap_err() {
        RuntimeError::CommandFailed { code, .. } => assert_eq!(code, 3),
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn chatty_child_does_not_block_on_full_pipe() {
    let sup = supervisor(Some(Duration::from_secs(20)), Duration::from_secs(1));
    let run = sup
        .run(
            &CommandSpec::new("sh").args(["-c", "i=0; while [ $i -lt 20000 ]; do echo line-$i; i=$((i+1)); done"]),
            &NeverCancel,
        )
        .unwrap();
    assert!(run.outcome.is_success());
    assert_eq!(run.stdout.lines().count(), 20000);
}

#[test]
fn spawn_failure_is_an_error() {
    let sup = supervisor(None, Duration::from_secs(1));
    let err = sup
        .run(&CommandSpec::new("slimforge-no-such-tool"), &NeverCancel)
        .unwrap_err();
    assert!(matches!(err, RuntimeError::SpawnFailed { .. }));
}

#[test]
fn invalid_command_is_rejected_before_spawn() {
    let sup = supervisor(None, Duration::from_secs(1));
    let err = sup
        .run(&CommandSpec::new("echo").arg("a\0b"), &NeverCancel)
        .unwrap_err();
    assert!(matches!(err, RuntimeError::InvalidCommand(_)));
}
