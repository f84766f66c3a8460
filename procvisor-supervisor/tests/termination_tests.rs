#![cfg(unix)]

use nix::unistd::{Pid, getpgid};
use procvisor_core::{ExitStatus, ProcessControl, ProcessHandle, SupervisorConfig, Termination};
use procvisor_supervisor::{PlatformControl, is_process_alive};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

fn control() -> PlatformControl {
    PlatformControl::new(&SupervisorConfig {
        termination_grace_ms: 200,
        kill_timeout_ms: 2000,
        ..Default::default()
    })
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

/// Spawns through the control and reaps the child in the background, the
/// way the supervisor's watcher does.
fn spawn_watched(
    control: &PlatformControl,
    command: &str,
    argv: &[&str],
) -> (ProcessHandle, JoinHandle<()>) {
    let mut child = control.spawn(command, &args(argv)).unwrap();
    let pid = child.id().unwrap();
    let (handle, notifier) = ProcessHandle::new(pid);

    let reaper = tokio::spawn(async move {
        let status = child.wait().await.ok().map(ExitStatus::from_std);
        notifier.notify(status);
    });

    (handle, reaper)
}

#[tokio::test]
async fn test_spawned_child_leads_its_own_group() {
    let control = control();
    let (handle, reaper) = spawn_watched(&control, "sleep", &["10"]);

    let pid = Pid::from_raw(handle.pid() as i32);
    assert_eq!(getpgid(Some(pid)).unwrap(), pid);

    control.terminate(&handle).await.unwrap();
    reaper.await.unwrap();
}

#[tokio::test]
async fn test_graceful_termination() {
    let control = control();
    let (handle, reaper) = spawn_watched(&control, "sleep", &["30"]);

    let outcome = control.terminate(&handle).await.unwrap();
    reaper.await.unwrap();

    assert_eq!(outcome, Termination::Terminated);
    assert!(handle.has_exited());
    // SIGTERM did the job.
    assert_eq!(handle.exit_status().unwrap().signal(), Some(15));
    assert!(!is_process_alive(handle.pid()));
}

#[tokio::test]
async fn test_escalates_when_sigterm_is_ignored() {
    let control = control();
    let (handle, reaper) = spawn_watched(&control, "sh", &["-c", "trap '' TERM; sleep 30"]);

    // Let the shell install its trap.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = Instant::now();
    let outcome = control.terminate(&handle).await.unwrap();
    reaper.await.unwrap();

    assert_eq!(outcome, Termination::Terminated);
    assert_eq!(handle.exit_status().unwrap().signal(), Some(9));
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn test_terminate_exited_process_is_already_gone() {
    let control = control();
    let (handle, reaper) = spawn_watched(&control, "true", &[]);

    reaper.await.unwrap();
    assert!(handle.has_exited());

    let outcome = control.terminate(&handle).await.unwrap();
    assert_eq!(outcome, Termination::AlreadyGone);
    assert!(outcome.is_gone());
}

#[tokio::test]
async fn test_liveness_probe() {
    let control = control();
    assert!(control.is_alive(std::process::id()));
    assert!(!control.is_alive(0));
    assert!(!control.is_alive(u32::MAX));

    let (handle, reaper) = spawn_watched(&control, "sleep", &["10"]);
    assert!(control.is_alive(handle.pid()));

    control.terminate(&handle).await.unwrap();
    reaper.await.unwrap();
    assert!(!control.is_alive(handle.pid()));
}
