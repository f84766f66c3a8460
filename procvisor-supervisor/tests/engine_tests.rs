#![cfg(unix)]

use async_trait::async_trait;
use procvisor_core::{
    Error, ProcessControl, ProcessHandle, ProcessId, Result, SupervisorConfig, SupervisorEvent,
    Termination,
};
use procvisor_supervisor::{Supervisor, create_process_control, is_process_alive};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::process::Child;
use tokio::task::JoinSet;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

fn fast_config() -> SupervisorConfig {
    SupervisorConfig {
        restart_delay_ms: 200,
        termination_grace_ms: 100,
        kill_timeout_ms: 2000,
        restart_settle_ms: 50,
        shutdown_grace_ms: 500,
        ..Default::default()
    }
}

fn args(values: &[&str]) -> Vec<String> {
    values.iter().map(|value| value.to_string()).collect()
}

async fn eventually<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test]
async fn test_started_process_is_listed_as_running() {
    let supervisor = Supervisor::new(fast_config());

    let id = supervisor.start("sleep", args(&["10"]), false).await.unwrap();
    let info = supervisor.get_process(&id).unwrap();

    assert_eq!(info.command, "sleep");
    assert_eq!(info.args, vec!["10"]);
    assert!(info.running);
    assert!(!info.auto_restart);
    assert_eq!(info.restart_count, 0);
    assert!(is_process_alive(info.pid));
    assert_eq!(supervisor.list_processes().len(), 1);
    assert_eq!(supervisor.find_by_pid(info.pid).unwrap().id, id);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_exited_process_without_restart_is_removed() {
    let supervisor = Supervisor::new(fast_config());

    let id = supervisor.start("sleep", args(&["1"]), false).await.unwrap();
    sleep(Duration::from_millis(1500)).await;

    assert!(supervisor.get_process(&id).is_none());
    assert!(supervisor.list_processes().is_empty());
}

#[tokio::test]
async fn test_auto_restart_replaces_the_record() {
    let supervisor = Supervisor::new(fast_config());

    let id = supervisor.start("sleep", args(&["1"]), true).await.unwrap();

    let check = supervisor.clone();
    let old = id.clone();
    let restarted = eventually(Duration::from_secs(5), || {
        let check = check.clone();
        let old = old.clone();
        async move {
            check
                .list_processes()
                .iter()
                .any(|info| info.id != old && info.restart_count == 1 && info.auto_restart)
        }
    })
    .await;

    assert!(restarted, "process was not restarted");
    assert!(supervisor.get_process(&id).is_none());
    assert_eq!(supervisor.list_processes().len(), 1);

    supervisor.shutdown().await;
}

async fn next_event(events: &mut broadcast::Receiver<SupervisorEvent>) -> SupervisorEvent {
    timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for events")
        .unwrap()
}

#[tokio::test]
async fn test_restart_count_grows_by_one_per_restart() {
    let supervisor = Supervisor::new(fast_config());
    let mut events = supervisor.subscribe();

    supervisor.start("sleep", args(&["0.5"]), true).await.unwrap();

    let mut counts = Vec::new();
    while counts.len() < 3 {
        if let SupervisorEvent::ProcessStarted { id, .. } = next_event(&mut events).await {
            counts.push(supervisor.get_process(&id).map(|info| info.restart_count));
        }
    }

    assert_eq!(counts, vec![Some(0), Some(1), Some(2)]);
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_auto_restart_registers_replacement_before_removal() {
    let supervisor = Supervisor::new(fast_config());
    let mut events = supervisor.subscribe();

    let id = supervisor.start("sleep", args(&["0.3"]), true).await.unwrap();

    let mut replacement: Option<ProcessId> = None;
    loop {
        match next_event(&mut events).await {
            SupervisorEvent::ProcessStarted { id: started, .. } if started != id => {
                replacement = Some(started);
            }
            SupervisorEvent::ProcessRemoved { id: removed, .. } if removed == id => break,
            _ => {}
        }
    }

    let replacement = replacement.expect("old record removed before its replacement started");
    assert!(supervisor.get_process(&replacement).is_some());
    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_stop_during_restart_delay_cancels_restart() {
    let config = SupervisorConfig {
        restart_delay_ms: 1000,
        ..fast_config()
    };
    let supervisor = Supervisor::new(config);
    let mut events = supervisor.subscribe();

    let id = supervisor.start("sleep", args(&["0.2"]), true).await.unwrap();

    loop {
        if let SupervisorEvent::ProcessRestarting { id: restarting, .. } =
            next_event(&mut events).await
        {
            assert_eq!(restarting, id);
            break;
        }
    }

    supervisor.stop(&id).await.unwrap();

    sleep(Duration::from_millis(1500)).await;
    assert!(supervisor.list_processes().is_empty());
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(
            event,
            SupervisorEvent::ProcessStarted { .. } | SupervisorEvent::ProcessRestarted { .. }
        ));
    }
}

#[tokio::test]
async fn test_stop_terminates_and_forgets() {
    let supervisor = Supervisor::new(fast_config());

    let id = supervisor.start("sleep", args(&["10"]), true).await.unwrap();
    let pid = supervisor.get_process(&id).unwrap().pid;

    supervisor.stop(&id).await.unwrap();

    assert!(supervisor.get_process(&id).is_none());
    assert!(!is_process_alive(pid));

    // No auto-restart after an explicit stop.
    sleep(Duration::from_millis(500)).await;
    assert!(supervisor.list_processes().is_empty());

    let second = supervisor.stop(&id).await;
    assert!(matches!(second, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_stop_unknown_id() {
    let supervisor = Supervisor::new(fast_config());
    let result = supervisor.stop(&"no-such-id".into()).await;
    assert!(result.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_stop_all_kills_process_groups() {
    let supervisor = Supervisor::new(fast_config());
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("grandchild.pid");

    supervisor.start("sleep", args(&["30"]), true).await.unwrap();
    supervisor
        .start(
            "sh",
            args(&[
                "-c",
                &format!("sleep 30 & echo $! > {}; wait", pid_file.display()),
            ]),
            false,
        )
        .await
        .unwrap();

    let written = eventually(Duration::from_secs(5), || {
        let pid_file = pid_file.clone();
        async move {
            std::fs::read_to_string(&pid_file)
                .map(|content| content.trim().parse::<u32>().is_ok())
                .unwrap_or(false)
        }
    })
    .await;
    assert!(written, "grandchild pid was never written");

    let grandchild: u32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let pids: Vec<u32> = supervisor
        .list_processes()
        .iter()
        .map(|info| info.pid)
        .collect();
    assert!(is_process_alive(grandchild));

    supervisor.stop_all().await;

    assert!(supervisor.list_processes().is_empty());
    for pid in pids {
        assert!(!is_process_alive(pid), "process {} survived stop_all", pid);
    }
    let reaped = eventually(Duration::from_secs(2), || async move {
        !is_process_alive(grandchild)
    })
    .await;
    assert!(reaped, "grandchild {} survived stop_all", grandchild);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_get_distinct_ids() {
    let supervisor = Supervisor::new(fast_config());
    let mut starts = JoinSet::new();

    for _ in 0..10 {
        let supervisor = supervisor.clone();
        starts.spawn(async move { supervisor.start("sleep", args(&["10"]), false).await });
    }

    let mut ids = HashSet::new();
    while let Some(result) = starts.join_next().await {
        ids.insert(result.unwrap().unwrap());
    }

    assert_eq!(ids.len(), 10);
    assert_eq!(supervisor.list_processes().len(), 10);

    supervisor.shutdown().await;
    assert!(supervisor.list_processes().is_empty());
}

#[tokio::test]
async fn test_wait_for_process_times_out() {
    let supervisor = Supervisor::new(fast_config());
    let id = supervisor.start("sleep", args(&["10"]), false).await.unwrap();

    let result = supervisor
        .wait_for_process(&id, Duration::from_millis(100))
        .await;
    assert!(matches!(result, Err(Error::Timeout(_))));

    // The timed out wait does not disturb the process.
    assert!(supervisor.get_process(&id).unwrap().running);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_wait_for_process_reports_exit_status() {
    let supervisor = Supervisor::new(fast_config());
    let id = supervisor
        .start("sh", args(&["-c", "sleep 0.5; exit 3"]), false)
        .await
        .unwrap();

    let status = supervisor
        .wait_for_process(&id, Duration::from_secs(5))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(status.code(), Some(3));
    assert!(!status.success());
}

#[tokio::test]
async fn test_restart_assigns_new_id_and_counts() {
    let supervisor = Supervisor::new(fast_config());

    let id = supervisor.start("sleep", args(&["10"]), false).await.unwrap();
    let old_pid = supervisor.get_process(&id).unwrap().pid;

    let new_id = supervisor.restart(&id).await.unwrap();
    assert_ne!(id, new_id);
    assert!(supervisor.get_process(&id).is_none());
    assert!(!is_process_alive(old_pid));

    let info = supervisor.get_process(&new_id).unwrap();
    assert_eq!(info.restart_count, 1);
    assert_eq!(info.command, "sleep");
    assert!(!info.auto_restart);
    assert!(info.running);

    let unknown = supervisor.restart(&"missing".into()).await;
    assert!(matches!(unknown, Err(Error::NotFound(_))));

    supervisor.shutdown().await;
}

#[tokio::test]
async fn test_spawn_failure_leaves_no_record() {
    let supervisor = Supervisor::new(fast_config());

    let result = supervisor
        .start("procvisor-definitely-missing-binary", Vec::new(), true)
        .await;

    assert!(matches!(result, Err(Error::SpawnFailed(_))));
    assert!(supervisor.list_processes().is_empty());
}

#[tokio::test]
async fn test_lifecycle_events_are_broadcast() {
    let supervisor = Supervisor::new(fast_config());
    let mut events = supervisor.subscribe();

    let id = supervisor.start("echo", args(&["hello"]), false).await.unwrap();

    let mut seen = Vec::new();
    while seen.len() < 3 {
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for events")
            .unwrap();
        seen.push(event);
    }

    assert!(matches!(&seen[0], SupervisorEvent::ProcessStarted { id: started, .. } if *started == id));
    assert!(matches!(
        &seen[1],
        SupervisorEvent::ProcessExited { id: exited, status: Some(status), .. }
            if *exited == id && status.success()
    ));
    assert!(matches!(&seen[2], SupervisorEvent::ProcessRemoved { id: removed, .. } if *removed == id));
}

/// Spawns for real but never manages to terminate anything.
struct StubbornControl {
    inner: Arc<dyn ProcessControl>,
}

#[async_trait]
impl ProcessControl for StubbornControl {
    fn spawn(&self, command: &str, args: &[String]) -> Result<Child> {
        self.inner.spawn(command, args)
    }

    async fn terminate(&self, _handle: &ProcessHandle) -> Result<Termination> {
        Ok(Termination::StillAlive)
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.inner.is_alive(pid)
    }
}

#[tokio::test]
async fn test_stop_reports_failure_when_process_survives() {
    let config = fast_config();
    let control = Arc::new(StubbornControl {
        inner: create_process_control(&config),
    });
    let supervisor = Supervisor::with_control(config, control);

    let id = supervisor.start("sleep", args(&["10"]), false).await.unwrap();

    let result = supervisor.stop(&id).await;
    assert!(matches!(result, Err(Error::StopFailed { .. })));
    assert!(supervisor.get_process(&id).is_some());

    // Shutdown still gets rid of it through the watcher's own kill.
    timeout(Duration::from_secs(5), supervisor.shutdown())
        .await
        .unwrap();
    assert!(supervisor.list_processes().is_empty());
    assert_eq!(supervisor.active_watchers(), 0);
}

/// Spawns the first child for real, then refuses every further spawn.
struct OneShotControl {
    inner: Arc<dyn ProcessControl>,
    spawns: AtomicU32,
}

#[async_trait]
impl ProcessControl for OneShotControl {
    fn spawn(&self, command: &str, args: &[String]) -> Result<Child> {
        if self.spawns.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(Error::SpawnFailed(format!("{}: refused", command)));
        }
        self.inner.spawn(command, args)
    }

    async fn terminate(&self, handle: &ProcessHandle) -> Result<Termination> {
        self.inner.terminate(handle).await
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.inner.is_alive(pid)
    }
}

#[tokio::test]
async fn test_failed_relaunch_leaves_no_stale_record() {
    let config = fast_config();
    let control = Arc::new(OneShotControl {
        inner: create_process_control(&config),
        spawns: AtomicU32::new(0),
    });
    let supervisor = Supervisor::with_control(config, control);

    let id = supervisor.start("sleep", args(&["10"]), false).await.unwrap();
    let pid = supervisor.get_process(&id).unwrap().pid;

    let result = supervisor.restart(&id).await;
    assert!(matches!(result, Err(Error::SpawnFailed(_))));

    assert!(supervisor.get_process(&id).is_none());
    assert!(supervisor.list_processes().is_empty());
    assert!(!is_process_alive(pid));
}
