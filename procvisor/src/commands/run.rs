use crate::cli::RunArgs;
use anyhow::Context;
use colored::*;
use procvisor_core::{ExitStatus, SupervisorEvent};
use procvisor_supervisor::MonitoredSupervisor;
use std::time::Duration;
use tabled::{Table, Tabled};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Interval;
use tracing::{debug, warn};

#[derive(Tabled)]
struct StatusRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "PID")]
    pid: u32,
    #[tabled(rename = "COMMAND")]
    command: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "RESTARTS")]
    restarts: u32,
    #[tabled(rename = "UPTIME")]
    uptime: String,
    #[tabled(rename = "CPU")]
    cpu: String,
    #[tabled(rename = "MEMORY")]
    memory: String,
}

pub async fn execute(args: RunArgs) -> anyhow::Result<()> {
    let mut config = super::config::load(args.config.as_deref()).await?;
    if let Some(delay) = args.restart_delay_ms {
        config.supervisor.restart_delay_ms = delay;
    }
    if let Some(grace) = args.grace_ms {
        config.supervisor.termination_grace_ms = grace;
    }
    config.monitor.enabled = args.monitor;
    config.validate().context("Invalid configuration")?;

    let Some((command, command_args)) = args.command.split_first() else {
        anyhow::bail!("No command given");
    };

    let supervised = MonitoredSupervisor::from_config(&config);
    let supervisor = supervised.supervisor().clone();
    let mut events = supervisor.subscribe();
    let signals = supervisor.install_signal_handler();

    let id = match supervised
        .start(command.clone(), command_args.to_vec(), args.restart)
        .await
    {
        Ok(id) => id,
        Err(e) => {
            supervised.shutdown().await;
            return Err(e).with_context(|| format!("Failed to start {}", command));
        }
    };
    println!("{} {} (id: {})", "Started".green().bold(), command, id);

    let mut status_ticker = args
        .status_interval_secs
        .map(|secs| tokio::time::interval(Duration::from_secs(secs.max(1))));
    let mut last_status: Option<ExitStatus> = None;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SupervisorEvent::ProcessExited { status, .. }) => last_status = status,
                Ok(SupervisorEvent::ProcessRestarting { restart_count, delay, .. }) => {
                    println!(
                        "{} {} in {}ms (restart #{})",
                        "Restarting".yellow().bold(),
                        command,
                        delay.as_millis(),
                        restart_count
                    );
                }
                Ok(SupervisorEvent::ProcessRemoved { .. }) | Err(RecvError::Lagged(_)) => {
                    if supervised.list_processes().is_empty() {
                        break;
                    }
                }
                Ok(SupervisorEvent::ShutdownCompleted) | Err(RecvError::Closed) => break,
                Ok(_) => {}
            },
            _ = tick(&mut status_ticker) => print_status(&supervised, args.monitor),
        }
    }

    let interrupted = supervisor.is_stopping();
    supervised.shutdown().await;
    if let Err(e) = signals.await {
        warn!("Signal handler task failed: {}", e);
    }

    match last_status {
        Some(status) if !interrupted && !status.success() => {
            println!("{} {} exited with {}", "Failed".red().bold(), command, status);
            anyhow::bail!("{} exited with {}", command, status)
        }
        _ => {
            debug!("Supervision of {} finished", command);
            Ok(())
        }
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn print_status(supervised: &MonitoredSupervisor, monitor: bool) {
    let mut processes = supervised.list_processes();
    if processes.is_empty() {
        println!("No processes running");
        return;
    }
    processes.sort_by_key(|info| info.started_at);

    let rows: Vec<StatusRow> = processes
        .into_iter()
        .map(|info| {
            let stats = monitor
                .then(|| supervised.stats_by_id(&info.id).ok())
                .flatten();
            StatusRow {
                id: info.id.to_string(),
                pid: info.pid,
                command: std::iter::once(info.command.as_str())
                    .chain(info.args.iter().map(String::as_str))
                    .collect::<Vec<_>>()
                    .join(" "),
                status: info.status().to_string(),
                restarts: info.restart_count,
                uptime: format_uptime(info.uptime()),
                cpu: stats
                    .as_ref()
                    .map_or_else(|| "-".to_string(), |s| format!("{:.1}%", s.cpu_percent)),
                memory: stats.as_ref().map_or_else(
                    || "-".to_string(),
                    |s| format!("{:.1} MB", s.memory_bytes as f64 / 1024.0 / 1024.0),
                ),
            }
        })
        .collect();

    println!("{}", Table::new(rows));
}

fn format_uptime(uptime: Duration) -> String {
    let secs = uptime.as_secs();
    match secs {
        0..=59 => format!("{}s", secs),
        60..=3599 => format!("{}m {}s", secs / 60, secs % 60),
        _ => format!("{}h {}m", secs / 3600, (secs % 3600) / 60),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(Duration::from_secs(0)), "0s");
        assert_eq!(format_uptime(Duration::from_secs(59)), "59s");
        assert_eq!(format_uptime(Duration::from_secs(61)), "1m 1s");
        assert_eq!(format_uptime(Duration::from_secs(7260)), "2h 1m");
    }
}
