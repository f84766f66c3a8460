use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "procvisor")]
#[command(about = "Supervises child processes: restarts them, stops them, cleans up their trees", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text", env = "PROCVISOR_LOG_FORMAT")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run a command under supervision until it exits or a signal arrives
    Run(RunArgs),

    /// Print the effective configuration as JSON
    Config(ConfigArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Config file to load instead of searching for procvisor.json
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Restart the command whenever it exits
    #[arg(short, long)]
    pub restart: bool,

    /// Delay before an automatic restart, in milliseconds
    #[arg(long, env = "PROCVISOR_RESTART_DELAY_MS")]
    pub restart_delay_ms: Option<u64>,

    /// Window between SIGTERM and SIGKILL, in milliseconds
    #[arg(long, env = "PROCVISOR_GRACE_MS")]
    pub grace_ms: Option<u64>,

    /// Print a status table every N seconds
    #[arg(long)]
    pub status_interval_secs: Option<u64>,

    /// Sample CPU and memory usage and include it in status tables
    #[arg(long)]
    pub monitor: bool,

    /// Command to supervise, followed by its arguments
    #[arg(required = true, last = true)]
    pub command: Vec<String>,
}

#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Config file to load instead of searching for procvisor.json
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}
