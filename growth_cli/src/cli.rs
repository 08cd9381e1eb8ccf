//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

#[derive(Parser, Debug)]
#[command(name = "growth", version, about = "Growth-rate estimator CLI")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/growth_config.toml")]
    pub config: PathBuf,

    /// Override the experiment named in the config
    #[arg(long, value_name = "NAME", global = true)]
    pub experiment: Option<String>,

    /// Log as JSON lines instead of pretty
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace)
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Replay a recorded run and print every published message as a JSON line
    Replay {
        /// OD readings CSV (timestamp,channel,angle,od,ir_led_intensity)
        #[arg(long, value_name = "FILE")]
        readings: PathBuf,
        /// Dosing events CSV (timestamp,kind,volume_change,source_of_event)
        #[arg(long, value_name = "FILE")]
        events: Option<PathBuf>,
    },
    /// Estimate from JSON lines on stdin until EOF or Ctrl-C
    #[command(
        long_about = "Estimate from JSON lines on stdin until EOF or Ctrl-C.\n\nEach line is one message:\n  {\"type\":\"od_reading\",\"timestamp\":\"2024-03-01T12:00:00Z\",\"ods\":{\"1\":0.51}}\n  {\"type\":\"dosing_event\",\"timestamp\":\"...\",\"kind\":\"add_media\",\"volume_change\":0.5,\"source_of_event\":\"chemostat\"}"
    )]
    Live,
    /// Validate the config and check the store is readable and writable
    SelfCheck,
}
