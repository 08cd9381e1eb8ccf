#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]

mod cli;
mod error_fmt;
mod live;
mod replay;

use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::Parser;
use eyre::{Result, WrapErr};
use growth_config::Config;
use growth_core::store::OD_NORMALIZATION_MEAN;
use growth_core::{EstimationError, JobBuilder, JsonFileStore};
use growth_traits::KeyValueStore;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::cli::{Cli, Commands, FILE_GUARD, JSON_MODE};
use crate::error_fmt::{exit_code_for_error, format_error_json, humanize};

fn main() {
    let cli = Cli::parse();
    let _ = JSON_MODE.set(cli.json);
    let code = match run(cli) {
        Ok(()) => 0,
        Err(e) => {
            if JSON_MODE.get().copied().unwrap_or(false) {
                eprintln!("{}", format_error_json(&e));
            } else {
                eprintln!("{}", humanize(&e));
            }
            exit_code_for_error(&e)
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<()> {
    let cfg = load_config(&cli.config, cli.experiment.clone())?;
    init_tracing(&cli, &cfg.logging);
    tracing::debug!(config = %cli.config.display(), experiment = %cfg.experiment, "config loaded");

    match &cli.cmd {
        Commands::Replay { readings, events } => {
            let summary =
                replay::run_replay(&cfg, readings, events.as_deref(), std::io::stdout())?;
            println!("{}", summary.to_json());
            tracing::info!(
                estimates = summary.estimates,
                rejected_outliers = summary.stats.rejected_outliers,
                "replay complete"
            );
        }
        Commands::Live => {
            let shutdown = Arc::new(AtomicBool::new(false));
            let flag = Arc::clone(&shutdown);
            if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed)) {
                tracing::warn!(error = %e, "failed to install Ctrl-C handler");
            }
            let input = BufReader::new(std::io::stdin());
            let state = live::run_live(&cfg, input, std::io::stdout(), &shutdown)?;
            tracing::info!(state = ?state, "live estimation finished");
        }
        Commands::SelfCheck => self_check(&cfg)?,
    }
    Ok(())
}

fn load_config(path: &Path, experiment: Option<String>) -> Result<Config> {
    let text = fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read config {}", path.display()))?;
    let mut cfg = growth_config::load_toml(&text)
        .wrap_err_with(|| format!("failed to parse config {}", path.display()))?;
    if let Some(exp) = experiment {
        cfg.experiment = exp;
    }
    cfg.validate()
        .map_err(|e| EstimationError::Config(e.to_string()))?;
    Ok(cfg)
}

/// Console logs go to stderr; stdout carries the published messages.
fn init_tracing(cli: &Cli, logging: &growth_config::Logging) {
    let console_filter = || {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level))
    };
    let (pretty, json) = if cli.json {
        let layer = fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(console_filter());
        (None, Some(layer))
    } else {
        let layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_filter(console_filter());
        (Some(layer), None)
    };

    let file = logging.file.as_deref().map(|file| {
        let path = Path::new(file);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = path
            .file_name()
            .map_or_else(|| "growth.log".into(), std::ffi::OsStr::to_os_string);
        let appender = match logging.rotation.as_deref() {
            Some("daily") => tracing_appender::rolling::daily(dir, name),
            Some("hourly") => tracing_appender::rolling::hourly(dir, name),
            _ => tracing_appender::rolling::never(dir, name),
        };
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let _ = FILE_GUARD.set(guard);
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_filter(EnvFilter::new(logging.level.as_deref().unwrap_or("info")))
    });

    let _ = tracing_subscriber::registry()
        .with(pretty)
        .with(json)
        .with(file)
        .try_init();
}

fn self_check(cfg: &Config) -> Result<()> {
    let mut store = JsonFileStore::open(&cfg.store.path)
        .wrap_err_with(|| format!("failed to open store {}", cfg.store.path))?;
    let calibrated = store
        .get(OD_NORMALIZATION_MEAN, &cfg.experiment)
        .map_err(|e| eyre::eyre!("store read failed: {e}"))?
        .is_some();
    store
        .set("self_check", &cfg.experiment, &chrono::Utc::now().to_rfc3339())
        .map_err(|e| eyre::eyre!("store write failed: {e}"))?;
    JobBuilder::from_config(cfg)?.store(store).try_build()?;
    println!(
        "self-check ok: experiment={} store={} calibrated={calibrated}",
        cfg.experiment, cfg.store.path
    );
    Ok(())
}
