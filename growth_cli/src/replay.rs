//! Historical replay: recordings in, one JSON line per published message out.

use std::io::Write;
use std::path::Path;

use eyre::{Result, WrapErr};
use growth_core::conversions::{batches_from_rows, events_from_rows};
use growth_core::publish::JsonLinesPublisher;
use growth_core::{HistoricalSource, JobBuilder, JobStats, JobState, JsonFileStore};

#[derive(Debug, Clone, Copy)]
pub struct ReplaySummary {
    pub estimates: u64,
    pub stats: JobStats,
    pub state: JobState,
}

impl ReplaySummary {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "summary": {
                "estimates": self.estimates,
                "accepted": self.stats.accepted,
                "rejected_outliers": self.stats.rejected_outliers,
                "skipped_batches": self.stats.skipped_batches,
                "dosing_events": self.stats.dosing_events,
                "state": format!("{:?}", self.state),
            }
        })
    }
}

pub fn run_replay(
    cfg: &growth_config::Config,
    readings: &Path,
    events: Option<&Path>,
    out: impl Write + Send + 'static,
) -> Result<ReplaySummary> {
    let reading_rows = growth_config::load_od_readings_csv(readings)
        .wrap_err_with(|| format!("failed to load readings {}", readings.display()))?;
    let event_rows = match events {
        Some(path) => growth_config::load_dosing_events_csv(path)
            .wrap_err_with(|| format!("failed to load events {}", path.display()))?,
        None => Vec::new(),
    };
    let batches = batches_from_rows(&reading_rows);
    let events = events_from_rows(&event_rows);
    tracing::info!(
        batches = batches.len(),
        events = events.len(),
        "replaying recording"
    );

    let store = JsonFileStore::open(&cfg.store.path)
        .wrap_err_with(|| format!("failed to open store {}", cfg.store.path))?;
    let job = JobBuilder::from_config(cfg)?
        .store(store)
        .publisher(JsonLinesPublisher::new(out))
        .try_build()?;

    let mut stream = job.process(HistoricalSource::new(batches), HistoricalSource::new(events))?;
    let mut estimates = 0u64;
    for item in stream.by_ref() {
        match item {
            Ok(_) => estimates += 1,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => tracing::warn!(error = %e, "continuing after non-fatal error"),
        }
    }
    Ok(ReplaySummary {
        estimates,
        stats: stream.stats(),
        state: stream.state(),
    })
}
