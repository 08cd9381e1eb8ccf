//! Live mode: JSON lines on stdin feed the live sources of a background job.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use eyre::Result;
use growth_core::publish::JsonLinesPublisher;
use growth_core::{
    DosingEvent, EstimationError, JobBuilder, JobState, JsonFileStore, LiveFeed, LiveSource,
    ReadingBatch, Timestamp,
};
use serde::Deserialize;

/// One stdin line.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LiveMessage {
    /// Every channel read at one instant.
    OdReading {
        timestamp: Timestamp,
        ods: BTreeMap<String, f64>,
    },
    DosingEvent(DosingEvent),
}

/// Forward stdin lines until EOF; dropping the feeds then ends the job.
fn pump<I: BufRead>(input: I, od: LiveFeed<ReadingBatch>, events: LiveFeed<DosingEvent>) {
    for (n, line) in input.lines().enumerate() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(error = %e, "stdin read failed; closing live feeds");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let sent = match serde_json::from_str::<LiveMessage>(&line) {
            Ok(LiveMessage::OdReading { timestamp, ods }) => {
                od.send(ReadingBatch::from_ods(timestamp, ods)).is_ok()
            }
            Ok(LiveMessage::DosingEvent(event)) => events.send(event).is_ok(),
            Err(e) => {
                tracing::warn!(line = n + 1, error = %e, "skipping malformed input line");
                true
            }
        };
        if !sent {
            break;
        }
    }
    tracing::debug!("live input closed");
}

pub fn run_live<I: BufRead + Send + 'static>(
    cfg: &growth_config::Config,
    input: I,
    out: impl Write + Send + 'static,
    shutdown: &Arc<AtomicBool>,
) -> Result<JobState> {
    let store = JsonFileStore::open(&cfg.store.path)?;
    let job = JobBuilder::from_config(cfg)?
        .store(store)
        .publisher(JsonLinesPublisher::new(out))
        .try_build()?;

    let (od_feed, od_source) = LiveSource::<ReadingBatch>::channel();
    let (event_feed, event_source) = LiveSource::<DosingEvent>::channel();
    let bg = job.process_in_background(od_source, event_source)?;
    // not joined: a blocked stdin read must not hold up shutdown
    std::thread::spawn(move || pump(input, od_feed, event_feed));

    let init_timeout = Duration::from_millis(cfg.runner.init_timeout_ms);
    match bg.wait_until_initialized(init_timeout) {
        Ok(()) => tracing::info!("live estimation initialized"),
        Err(EstimationError::InitializationTimeout(t)) => {
            tracing::warn!(timeout = ?t, "no complete OD batch yet; still waiting");
        }
        Err(e) => return Err(e.into()),
    }

    let poll = Duration::from_millis(cfg.runner.poll_ms);
    let mut stopping = false;
    loop {
        if !stopping && shutdown.load(Ordering::Relaxed) {
            tracing::info!("shutdown requested; stopping live estimation");
            bg.stop()?;
            stopping = true;
        }
        if bg.state().is_terminal() {
            break;
        }
        // estimates are already published by the job; drain the handle's copy
        if bg.recv_timeout(poll).is_some() {
            let drained = bg.try_iter().count();
            tracing::trace!(drained, "estimates received");
        }
    }

    let last_error = bg.last_error();
    let state = bg.join();
    if state == JobState::Failed {
        if let Some(e) = last_error {
            return Err(e.into());
        }
    }
    Ok(state)
}
