//! Outbound topics and the in-tree `Publisher` implementations.
use std::io::Write;
use std::sync::{Arc, Mutex};

use growth_traits::Publisher;
use serde::Serialize;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub const GROWTH_RATE_TOPIC: &str = "growth_rate";
pub const OD_FILTERED_TOPIC: &str = "od_filtered";
pub const KALMAN_FILTER_OUTPUTS_TOPIC: &str = "kalman_filter_outputs";

/// `bioreactor/{unit}/{experiment}/growth_rate_calculating/{leaf}`
pub fn topic(unit: &str, experiment: &str, leaf: &str) -> String {
    format!("bioreactor/{unit}/{experiment}/growth_rate_calculating/{leaf}")
}

#[derive(Serialize)]
struct Line<'a> {
    topic: &'a str,
    payload: serde_json::Value,
}

/// One JSON object per line: `{"topic": ..., "payload": {...}}`.
pub struct JsonLinesPublisher<W: Write> {
    out: W,
}

impl<W: Write> JsonLinesPublisher<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Publisher for JsonLinesPublisher<W> {
    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), BoxError> {
        let payload: serde_json::Value = serde_json::from_str(payload)?;
        serde_json::to_writer(&mut self.out, &Line { topic, payload })?;
        self.out.write_all(b"\n")?;
        self.out.flush()?;
        Ok(())
    }
}

/// Records every message. Clones share the record.
#[derive(Debug, Default, Clone)]
pub struct MemoryPublisher {
    messages: Arc<Mutex<Vec<(String, String)>>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(String, String)> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Payloads published on topics ending in `/{leaf}`.
    pub fn payloads(&self, leaf: &str) -> Vec<String> {
        let suffix = format!("/{leaf}");
        self.messages()
            .into_iter()
            .filter(|(t, _)| t.ends_with(&suffix))
            .map(|(_, p)| p)
            .collect()
    }
}

impl Publisher for MemoryPublisher {
    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), BoxError> {
        let mut guard = self.messages.lock().map_err(|_| "memory publisher poisoned")?;
        guard.push((topic.to_string(), payload.to_string()));
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPublisher;

impl Publisher for NullPublisher {
    fn publish(&mut self, _topic: &str, _payload: &str) -> Result<(), BoxError> {
        Ok(())
    }
}
