//! Data model shared by sources, the filter and the published outputs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub type Timestamp = DateTime<Utc>;

/// Physical OD channel (photodiode) identifier, e.g. `"1"`.
///
/// Ordered so that maps keyed by channel have one canonical iteration order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChannelId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Photodiode angle relative to the IR LED, in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Angle(pub u16);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    pub channel: ChannelId,
    pub angle: Angle,
    /// Raw voltage-equivalent OD.
    pub od: f64,
    pub ir_led_intensity: f64,
    pub timestamp: Timestamp,
}

/// All channels sampled in one cycle; at most one reading per channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingBatch {
    pub timestamp: Timestamp,
    pub readings: BTreeMap<ChannelId, RawReading>,
}

impl ReadingBatch {
    pub fn new(timestamp: Timestamp) -> Self {
        Self {
            timestamp,
            readings: BTreeMap::new(),
        }
    }

    /// Build a batch from `(channel, od)` pairs at a 90° angle.
    pub fn from_ods<C, I>(timestamp: Timestamp, ods: I) -> Self
    where
        C: Into<ChannelId>,
        I: IntoIterator<Item = (C, f64)>,
    {
        let mut batch = Self::new(timestamp);
        for (channel, od) in ods {
            batch.insert(RawReading {
                channel: channel.into(),
                angle: Angle(90),
                od,
                ir_led_intensity: 0.0,
                timestamp,
            });
        }
        batch
    }

    /// Insert a reading; a second reading for the same channel replaces the first.
    pub fn insert(&mut self, reading: RawReading) {
        self.readings.insert(reading.channel.clone(), reading);
    }

    pub fn ods(&self) -> BTreeMap<ChannelId, f64> {
        self.readings
            .iter()
            .map(|(ch, r)| (ch.clone(), r.od))
            .collect()
    }

    pub fn covers<'a>(&self, channels: impl IntoIterator<Item = &'a ChannelId>) -> bool {
        channels
            .into_iter()
            .all(|ch| self.readings.contains_key(ch))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DosingKind {
    AddMedia,
    AddAltMedia,
    RemoveWaste,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DosingEvent {
    /// Signed volume in mL; negative backs out an aborted dose.
    pub volume_change: f64,
    pub kind: DosingKind,
    pub source_of_event: String,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GrowthRateSample {
    pub growth_rate: f64,
    pub timestamp: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OdFilteredSample {
    pub od_filtered: f64,
    pub timestamp: Timestamp,
}

/// Full filter snapshot, for audit and replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KalmanFilterOutput {
    pub timestamp: Timestamp,
    pub state: Vec<f64>,
    /// Row-major.
    pub covariance: Vec<Vec<f64>>,
}

/// One emitted cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct GrowthEstimate {
    pub growth_rate: GrowthRateSample,
    pub od_filtered: OdFilteredSample,
    pub kalman_filter_output: KalmanFilterOutput,
}

impl GrowthEstimate {
    pub fn timestamp(&self) -> Timestamp {
        self.growth_rate.timestamp
    }

    /// Same values, stamped with a new time.
    pub fn restamped(&self, timestamp: Timestamp) -> Self {
        let mut out = self.clone();
        out.growth_rate.timestamp = timestamp;
        out.od_filtered.timestamp = timestamp;
        out.kalman_filter_output.timestamp = timestamp;
        out
    }
}

pub trait Timestamped {
    fn timestamp(&self) -> Timestamp;
}

impl Timestamped for ReadingBatch {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}

impl Timestamped for DosingEvent {
    fn timestamp(&self) -> Timestamp {
        self.timestamp
    }
}
