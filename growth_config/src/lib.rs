#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas and recording parsing for the growth-rate estimator.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - Recording CSV loaders enforce exact headers so a replay never runs on
//!   a silently misparsed file.
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;

/// One OD reading row of a historical recording.
///
/// Expected headers:
/// timestamp,channel,angle,od,ir_led_intensity
///
/// Example:
/// timestamp,channel,angle,od,ir_led_intensity
/// 2024-03-01T12:00:00Z,1,90,0.0532,70.0
#[derive(Debug, Deserialize, Clone)]
pub struct OdReadingRow {
    pub timestamp: DateTime<Utc>,
    pub channel: String,
    pub angle: u16,
    pub od: f64,
    pub ir_led_intensity: f64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DosingKindRow {
    AddMedia,
    AddAltMedia,
    RemoveWaste,
}

/// One dosing event row of a historical recording.
///
/// Expected headers:
/// timestamp,kind,volume_change,source_of_event
#[derive(Debug, Deserialize, Clone)]
pub struct DosingEventRow {
    pub timestamp: DateTime<Utc>,
    pub kind: DosingKindRow,
    pub volume_change: f64,
    pub source_of_event: String,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct KalmanCfg {
    /// Prior observation noise (relative to signal magnitude).
    pub od_std: f64,
    pub od_process_std: f64,
    pub rate_process_std: f64,
    pub accel_process_std: f64,
    pub initial_od_variance: f64,
    pub initial_rate_variance: f64,
    pub initial_accel_variance: f64,
    /// Standardized residual above which a reading is rejected. <= 0 disables the gate.
    pub ekf_outlier_std_threshold: f64,
    /// Consecutive rejections after which the next reading is accepted as a level shift.
    pub max_consecutive_outliers: u32,
    /// "mean" | "geometric_mean" | "first_channel"
    pub od_reducer: String,
    /// Process variance per unit OD applied on OD slots while absorbing a dose.
    pub dilution_od_process_variance: f64,
}

impl Default for KalmanCfg {
    fn default() -> Self {
        Self {
            od_std: 0.01,
            od_process_std: 1e-4,
            rate_process_std: 1e-5,
            accel_process_std: 1e-6,
            initial_od_variance: 1e-4,
            initial_rate_variance: 1e-5,
            initial_accel_variance: 1e-9,
            ekf_outlier_std_threshold: 5.0,
            max_consecutive_outliers: 10,
            od_reducer: "mean".to_string(),
            dilution_od_process_variance: 1e-7,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct NormalizationCfg {
    /// Variance assigned to each channel when a baseline is bootstrapped live.
    pub variance_prior: f64,
}

impl Default for NormalizationCfg {
    fn default() -> Self {
        Self {
            variance_prior: 1e-6,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
pub struct ShockCfg {
    /// Observation-noise multiplier while the dose settles.
    pub factor: f64,
    /// Observation-noise relaxation window; process noise relaxes over 2.5x this.
    pub seconds: f64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DilutionCfg {
    pub add_media: ShockCfg,
    pub add_alt_media: ShockCfg,
    pub remove_waste: ShockCfg,
}

impl Default for DilutionCfg {
    fn default() -> Self {
        Self {
            add_media: ShockCfg {
                factor: 50.0,
                seconds: 300.0,
            },
            add_alt_media: ShockCfg {
                factor: 50.0,
                seconds: 300.0,
            },
            remove_waste: ShockCfg {
                factor: 5.0,
                seconds: 60.0,
            },
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RunnerCfg {
    /// Floor applied to dt so duplicate timestamps cannot blow up the filter.
    pub min_dt_ms: u64,
    /// Live mode: report staleness after this long without a reading.
    pub max_staleness_ms: u64,
    /// Live mode: granularity of source polling (and of stop-signal checks).
    pub poll_ms: u64,
    /// How long the CLI blocks on the initialization barrier.
    pub init_timeout_ms: u64,
}

impl Default for RunnerCfg {
    fn default() -> Self {
        Self {
            min_dt_ms: 100,
            max_staleness_ms: 60_000,
            poll_ms: 50,
            init_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreCfg {
    /// Directory holding one JSON file per persisted cache.
    pub path: String,
}

impl Default for StoreCfg {
    fn default() -> Self {
        Self {
            path: ".growth_cache".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

fn default_unit() -> String {
    "unit".to_string()
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub experiment: String,
    #[serde(default = "default_unit")]
    pub unit: String,
    /// Channels the filter tracks. Empty: take the channels of the first batch.
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub growth_rate_kalman: KalmanCfg,
    #[serde(default)]
    pub normalization: NormalizationCfg,
    #[serde(default)]
    pub dilution: DilutionCfg,
    #[serde(default)]
    pub runner: RunnerCfg,
    #[serde(default)]
    pub store: StoreCfg,
    #[serde(default)]
    pub logging: Logging,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

fn positive_finite(v: f64) -> bool {
    v.is_finite() && v > 0.0
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        if self.experiment.trim().is_empty() {
            eyre::bail!("experiment must not be empty");
        }
        if self.unit.trim().is_empty() {
            eyre::bail!("unit must not be empty");
        }
        for (i, ch) in self.channels.iter().enumerate() {
            if ch.trim().is_empty() {
                eyre::bail!("channels[{i}] must not be empty");
            }
            if self.channels[..i].contains(ch) {
                eyre::bail!("channels contains duplicate entry {ch:?}");
            }
        }

        // Kalman
        let k = &self.growth_rate_kalman;
        let positives = [
            ("growth_rate_kalman.od_std", k.od_std),
            ("growth_rate_kalman.od_process_std", k.od_process_std),
            ("growth_rate_kalman.rate_process_std", k.rate_process_std),
            ("growth_rate_kalman.accel_process_std", k.accel_process_std),
            ("growth_rate_kalman.initial_od_variance", k.initial_od_variance),
            (
                "growth_rate_kalman.initial_rate_variance",
                k.initial_rate_variance,
            ),
            (
                "growth_rate_kalman.initial_accel_variance",
                k.initial_accel_variance,
            ),
            (
                "growth_rate_kalman.dilution_od_process_variance",
                k.dilution_od_process_variance,
            ),
        ];
        for (name, v) in positives {
            if !positive_finite(v) {
                eyre::bail!("{name} must be finite and > 0");
            }
        }
        if k.ekf_outlier_std_threshold.is_nan() {
            eyre::bail!("growth_rate_kalman.ekf_outlier_std_threshold must be a number");
        }
        if k.max_consecutive_outliers == 0 {
            eyre::bail!("growth_rate_kalman.max_consecutive_outliers must be >= 1");
        }
        if !matches!(
            k.od_reducer.as_str(),
            "mean" | "geometric_mean" | "first_channel"
        ) {
            eyre::bail!(
                "growth_rate_kalman.od_reducer must be one of mean, geometric_mean, first_channel (got {:?})",
                k.od_reducer
            );
        }

        // Normalization
        if !positive_finite(self.normalization.variance_prior) {
            eyre::bail!("normalization.variance_prior must be finite and > 0");
        }

        // Dilution
        for (name, s) in [
            ("dilution.add_media", self.dilution.add_media),
            ("dilution.add_alt_media", self.dilution.add_alt_media),
            ("dilution.remove_waste", self.dilution.remove_waste),
        ] {
            if !(s.factor.is_finite() && s.factor >= 1.0) {
                eyre::bail!("{name}.factor must be finite and >= 1.0");
            }
            if !(s.seconds.is_finite() && s.seconds >= 0.0) {
                eyre::bail!("{name}.seconds must be finite and >= 0.0");
            }
        }

        // Runner
        if self.runner.min_dt_ms == 0 {
            eyre::bail!("runner.min_dt_ms must be >= 1");
        }
        if self.runner.poll_ms == 0 {
            eyre::bail!("runner.poll_ms must be >= 1");
        }
        if self.runner.max_staleness_ms < self.runner.poll_ms {
            eyre::bail!("runner.max_staleness_ms must be >= runner.poll_ms");
        }

        // Store
        if self.store.path.trim().is_empty() {
            eyre::bail!("store.path must not be empty");
        }

        Ok(())
    }
}

fn check_headers(
    rdr: &mut csv::Reader<std::fs::File>,
    path: &Path,
    expected: &[&str],
) -> eyre::Result<()> {
    let headers = rdr
        .headers()
        .map_err(|e| eyre::eyre!("read CSV headers {:?}: {}", path, e))?
        .clone();
    let actual: Vec<String> = headers.iter().map(|s| s.trim().to_string()).collect();
    if actual != expected {
        eyre::bail!(
            "recording CSV must have headers '{}', got: {}",
            expected.join(","),
            actual.join(",")
        );
    }
    Ok(())
}

fn load_rows<T: serde::de::DeserializeOwned>(
    path: &Path,
    expected: &[&str],
) -> eyre::Result<Vec<T>> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| eyre::eyre!("open recording CSV {:?}: {}", path, e))?;
    check_headers(&mut rdr, path, expected)?;

    let mut rows = Vec::new();
    for (idx, rec) in rdr.deserialize::<T>().enumerate() {
        match rec {
            Ok(row) => rows.push(row),
            Err(e) => {
                eyre::bail!("invalid CSV row {}: {}", idx + 2, e);
            }
        }
    }
    Ok(rows)
}

/// Load OD readings, enforcing ascending timestamps.
pub fn load_od_readings_csv(path: &Path) -> eyre::Result<Vec<OdReadingRow>> {
    let rows: Vec<OdReadingRow> = load_rows(
        path,
        &["timestamp", "channel", "angle", "od", "ir_led_intensity"],
    )?;
    for i in 1..rows.len() {
        if rows[i].timestamp < rows[i - 1].timestamp {
            eyre::bail!(
                "OD readings must be ordered by timestamp (row {} precedes row {})",
                i + 2,
                i + 1
            );
        }
    }
    Ok(rows)
}

/// Load dosing events, enforcing ascending timestamps.
pub fn load_dosing_events_csv(path: &Path) -> eyre::Result<Vec<DosingEventRow>> {
    let rows: Vec<DosingEventRow> = load_rows(
        path,
        &["timestamp", "kind", "volume_change", "source_of_event"],
    )?;
    for i in 1..rows.len() {
        if rows[i].timestamp < rows[i - 1].timestamp {
            eyre::bail!(
                "dosing events must be ordered by timestamp (row {} precedes row {})",
                i + 2,
                i + 1
            );
        }
    }
    Ok(rows)
}
