//! `From` implementations bridging `growth_config` types to `growth_core` types,
//! plus grouping of recording rows into batches and events.

use crate::config::{DilutionCfg, EstimatorCfg, KalmanCfg, RunnerCfg, ShockCfg};
use crate::types::{Angle, ChannelId, DosingEvent, DosingKind, RawReading, ReadingBatch};

// ── KalmanCfg ────────────────────────────────────────────────────────────────

impl From<&growth_config::KalmanCfg> for KalmanCfg {
    fn from(c: &growth_config::KalmanCfg) -> Self {
        Self {
            od_std: c.od_std,
            od_process_std: c.od_process_std,
            rate_process_std: c.rate_process_std,
            accel_process_std: c.accel_process_std,
            initial_od_variance: c.initial_od_variance,
            initial_rate_variance: c.initial_rate_variance,
            initial_accel_variance: c.initial_accel_variance,
            outlier_std_threshold: c.ekf_outlier_std_threshold,
            max_consecutive_outliers: c.max_consecutive_outliers,
            dilution_od_process_variance: c.dilution_od_process_variance,
        }
    }
}

// ── Dilution ─────────────────────────────────────────────────────────────────

impl From<growth_config::ShockCfg> for ShockCfg {
    fn from(c: growth_config::ShockCfg) -> Self {
        Self {
            factor: c.factor,
            seconds: c.seconds,
        }
    }
}

impl From<&growth_config::DilutionCfg> for DilutionCfg {
    fn from(c: &growth_config::DilutionCfg) -> Self {
        Self {
            add_media: c.add_media.into(),
            add_alt_media: c.add_alt_media.into(),
            remove_waste: c.remove_waste.into(),
        }
    }
}

// ── RunnerCfg ────────────────────────────────────────────────────────────────

impl From<&growth_config::RunnerCfg> for RunnerCfg {
    fn from(c: &growth_config::RunnerCfg) -> Self {
        Self {
            min_dt_ms: c.min_dt_ms,
            max_staleness_ms: c.max_staleness_ms,
            poll_ms: c.poll_ms,
        }
    }
}

// ── EstimatorCfg ─────────────────────────────────────────────────────────────

impl From<&growth_config::Config> for EstimatorCfg {
    fn from(c: &growth_config::Config) -> Self {
        Self {
            kalman: (&c.growth_rate_kalman).into(),
            dilution: (&c.dilution).into(),
            variance_prior: c.normalization.variance_prior,
            runner: (&c.runner).into(),
        }
    }
}

// ── Recording rows ───────────────────────────────────────────────────────────

impl From<growth_config::DosingKindRow> for DosingKind {
    fn from(k: growth_config::DosingKindRow) -> Self {
        match k {
            growth_config::DosingKindRow::AddMedia => Self::AddMedia,
            growth_config::DosingKindRow::AddAltMedia => Self::AddAltMedia,
            growth_config::DosingKindRow::RemoveWaste => Self::RemoveWaste,
        }
    }
}

impl From<&growth_config::DosingEventRow> for DosingEvent {
    fn from(r: &growth_config::DosingEventRow) -> Self {
        Self {
            volume_change: r.volume_change,
            kind: r.kind.into(),
            source_of_event: r.source_of_event.clone(),
            timestamp: r.timestamp,
        }
    }
}

impl From<&growth_config::OdReadingRow> for RawReading {
    fn from(r: &growth_config::OdReadingRow) -> Self {
        Self {
            channel: ChannelId::new(r.channel.clone()),
            angle: Angle(r.angle),
            od: r.od,
            ir_led_intensity: r.ir_led_intensity,
            timestamp: r.timestamp,
        }
    }
}

/// Group consecutive rows sharing a timestamp into one batch each.
///
/// Rows must already be ordered by timestamp.
pub fn batches_from_rows(rows: &[growth_config::OdReadingRow]) -> Vec<ReadingBatch> {
    let mut out: Vec<ReadingBatch> = Vec::new();
    for row in rows {
        match out.last_mut() {
            Some(batch) if batch.timestamp == row.timestamp => batch.insert(row.into()),
            _ => {
                let mut batch = ReadingBatch::new(row.timestamp);
                batch.insert(row.into());
                out.push(batch);
            }
        }
    }
    out
}

pub fn events_from_rows(rows: &[growth_config::DosingEventRow]) -> Vec<DosingEvent> {
    rows.iter().map(DosingEvent::from).collect()
}
