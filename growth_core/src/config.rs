//! Configuration types for the estimation engine.
//!
//! These are the runtime configuration structs used by `GrowthRateEstimationJob`.
//! They are separate from the TOML-deserialized config in `growth_config`.

use crate::types::DosingKind;

/// Filter tuning.
#[derive(Debug, Clone)]
pub struct KalmanCfg {
    /// Prior observation noise, relative to signal magnitude.
    pub od_std: f64,
    /// Per-step process noise std on each OD slot.
    pub od_process_std: f64,
    /// Per-step process noise std on the rate slot.
    pub rate_process_std: f64,
    /// Per-step process noise std on the acceleration slot.
    pub accel_process_std: f64,
    pub initial_od_variance: f64,
    pub initial_rate_variance: f64,
    pub initial_accel_variance: f64,
    /// Standardized residual above which a batch is rejected. `<= 0` disables the gate.
    pub outlier_std_threshold: f64,
    /// After this many consecutive rejections the next batch is accepted.
    pub max_consecutive_outliers: u32,
    /// OD slots carry `dilution_od_process_variance * |OD|` process variance during a shock.
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
            outlier_std_threshold: 5.0,
            max_consecutive_outliers: 10,
            dilution_od_process_variance: 1e-7,
        }
    }
}

impl KalmanCfg {
    pub fn gate_enabled(&self) -> bool {
        self.outlier_std_threshold > 0.0
    }
}

/// Shock absorption applied for one dosing kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShockCfg {
    /// Observation-noise multiplier.
    pub factor: f64,
    /// Observation-noise relaxation window, seconds.
    pub seconds: f64,
}

#[derive(Debug, Clone)]
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

impl DilutionCfg {
    pub fn for_kind(&self, kind: DosingKind) -> ShockCfg {
        match kind {
            DosingKind::AddMedia => self.add_media,
            DosingKind::AddAltMedia => self.add_alt_media,
            DosingKind::RemoveWaste => self.remove_waste,
        }
    }
}

/// Loop timing.
#[derive(Debug, Clone)]
pub struct RunnerCfg {
    /// Floor applied to dt (ms).
    pub min_dt_ms: u64,
    /// Live only: report staleness after this long without a batch (ms).
    pub max_staleness_ms: u64,
    /// Live only: how long one source poll may block (ms).
    pub poll_ms: u64,
}

impl Default for RunnerCfg {
    fn default() -> Self {
        Self {
            min_dt_ms: 100,
            max_staleness_ms: 60_000,
            poll_ms: 50,
        }
    }
}

/// Everything the job needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct EstimatorCfg {
    pub kalman: KalmanCfg,
    pub dilution: DilutionCfg,
    /// Variance recorded per channel when a baseline is bootstrapped live.
    pub variance_prior: f64,
    pub runner: RunnerCfg,
}

impl Default for EstimatorCfg {
    fn default() -> Self {
        Self {
            kalman: KalmanCfg::default(),
            dilution: DilutionCfg::default(),
            variance_prior: 1e-6,
            runner: RunnerCfg::default(),
        }
    }
}
