//! Builder for `GrowthRateEstimationJob`.
//!
//! Experiment and store are required; everything else has a default
//! (`NullPublisher`, `MonotonicClock`, `MeanReducer`, `EstimatorCfg::default()`).

use std::sync::Arc;

use growth_traits::{Clock, KeyValueStore, MonotonicClock, Publisher};

use crate::config::{EstimatorCfg, ShockCfg};
use crate::error::{BuildError, Result};
use crate::job::GrowthRateEstimationJob;
use crate::publish::NullPublisher;
use crate::reducer::{MeanReducer, OdReducer, reducer_from_name};
use crate::types::ChannelId;

#[derive(Default)]
pub struct JobBuilder {
    experiment: Option<String>,
    unit: Option<String>,
    channels: Vec<ChannelId>,
    cfg: Option<EstimatorCfg>,
    store: Option<Box<dyn KeyValueStore + Send>>,
    publisher: Option<Box<dyn Publisher + Send>>,
    clock: Option<Arc<dyn Clock + Send + Sync>>,
    reducer: Option<Box<dyn OdReducer>>,
}

fn positive(v: f64) -> bool {
    v.is_finite() && v > 0.0
}

fn validate(cfg: &EstimatorCfg, channels: &[ChannelId]) -> std::result::Result<(), BuildError> {
    let k = &cfg.kalman;
    if !positive(k.od_std) {
        return Err(BuildError::InvalidConfig("od_std must be > 0"));
    }
    if ![k.od_process_std, k.rate_process_std, k.accel_process_std]
        .into_iter()
        .all(positive)
    {
        return Err(BuildError::InvalidConfig("process stds must be > 0"));
    }
    if ![
        k.initial_od_variance,
        k.initial_rate_variance,
        k.initial_accel_variance,
    ]
    .into_iter()
    .all(positive)
    {
        return Err(BuildError::InvalidConfig("initial variances must be > 0"));
    }
    if k.outlier_std_threshold.is_nan() {
        return Err(BuildError::InvalidConfig(
            "outlier_std_threshold must be a number",
        ));
    }
    if k.max_consecutive_outliers == 0 {
        return Err(BuildError::InvalidConfig(
            "max_consecutive_outliers must be >= 1",
        ));
    }
    if !positive(k.dilution_od_process_variance) {
        return Err(BuildError::InvalidConfig(
            "dilution_od_process_variance must be > 0",
        ));
    }
    let shocks: [ShockCfg; 3] = [
        cfg.dilution.add_media,
        cfg.dilution.add_alt_media,
        cfg.dilution.remove_waste,
    ];
    if shocks.iter().any(|s| !positive(s.factor)) {
        return Err(BuildError::InvalidConfig("shock factor must be > 0"));
    }
    if shocks
        .iter()
        .any(|s| !(s.seconds.is_finite() && s.seconds >= 0.0))
    {
        return Err(BuildError::InvalidConfig("shock seconds must be >= 0"));
    }
    if !positive(cfg.variance_prior) {
        return Err(BuildError::InvalidConfig("variance_prior must be > 0"));
    }
    if cfg.runner.min_dt_ms == 0 {
        return Err(BuildError::InvalidConfig("min_dt_ms must be >= 1"));
    }
    if cfg.runner.poll_ms == 0 {
        return Err(BuildError::InvalidConfig("poll_ms must be >= 1"));
    }
    for (i, ch) in channels.iter().enumerate() {
        if channels[..i].contains(ch) {
            return Err(BuildError::InvalidConfig("channels must be unique"));
        }
    }
    Ok(())
}

impl JobBuilder {
    /// Builder pre-filled from a validated TOML config; the store is still required.
    pub fn from_config(cfg: &growth_config::Config) -> Result<Self> {
        Ok(Self::default()
            .experiment(cfg.experiment.clone())
            .unit(cfg.unit.clone())
            .channels(cfg.channels.iter().map(String::as_str))
            .config(EstimatorCfg::from(cfg))
            .boxed_reducer(reducer_from_name(&cfg.growth_rate_kalman.od_reducer)?))
    }

    pub fn experiment(mut self, experiment: impl Into<String>) -> Self {
        self.experiment = Some(experiment.into());
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Channels to track. Left empty, the first batch decides.
    pub fn channels<I, C>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<ChannelId>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn config(mut self, cfg: EstimatorCfg) -> Self {
        self.cfg = Some(cfg);
        self
    }

    pub fn store<S: KeyValueStore + Send + 'static>(mut self, store: S) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    pub fn publisher<P: Publisher + Send + 'static>(mut self, publisher: P) -> Self {
        self.publisher = Some(Box::new(publisher));
        self
    }

    /// Clock for live dt and staleness; defaults to `MonotonicClock`.
    pub fn clock<C: Clock + Send + Sync + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn reducer<R: OdReducer + 'static>(mut self, reducer: R) -> Self {
        self.reducer = Some(Box::new(reducer));
        self
    }

    pub fn boxed_reducer(mut self, reducer: Box<dyn OdReducer>) -> Self {
        self.reducer = Some(reducer);
        self
    }

    pub fn try_build(self) -> Result<GrowthRateEstimationJob> {
        let experiment = self
            .experiment
            .filter(|e| !e.trim().is_empty())
            .ok_or(BuildError::MissingExperiment)?;
        let store = self.store.ok_or(BuildError::MissingStore)?;
        let cfg = self.cfg.unwrap_or_default();
        validate(&cfg, &self.channels)?;

        Ok(GrowthRateEstimationJob {
            experiment,
            unit: self.unit.unwrap_or_else(|| "unit".to_string()),
            channels: self.channels,
            cfg,
            store,
            publisher: self
                .publisher
                .unwrap_or_else(|| Box::new(NullPublisher)),
            clock: self
                .clock
                .unwrap_or_else(|| Arc::new(MonotonicClock::new())),
            reducer: self.reducer.unwrap_or_else(|| Box::new(MeanReducer)),
        })
    }
}
