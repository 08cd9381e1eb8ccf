#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Growth-rate estimation core (transport-agnostic).
//!
//! Turns noisy, heteroscedastic OD readings into a continuously updated
//! (growth rate, filtered OD) pair. The persisted cache, the message bus and
//! time all come in through `growth_traits`.
//!
//! ## Architecture
//!
//! - **Filter**: multi-channel EKF over `[OD_1..OD_n, rate, accel]` (`ekf`)
//! - **Calibration**: per-channel blank/mean/variance baseline (`normalization`)
//! - **Sources**: historical recordings and live feeds, merged by timestamp (`source`, `merge`)
//! - **Job**: normalize, gate outliers, absorb dosing shocks, persist, publish (`job`)
//! - **Worker**: background thread with an initialization barrier (`worker`)
//!
//! Time inside the filter is in hours; growth rate is in 1/h.

pub mod atomic;
pub mod builder;
pub mod config;
pub mod conversions;
pub mod ekf;
pub mod error;
pub mod job;
pub mod merge;
pub mod normalization;
pub mod publish;
pub mod reducer;
pub mod source;
pub mod status;
pub mod store;
pub mod types;
pub mod util;
pub mod worker;

pub use builder::JobBuilder;
pub use config::{DilutionCfg, EstimatorCfg, KalmanCfg, RunnerCfg, ShockCfg};
pub use ekf::{ExtendedKalmanFilter, Innovation};
pub use error::{BuildError, EstimationError, Result};
pub use job::{EstimateStream, GrowthRateEstimationJob, JobStats};
pub use normalization::{ChannelMap, NormalizationModel};
pub use reducer::{FirstChannelReducer, GeometricMeanReducer, MeanReducer, OdReducer};
pub use source::{
    EventSource, HistoricalSource, LiveFeed, LiveSource, Pulled, ReadingSource, Source, StopSignal,
};
pub use status::JobState;
pub use store::{JsonFileStore, MemoryStore};
pub use types::{
    Angle, ChannelId, DosingEvent, DosingKind, GrowthEstimate, GrowthRateSample,
    KalmanFilterOutput, OdFilteredSample, RawReading, ReadingBatch, Timestamp,
};
pub use worker::BackgroundJob;
