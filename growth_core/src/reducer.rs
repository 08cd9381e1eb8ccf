//! Pooling of per-channel OD states into the published `od_filtered` scalar.

use crate::error::{EstimationError, Result};

/// Collapses the OD slots of the filter state into one value.
///
/// Implementations receive the slots in channel order and at least one value.
pub trait OdReducer: Send {
    fn reduce(&self, ods: &[f64]) -> f64;
}

/// Arithmetic mean (default).
#[derive(Debug, Default, Clone, Copy)]
pub struct MeanReducer;

impl OdReducer for MeanReducer {
    fn reduce(&self, ods: &[f64]) -> f64 {
        if ods.is_empty() {
            return f64::NAN;
        }
        ods.iter().sum::<f64>() / ods.len() as f64
    }
}

/// Geometric mean; falls back to the arithmetic mean when a slot is
/// non-positive.
#[derive(Debug, Default, Clone, Copy)]
pub struct GeometricMeanReducer;

impl OdReducer for GeometricMeanReducer {
    fn reduce(&self, ods: &[f64]) -> f64 {
        if ods.iter().any(|v| *v <= 0.0) {
            return MeanReducer.reduce(ods);
        }
        if ods.is_empty() {
            return f64::NAN;
        }
        (ods.iter().map(|v| v.ln()).sum::<f64>() / ods.len() as f64).exp()
    }
}

/// First channel only.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstChannelReducer;

impl OdReducer for FirstChannelReducer {
    fn reduce(&self, ods: &[f64]) -> f64 {
        ods.first().copied().unwrap_or(f64::NAN)
    }
}

/// Reducer by config name: `mean`, `geometric_mean` or `first_channel`.
pub fn reducer_from_name(name: &str) -> Result<Box<dyn OdReducer>> {
    match name {
        "mean" => Ok(Box::new(MeanReducer)),
        "geometric_mean" => Ok(Box::new(GeometricMeanReducer)),
        "first_channel" => Ok(Box::new(FirstChannelReducer)),
        other => Err(EstimationError::Config(format!(
            "unknown od_reducer {other:?}"
        ))),
    }
}
