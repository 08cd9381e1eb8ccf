//! Per-channel calibration baseline.
//!
//! `normalized = (raw - blank) / (mean - blank)`, so a reading at the
//! calibration mean normalizes to 1.0.

use std::collections::BTreeMap;

use growth_traits::KeyValueStore;
use nalgebra::DMatrix;

use crate::error::{EstimationError, Result};
use crate::store::{self, OD_BLANK, OD_NORMALIZATION_MEAN, OD_NORMALIZATION_VARIANCE};
use crate::types::ChannelId;

pub type ChannelMap = BTreeMap<ChannelId, f64>;

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizationModel {
    blank: ChannelMap,
    mean: ChannelMap,
    variance: ChannelMap,
}

impl NormalizationModel {
    /// Channels missing from `blank` use 0.0.
    pub fn new(mean: ChannelMap, variance: ChannelMap, blank: ChannelMap) -> Self {
        Self {
            blank,
            mean,
            variance,
        }
    }

    /// Cached baseline for `experiment`, if a mean was ever recorded.
    ///
    /// A missing variance cache falls back to `variance_prior` per channel.
    pub fn load<S: KeyValueStore + ?Sized>(
        store: &S,
        experiment: &str,
        variance_prior: f64,
    ) -> Result<Option<Self>> {
        let Some(mean) = store::get_json::<ChannelMap, _>(store, OD_NORMALIZATION_MEAN, experiment)?
        else {
            return Ok(None);
        };
        let variance = match store::get_json::<ChannelMap, _>(
            store,
            OD_NORMALIZATION_VARIANCE,
            experiment,
        )? {
            Some(v) => v,
            None => mean.keys().map(|ch| (ch.clone(), variance_prior)).collect(),
        };
        let blank = Self::load_blank(store, experiment)?;
        Ok(Some(Self::new(mean, variance, blank)))
    }

    pub fn load_blank<S: KeyValueStore + ?Sized>(store: &S, experiment: &str) -> Result<ChannelMap> {
        Ok(store::get_json::<ChannelMap, _>(store, OD_BLANK, experiment)?.unwrap_or_default())
    }

    /// Use the first live reading verbatim as the mean.
    pub fn bootstrap(raw: &ChannelMap, variance_prior: f64, blank: ChannelMap) -> Self {
        let mean = raw.clone();
        let variance = mean.keys().map(|ch| (ch.clone(), variance_prior)).collect();
        Self::new(mean, variance, blank)
    }

    /// Persist mean and variance (the blank is owned by calibration, not by us).
    pub fn save<S: KeyValueStore + ?Sized>(&self, store: &mut S, experiment: &str) -> Result<()> {
        store::set_json(store, OD_NORMALIZATION_MEAN, experiment, &self.mean)?;
        store::set_json(store, OD_NORMALIZATION_VARIANCE, experiment, &self.variance)
    }

    pub fn blank(&self, channel: &ChannelId) -> f64 {
        self.blank.get(channel).copied().unwrap_or(0.0)
    }

    pub fn mean(&self) -> &ChannelMap {
        &self.mean
    }

    pub fn variance(&self) -> &ChannelMap {
        &self.variance
    }

    /// Check every channel in `channels` has a usable mean.
    pub fn check_channels<'a>(
        &self,
        channels: impl IntoIterator<Item = &'a ChannelId>,
    ) -> Result<()> {
        for ch in channels {
            let Some(&mean) = self.mean.get(ch) else {
                return Err(EstimationError::Config(format!(
                    "normalization baseline has no mean for channel {ch}"
                )));
            };
            let span = mean - self.blank(ch);
            if !span.is_finite() || span == 0.0 {
                return Err(EstimationError::Config(format!(
                    "normalization baseline for channel {ch} has mean equal to blank"
                )));
            }
        }
        Ok(())
    }

    /// Normalize every entry of `raw`; output keys equal input keys.
    pub fn normalize(&self, raw: &ChannelMap) -> Result<ChannelMap> {
        raw.iter()
            .map(|(ch, &od)| {
                let mean = self.mean.get(ch).copied().ok_or_else(|| {
                    EstimationError::Config(format!(
                        "normalization baseline has no mean for channel {ch}"
                    ))
                })?;
                let blank = self.blank(ch);
                Ok((ch.clone(), (od - blank) / (mean - blank)))
            })
            .collect()
    }

    /// Observation noise for `channels`, in normalized units.
    ///
    /// Each channel's variance is rescaled by `(mean - blank)²` and expressed
    /// relative to the quietest channel: `R = od_std² · diag(v_i / min v)`.
    /// Channels without a usable variance get ratio 1.
    pub fn observation_noise(&self, channels: &[ChannelId], od_std: f64) -> DMatrix<f64> {
        let scaled: Vec<Option<f64>> = channels
            .iter()
            .map(|ch| {
                let var = self.variance.get(ch).copied()?;
                let span = self.mean.get(ch).copied()? - self.blank(ch);
                let v = var / (span * span);
                (v.is_finite() && v > 0.0).then_some(v)
            })
            .collect();
        let min = scaled
            .iter()
            .flatten()
            .copied()
            .fold(f64::INFINITY, f64::min);
        let base = od_std * od_std;
        DMatrix::from_diagonal(&nalgebra::DVector::from_iterator(
            channels.len(),
            scaled.iter().map(|v| match v {
                Some(v) if min.is_finite() => base * v / min,
                _ => base,
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn map(pairs: &[(&str, f64)]) -> ChannelMap {
        pairs.iter().map(|(k, v)| (ChannelId::from(*k), *v)).collect()
    }

    #[test]
    fn load_is_none_without_mean() {
        let store = MemoryStore::new();
        assert!(NormalizationModel::load(&store, "exp", 1e-6).unwrap().is_none());
    }

    #[test]
    fn save_then_load_keeps_blank_separate() {
        let mut store = MemoryStore::new();
        store::set_json(&mut store, OD_BLANK, "exp", &map(&[("1", 0.1)])).unwrap();
        let model = NormalizationModel::new(map(&[("1", 0.5)]), map(&[("1", 1e-4)]), ChannelMap::new());
        model.save(&mut store, "exp").unwrap();

        let loaded = NormalizationModel::load(&store, "exp", 1e-6).unwrap().unwrap();
        assert_eq!(loaded.mean(), &map(&[("1", 0.5)]));
        assert_eq!(loaded.variance(), &map(&[("1", 1e-4)]));
        assert_eq!(loaded.blank(&ChannelId::from("1")), 0.1);
    }

    #[test]
    fn missing_variance_uses_prior() {
        let mut store = MemoryStore::new();
        store::set_json(&mut store, OD_NORMALIZATION_MEAN, "exp", &map(&[("1", 0.5)])).unwrap();
        let loaded = NormalizationModel::load(&store, "exp", 3e-6).unwrap().unwrap();
        assert_eq!(loaded.variance(), &map(&[("1", 3e-6)]));
    }

    #[test]
    fn degenerate_baseline_is_rejected() {
        let model = NormalizationModel::new(map(&[("1", 0.2)]), ChannelMap::new(), map(&[("1", 0.2)]));
        assert!(model.check_channels([&ChannelId::from("1")]).is_err());
        assert!(model.check_channels([&ChannelId::from("2")]).is_err());
    }

    #[test]
    fn single_channel_noise_is_od_std_squared() {
        let model = NormalizationModel::new(map(&[("1", 0.5)]), map(&[("1", 1e-6)]), ChannelMap::new());
        let r = model.observation_noise(&[ChannelId::from("1")], 0.01);
        assert!((r[(0, 0)] - 1e-4).abs() < 1e-18);
    }

    #[test]
    fn noisier_channel_gets_larger_share() {
        // v1 = 1e-6 / 0.25 = 4e-6, v2 = 1e-6 / 1.0 = 1e-6
        let model = NormalizationModel::new(
            map(&[("1", 0.5), ("2", 1.0)]),
            map(&[("1", 1e-6), ("2", 1e-6)]),
            ChannelMap::new(),
        );
        let chans = [ChannelId::from("1"), ChannelId::from("2")];
        let r = model.observation_noise(&chans, 0.1);
        assert!((r[(0, 0)] - 0.04).abs() < 1e-12);
        assert!((r[(1, 1)] - 0.01).abs() < 1e-12);
        assert_eq!(r[(0, 1)], 0.0);
    }

    #[test]
    fn unusable_variance_falls_back_to_unit_ratio() {
        let model = NormalizationModel::new(
            map(&[("1", 0.5), ("2", 1.0)]),
            map(&[("1", 0.0), ("2", 1e-6)]),
            ChannelMap::new(),
        );
        let chans = [ChannelId::from("1"), ChannelId::from("2")];
        let r = model.observation_noise(&chans, 0.1);
        assert!((r[(0, 0)] - 0.01).abs() < 1e-12);
        assert!((r[(1, 1)] - 0.01).abs() < 1e-12);
    }
}
