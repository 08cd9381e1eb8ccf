//! Growth-rate estimation job.
//!
//! Pulls reading batches and dosing events in timestamp order, normalizes each
//! batch against the calibration baseline, gates outliers, and feeds the EKF.
//! Every accepted batch yields one `GrowthEstimate`, persisted and published.
//!
//! Lifecycle: `Initializing` until the first batch covering every tracked
//! channel, then `SteadyState`, then `Exhausted` (historical) or
//! `Disconnected` (live), or `Failed` after a fatal error.
use std::sync::Arc;

use growth_traits::{Clock, KeyValueStore, Publisher};
use nalgebra::{DMatrix, DVector};
use tracing::{debug, error, info, warn};

use crate::builder::JobBuilder;
use crate::config::EstimatorCfg;
use crate::ekf::ExtendedKalmanFilter;
use crate::error::{EstimationError, Result};
use crate::merge::{Arrival, Merged, Merger};
use crate::normalization::{ChannelMap, NormalizationModel};
use crate::publish::{self, GROWTH_RATE_TOPIC, KALMAN_FILTER_OUTPUTS_TOPIC, OD_FILTERED_TOPIC};
use crate::reducer::OdReducer;
use crate::source::{EventSource, ReadingSource, StopSignal};
use crate::status::JobState;
use crate::store::{self, GROWTH_RATE, OD_FILTERED};
use crate::types::{
    ChannelId, DosingEvent, GrowthEstimate, GrowthRateSample, OdFilteredSample, ReadingBatch,
    Timestamp,
};
use crate::util;

pub struct GrowthRateEstimationJob {
    pub(crate) experiment: String,
    pub(crate) unit: String,
    pub(crate) channels: Vec<ChannelId>,
    pub(crate) cfg: EstimatorCfg,
    pub(crate) store: Box<dyn KeyValueStore + Send>,
    pub(crate) publisher: Box<dyn Publisher + Send>,
    pub(crate) clock: Arc<dyn Clock + Send + Sync>,
    pub(crate) reducer: Box<dyn OdReducer>,
}

impl core::fmt::Debug for GrowthRateEstimationJob {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("GrowthRateEstimationJob")
            .field("experiment", &self.experiment)
            .field("unit", &self.unit)
            .field("channels", &self.channels)
            .finish_non_exhaustive()
    }
}

/// Both sources must agree on live vs historical.
pub(crate) fn check_modes<R: ReadingSource, E: EventSource>(od: &R, ev: &E) -> Result<()> {
    if od.is_live() != ev.is_live() {
        return Err(EstimationError::MixedSourceMode {
            od_live: od.is_live(),
            events_live: ev.is_live(),
        });
    }
    Ok(())
}

impl GrowthRateEstimationJob {
    pub fn builder() -> JobBuilder {
        JobBuilder::default()
    }

    pub fn experiment(&self) -> &str {
        &self.experiment
    }

    pub fn config(&self) -> &EstimatorCfg {
        &self.cfg
    }

    /// Lazy sequence of estimates.
    ///
    /// Fails before consuming anything when the sources disagree on live vs
    /// historical, or when a historical run has no cached baseline.
    pub fn process<R: ReadingSource, E: EventSource>(
        self,
        od_source: R,
        event_source: E,
    ) -> Result<EstimateStream<R, E>> {
        check_modes(&od_source, &event_source)?;
        let live = od_source.is_live();

        let normalization = NormalizationModel::load(
            self.store.as_ref(),
            &self.experiment,
            self.cfg.variance_prior,
        )?;
        if normalization.is_none() && !live {
            return Err(EstimationError::MissingCalibration(self.experiment));
        }
        if let Some(model) = &normalization {
            if !self.channels.is_empty() {
                model.check_channels(&self.channels)?;
            }
        }
        let blank = NormalizationModel::load_blank(self.store.as_ref(), &self.experiment)?;
        let cached_rate = self.cached(GROWTH_RATE);
        let cached_od = self.cached(OD_FILTERED);

        info!(
            experiment = %self.experiment,
            live,
            warm = cached_rate.is_some() && cached_od.is_some(),
            calibrated = normalization.is_some(),
            "growth-rate job starting"
        );

        let runner = &self.cfg.runner;
        let merger = Merger::new(
            od_source,
            event_source,
            Arc::clone(&self.clock),
            std::time::Duration::from_millis(runner.poll_ms),
            runner.max_staleness_ms,
        );

        Ok(EstimateStream {
            merger,
            core: JobCore {
                topics: Topics::new(&self.unit, &self.experiment),
                experiment: self.experiment,
                live,
                tracked: self.channels,
                cfg: self.cfg,
                store: self.store,
                publisher: self.publisher,
                reducer: self.reducer,
                normalization,
                blank,
                cached_rate,
                cached_od,
                ekf: None,
                last_accepted: None,
                last_emitted: None,
                consecutive_outliers: 0,
                state: JobState::Initializing,
                store_error_reported: false,
                pending_error: None,
                on_initialized: None,
                stats: JobStats::default(),
            },
        })
    }

    fn cached(&self, cache: &str) -> Option<f64> {
        match store::get_json::<f64, _>(self.store.as_ref(), cache, &self.experiment) {
            Ok(v) => v.filter(|v| v.is_finite()),
            Err(e) => {
                warn!(error = %e, cache, "ignoring unreadable cached value");
                None
            }
        }
    }
}

/// Counters over one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JobStats {
    pub accepted: u64,
    pub rejected_outliers: u64,
    pub skipped_batches: u64,
    pub dosing_events: u64,
}

struct Topics {
    growth_rate: String,
    od_filtered: String,
    kalman_filter_outputs: String,
}

impl Topics {
    fn new(unit: &str, experiment: &str) -> Self {
        Self {
            growth_rate: publish::topic(unit, experiment, GROWTH_RATE_TOPIC),
            od_filtered: publish::topic(unit, experiment, OD_FILTERED_TOPIC),
            kalman_filter_outputs: publish::topic(unit, experiment, KALMAN_FILTER_OUTPUTS_TOPIC),
        }
    }
}

/// Everything but the sources; consumes one merged element at a time.
struct JobCore {
    experiment: String,
    live: bool,
    /// Configured channels until initialization, then the channels in the filter.
    tracked: Vec<ChannelId>,
    cfg: EstimatorCfg,
    store: Box<dyn KeyValueStore + Send>,
    publisher: Box<dyn Publisher + Send>,
    reducer: Box<dyn OdReducer>,
    topics: Topics,
    normalization: Option<NormalizationModel>,
    blank: ChannelMap,
    cached_rate: Option<f64>,
    cached_od: Option<f64>,
    ekf: Option<ExtendedKalmanFilter>,
    last_accepted: Option<Arrival>,
    last_emitted: Option<GrowthEstimate>,
    consecutive_outliers: u32,
    state: JobState,
    store_error_reported: bool,
    pending_error: Option<EstimationError>,
    on_initialized: Option<Box<dyn FnOnce() + Send>>,
    stats: JobStats,
}

impl JobCore {
    fn handle(&mut self, item: Merged) -> Result<Option<GrowthEstimate>> {
        match item {
            Merged::Stale { stalled_ms } => {
                warn!(stalled_ms, "no OD reading within the staleness window");
                Err(EstimationError::Stale { stalled_ms })
            }
            Merged::Event { event, arrival } => {
                self.on_event(&event, arrival);
                Ok(None)
            }
            Merged::Batch { batch, arrival } => {
                if self.ekf.is_some() {
                    self.on_batch(&batch, arrival)
                } else {
                    self.initialize(&batch, arrival)
                }
            }
        }
    }

    fn on_event(&mut self, event: &DosingEvent, arrival: Arrival) {
        let Some(ekf) = self.ekf.as_mut() else {
            debug!(kind = ?event.kind, "ignoring dosing event before initialization");
            return;
        };
        self.stats.dosing_events += 1;
        let shock = self.cfg.dilution.for_kind(event.kind);
        // the relaxation window starts at the dose, not at the last reading
        let lag = self
            .last_accepted
            .map_or(0.0, |prev| arrival.since(&prev).as_secs_f64());
        ekf.scale_noise_temporarily(shock.factor, shock.seconds + lag);
        debug!(
            kind = ?event.kind,
            volume_change = event.volume_change,
            source = %event.source_of_event,
            factor = shock.factor,
            seconds = shock.seconds,
            "dosing event"
        );
    }

    /// Raw ODs of the tracked channels, or `None` (with the reason logged) if unusable.
    fn tracked_ods(&mut self, batch: &ReadingBatch, quiet_if_incomplete: bool) -> Option<ChannelMap> {
        if !batch.covers(&self.tracked) {
            self.stats.skipped_batches += 1;
            if quiet_if_incomplete {
                debug!(ts = %batch.timestamp, "waiting for a batch covering every channel");
            } else {
                warn!(ts = %batch.timestamp, "skipping batch missing tracked channels");
            }
            return None;
        }
        let raw: ChannelMap = self
            .tracked
            .iter()
            .filter_map(|ch| batch.readings.get(ch).map(|r| (ch.clone(), r.od)))
            .collect();
        if raw.values().any(|v| !v.is_finite()) {
            self.stats.skipped_batches += 1;
            warn!(ts = %batch.timestamp, "skipping batch with non-finite OD");
            return None;
        }
        Some(raw)
    }

    fn observation(&self, normalized: &ChannelMap) -> DVector<f64> {
        DVector::from_iterator(
            self.tracked.len(),
            self.tracked
                .iter()
                .map(|ch| normalized.get(ch).copied().unwrap_or(f64::NAN)),
        )
    }

    fn initialize(&mut self, batch: &ReadingBatch, arrival: Arrival) -> Result<Option<GrowthEstimate>> {
        if self.tracked.is_empty() {
            self.tracked = batch.readings.keys().cloned().collect();
            if self.tracked.is_empty() {
                return Ok(None);
            }
        }
        let Some(raw) = self.tracked_ods(batch, true) else {
            return Ok(None);
        };

        if self.normalization.is_none() {
            let model = NormalizationModel::bootstrap(&raw, self.cfg.variance_prior, self.blank.clone());
            info!(channels = raw.len(), "bootstrapped normalization baseline from first reading");
            if let Err(e) = model.save(self.store.as_mut(), &self.experiment) {
                self.store_failed(e);
            }
            self.normalization = Some(model);
        }
        let Some(model) = self.normalization.as_ref() else {
            return Ok(None);
        };
        model.check_channels(&self.tracked)?;
        let normalized = model.normalize(&raw)?;
        let observation_noise = model.observation_noise(&self.tracked, self.cfg.kalman.od_std);
        let y = self.observation(&normalized);

        let n = self.tracked.len();
        let k = &self.cfg.kalman;
        let mut x0 = DVector::<f64>::zeros(n + 2);
        for i in 0..n {
            x0[i] = self.cached_od.unwrap_or(y[i]);
        }
        x0[n] = self.cached_rate.unwrap_or(0.0);

        let diag = |od: f64, rate: f64, accel: f64| {
            let mut d = DVector::from_element(n + 2, od);
            d[n] = rate;
            d[n + 1] = accel;
            DMatrix::from_diagonal(&d)
        };
        let p0 = diag(
            k.initial_od_variance,
            k.initial_rate_variance,
            k.initial_accel_variance,
        );
        let q = diag(
            k.od_process_std.powi(2),
            k.rate_process_std.powi(2),
            k.accel_process_std.powi(2),
        );
        let ekf = ExtendedKalmanFilter::new(x0, p0, q, observation_noise)?
            .with_dilution_od_process_variance(k.dilution_od_process_variance);

        self.ekf = Some(ekf);
        self.last_accepted = Some(arrival);
        self.state = JobState::SteadyState;
        self.stats.accepted += 1;
        let estimate = self.emit(batch.timestamp)?;
        info!(
            channels = ?self.tracked.iter().map(ChannelId::as_str).collect::<Vec<_>>(),
            growth_rate = estimate.growth_rate.growth_rate,
            od_filtered = estimate.od_filtered.od_filtered,
            "growth-rate filter initialized"
        );
        if let Some(release) = self.on_initialized.take() {
            release();
        }
        Ok(Some(estimate))
    }

    fn on_batch(&mut self, batch: &ReadingBatch, arrival: Arrival) -> Result<Option<GrowthEstimate>> {
        let Some(raw) = self.tracked_ods(batch, false) else {
            return Ok(None);
        };
        let Some(model) = self.normalization.as_ref() else {
            return Ok(None);
        };
        let normalized = model.normalize(&raw)?;
        let y = self.observation(&normalized);
        let elapsed = self
            .last_accepted
            .map_or(std::time::Duration::ZERO, |prev| arrival.since(&prev));
        let dt = util::dt_hours(elapsed, self.cfg.runner.min_dt_ms);

        let gate = &self.cfg.kalman;
        let Some(ekf) = self.ekf.as_mut() else {
            return Ok(None);
        };
        if gate.gate_enabled() {
            let z = ekf.residual(&y, dt)?.max_standardized();
            if z > gate.outlier_std_threshold && !ekf.is_absorbing_shock() {
                if self.consecutive_outliers < gate.max_consecutive_outliers {
                    self.consecutive_outliers += 1;
                    self.stats.rejected_outliers += 1;
                    warn!(
                        ts = %batch.timestamp,
                        standardized_residual = z,
                        threshold = gate.outlier_std_threshold,
                        "rejecting outlier batch"
                    );
                    return Ok(self.reemit(batch.timestamp));
                }
                warn!(
                    consecutive = self.consecutive_outliers,
                    standardized_residual = z,
                    "accepting batch after repeated rejections as a level shift"
                );
            }
        }

        ekf.update(&y, dt)?;
        self.consecutive_outliers = 0;
        self.last_accepted = Some(arrival);
        self.stats.accepted += 1;
        let estimate = self.emit(batch.timestamp)?;
        debug!(
            ts = %batch.timestamp,
            growth_rate = estimate.growth_rate.growth_rate,
            od_filtered = estimate.od_filtered.od_filtered,
            "accepted batch"
        );
        Ok(Some(estimate))
    }

    /// Previous values with the new timestamp; published, not persisted.
    fn reemit(&mut self, timestamp: Timestamp) -> Option<GrowthEstimate> {
        let estimate = self.last_emitted.as_ref()?.restamped(timestamp);
        self.publish(&estimate);
        self.last_emitted = Some(estimate.clone());
        Some(estimate)
    }

    fn emit(&mut self, timestamp: Timestamp) -> Result<GrowthEstimate> {
        let Some(ekf) = self.ekf.as_ref() else {
            return Err(EstimationError::NumericalInstability(
                "no filter to emit from".into(),
            ));
        };
        let estimate = GrowthEstimate {
            growth_rate: GrowthRateSample {
                growth_rate: ekf.growth_rate(),
                timestamp,
            },
            od_filtered: OdFilteredSample {
                od_filtered: self.reducer.reduce(&ekf.od_states()),
                timestamp,
            },
            kalman_filter_output: ekf.snapshot(timestamp),
        };
        self.persist(&estimate);
        self.publish(&estimate);
        self.last_emitted = Some(estimate.clone());
        Ok(estimate)
    }

    fn persist(&mut self, estimate: &GrowthEstimate) {
        let rate = estimate.growth_rate.growth_rate;
        let od = estimate.od_filtered.od_filtered;
        let mut result = store::set_json(self.store.as_mut(), GROWTH_RATE, &self.experiment, &rate);
        if od.is_finite() {
            result = result.and_then(|()| {
                store::set_json(self.store.as_mut(), OD_FILTERED, &self.experiment, &od)
            });
        } else {
            warn!(od_filtered = od, "not persisting non-finite od_filtered");
        }
        if let Err(e) = result {
            self.store_failed(e);
        }
    }

    fn store_failed(&mut self, e: EstimationError) {
        warn!(error = %e, "failed to persist growth-rate state");
        if !self.store_error_reported {
            self.store_error_reported = true;
            self.pending_error = Some(e);
        }
    }

    fn publish(&mut self, estimate: &GrowthEstimate) {
        let messages = [
            (
                &self.topics.growth_rate,
                serde_json::to_string(&estimate.growth_rate),
            ),
            (
                &self.topics.od_filtered,
                serde_json::to_string(&estimate.od_filtered),
            ),
            (
                &self.topics.kalman_filter_outputs,
                serde_json::to_string(&estimate.kalman_filter_output),
            ),
        ];
        for (topic, payload) in messages {
            let sent = payload
                .map_err(|e| e.to_string())
                .and_then(|p| self.publisher.publish(topic, &p).map_err(|e| e.to_string()));
            if let Err(e) = sent {
                warn!(topic = %topic, error = %e, "publish failed");
            }
        }
    }

    fn finish(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.state = if self.live {
            JobState::Disconnected
        } else {
            JobState::Exhausted
        };
        info!(
            state = ?self.state,
            accepted = self.stats.accepted,
            rejected_outliers = self.stats.rejected_outliers,
            skipped_batches = self.stats.skipped_batches,
            "growth-rate job finished"
        );
    }
}

/// Iterator of estimates produced by `GrowthRateEstimationJob::process`.
///
/// Non-fatal problems (staleness, a failed store write) come through as `Err`
/// items and the stream keeps going. A fatal error is yielded once and the
/// stream then ends with the job in `JobState::Failed`.
pub struct EstimateStream<R, E> {
    merger: Merger<R, E, Arc<dyn Clock + Send + Sync>>,
    core: JobCore,
}

impl<R: ReadingSource, E: EventSource> EstimateStream<R, E> {
    pub fn state(&self) -> JobState {
        self.core.state
    }

    pub fn stats(&self) -> JobStats {
        self.core.stats
    }

    pub fn is_live(&self) -> bool {
        self.core.live
    }

    /// Channels in the filter, in state order (empty before initialization
    /// when no channels were configured).
    pub fn channels(&self) -> &[ChannelId] {
        &self.core.tracked
    }

    /// Filter state, once initialized.
    pub fn kalman_filter(&self) -> Option<&ExtendedKalmanFilter> {
        self.core.ekf.as_ref()
    }

    /// Stop between elements once `stop` is raised.
    pub fn with_stop(mut self, stop: StopSignal) -> Self {
        self.merger = self.merger.with_stop(stop);
        self
    }

    /// Run `f` once, right after the initial estimate is emitted.
    pub fn on_initialized(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.core.on_initialized = Some(Box::new(f));
        self
    }
}

impl<R: ReadingSource, E: EventSource> Iterator for EstimateStream<R, E> {
    type Item = Result<GrowthEstimate>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(e) = self.core.pending_error.take() {
                return Some(Err(e));
            }
            if self.core.state.is_terminal() {
                return None;
            }
            let Some(item) = self.merger.next() else {
                self.core.finish();
                return None;
            };
            match self.core.handle(item) {
                Ok(Some(estimate)) => return Some(Ok(estimate)),
                Ok(None) => {}
                Err(e) => {
                    if e.is_fatal() {
                        error!(error = %e, "growth-rate job terminated");
                        self.core.state = JobState::Failed;
                    }
                    return Some(Err(e));
                }
            }
        }
    }
}
