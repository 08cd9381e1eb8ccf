//! Multi-channel extended Kalman filter over `[OD_1..OD_n, rate, accel]`.
//!
//! ## Dynamics
//! ```text
//! OD_i  <- OD_i * exp(rate * dt)
//! rate  <- rate + accel * dt
//! accel <- accel
//! ```
//! `dt` is in hours, so `rate` is in 1/h.
//!
//! ## Observation
//! `H = [I_n | 0]`. Noise is multiplicative in OD magnitude: the residual
//! covariance is `H P Hᵀ + D R D` with `D = diag(predicted OD)`.
//!
//! ## Shock absorption
//! A dosing event inflates observation noise and re-shapes the OD process noise
//! for a while. Deadlines live on the filter's own timeline (the sum of `dt`
//! consumed by updates), so replay and live runs relax identically and no
//! timer thread races with `update`.

use nalgebra::{DMatrix, DVector};
use tracing::debug;

use crate::error::{EstimationError, Result};
use crate::types::{KalmanFilterOutput, Timestamp};
use crate::util;

/// Process-noise relaxation outlives observation-noise relaxation by this factor.
pub const PROCESS_RELAXATION_RATIO: f64 = 2.5;

/// Default process variance per unit OD while absorbing a dose.
pub const DEFAULT_DILUTION_OD_PROCESS_VARIANCE: f64 = 1e-7;

/// Innovation and its covariance for one observation, before any update.
#[derive(Debug, Clone)]
pub struct Innovation {
    /// `observation - predicted OD`
    pub innovation: DVector<f64>,
    /// `H P Hᵀ + D R D`
    pub residual_covariance: DMatrix<f64>,
}

impl Innovation {
    /// Per-channel `|innovation_i| / sqrt(S_ii)`.
    pub fn standardized(&self) -> DVector<f64> {
        DVector::from_iterator(
            self.innovation.len(),
            self.innovation
                .iter()
                .enumerate()
                .map(|(i, v)| v.abs() / self.residual_covariance[(i, i)].sqrt()),
        )
    }

    pub fn max_standardized(&self) -> f64 {
        self.standardized().iter().copied().fold(0.0, f64::max)
    }
}

/// Pending relaxations. `None` baselines have already been restored.
#[derive(Debug, Clone)]
struct ShockRecord {
    observation_baseline: Option<DMatrix<f64>>,
    observation_deadline: f64,
    process_baseline: Option<DMatrix<f64>>,
    process_deadline: f64,
}

#[derive(Debug, Clone)]
pub struct ExtendedKalmanFilter {
    n: usize,
    state: DVector<f64>,
    covariance: DMatrix<f64>,
    process_noise: DMatrix<f64>,
    observation_noise: DMatrix<f64>,
    /// Hours consumed by updates so far.
    elapsed: f64,
    shock: Option<ShockRecord>,
    dilution_od_process_variance: f64,
}

fn check_spd(name: &str, m: &DMatrix<f64>, dim: usize) -> Result<()> {
    if m.nrows() != dim || m.ncols() != dim {
        return Err(EstimationError::InvalidCovariance(format!(
            "{name} must be {dim}x{dim}, got {}x{}",
            m.nrows(),
            m.ncols()
        )));
    }
    if m.iter().any(|v| !v.is_finite()) {
        return Err(EstimationError::InvalidCovariance(format!(
            "{name} has non-finite entries"
        )));
    }
    let scale = m.amax().max(1.0);
    if (m - m.transpose()).amax() > 1e-12 * scale {
        return Err(EstimationError::InvalidCovariance(format!(
            "{name} is not symmetric"
        )));
    }
    if m.clone().cholesky().is_none() {
        return Err(EstimationError::InvalidCovariance(format!(
            "{name} is not positive-definite"
        )));
    }
    Ok(())
}

fn all_finite<'a>(values: impl IntoIterator<Item = &'a f64>) -> bool {
    values.into_iter().all(|v| v.is_finite())
}

impl ExtendedKalmanFilter {
    /// Build a filter for `initial_state.len() - 2` channels.
    ///
    /// Every covariance must be symmetric positive-definite and sized to the state
    /// (`n+2`) or, for observation noise, to the channel count (`n`).
    pub fn new(
        initial_state: DVector<f64>,
        initial_covariance: DMatrix<f64>,
        process_noise: DMatrix<f64>,
        observation_noise: DMatrix<f64>,
    ) -> Result<Self> {
        let m = initial_state.len();
        if m < 3 {
            return Err(EstimationError::InvalidCovariance(format!(
                "state must hold at least one OD slot plus rate and acceleration, got {m} entries"
            )));
        }
        if !all_finite(initial_state.iter()) {
            return Err(EstimationError::NumericalInstability(
                "initial state has non-finite entries".into(),
            ));
        }
        let n = m - 2;
        check_spd("initial covariance", &initial_covariance, m)?;
        check_spd("process noise covariance", &process_noise, m)?;
        check_spd("observation noise covariance", &observation_noise, n)?;
        Ok(Self {
            n,
            state: initial_state,
            covariance: initial_covariance,
            process_noise,
            observation_noise,
            elapsed: 0.0,
            shock: None,
            dilution_od_process_variance: DEFAULT_DILUTION_OD_PROCESS_VARIANCE,
        })
    }

    pub fn with_dilution_od_process_variance(mut self, per_unit_od: f64) -> Self {
        self.dilution_od_process_variance = per_unit_od;
        self
    }

    pub fn n_channels(&self) -> usize {
        self.n
    }

    pub fn state(&self) -> &DVector<f64> {
        &self.state
    }

    pub fn covariance(&self) -> &DMatrix<f64> {
        &self.covariance
    }

    pub fn process_noise(&self) -> &DMatrix<f64> {
        &self.process_noise
    }

    pub fn observation_noise(&self) -> &DMatrix<f64> {
        &self.observation_noise
    }

    pub fn growth_rate(&self) -> f64 {
        self.state[self.n]
    }

    pub fn od_states(&self) -> Vec<f64> {
        self.state.rows(0, self.n).iter().copied().collect()
    }

    /// Hours of filter time consumed by updates.
    pub fn elapsed_hours(&self) -> f64 {
        self.elapsed
    }

    /// True while any noise relaxation is still pending.
    pub fn is_absorbing_shock(&self) -> bool {
        self.shock.is_some()
    }

    /// Propagate state and covariance `dt` hours forward without committing.
    pub fn predict(&self, dt: f64) -> (DVector<f64>, DMatrix<f64>) {
        let n = self.n;
        let rate = self.state[n];
        let accel = self.state[n + 1];
        let growth = (rate * dt).exp();

        let mut state_pred = self.state.clone();
        let mut jacobian = DMatrix::<f64>::identity(n + 2, n + 2);
        for i in 0..n {
            let od = self.state[i];
            state_pred[i] = od * growth;
            jacobian[(i, i)] = growth;
            jacobian[(i, n)] = od * dt * growth;
        }
        state_pred[n] = rate + accel * dt;
        jacobian[(n, n + 1)] = dt;

        let covariance_pred =
            &jacobian * &self.covariance * jacobian.transpose() + &self.process_noise;
        (state_pred, covariance_pred)
    }

    /// Innovation of `observation` against the prediction `dt` hours ahead.
    ///
    /// Relaxations whose deadline falls at or before that time are restored first,
    /// so the residual covariance matches what `update` would use.
    pub fn residual(&mut self, observation: &DVector<f64>, dt: f64) -> Result<Innovation> {
        self.expire_relaxations(self.elapsed + dt);
        let (state_pred, covariance_pred) = self.predict(dt);
        self.innovation(observation, &state_pred, &covariance_pred)
    }

    fn innovation(
        &self,
        observation: &DVector<f64>,
        state_pred: &DVector<f64>,
        covariance_pred: &DMatrix<f64>,
    ) -> Result<Innovation> {
        let n = self.n;
        if observation.len() != n {
            return Err(EstimationError::Config(format!(
                "observation has {} entries, filter tracks {n} channels",
                observation.len()
            )));
        }
        let od_pred = state_pred.rows(0, n).into_owned();
        let scale = DMatrix::from_diagonal(&od_pred);
        let residual_covariance =
            covariance_pred.view((0, 0), (n, n)) + &scale * &self.observation_noise * &scale;
        if !all_finite(residual_covariance.iter()) {
            return Err(EstimationError::NumericalInstability(
                "residual covariance is not finite".into(),
            ));
        }
        Ok(Innovation {
            innovation: observation - &od_pred,
            residual_covariance,
        })
    }

    /// Predict `dt` hours forward and fold in `observation`.
    pub fn update(&mut self, observation: &DVector<f64>, dt: f64) -> Result<()> {
        let n = self.n;
        let m = n + 2;
        self.expire_relaxations(self.elapsed + dt);
        let (state_pred, covariance_pred) = self.predict(dt);
        let Innovation {
            innovation,
            residual_covariance,
        } = self.innovation(observation, &state_pred, &covariance_pred)?;

        // Sᵀ Kᵀ = H P
        let hp = covariance_pred.rows(0, n).into_owned();
        let gain_t = residual_covariance
            .transpose()
            .lu()
            .solve(&hp)
            .ok_or_else(|| {
                EstimationError::NumericalInstability("residual covariance is singular".into())
            })?;
        let gain = gain_t.transpose();
        if !all_finite(gain.iter()) {
            return Err(EstimationError::NumericalInstability(
                "Kalman gain is not finite".into(),
            ));
        }

        let state = &state_pred + &gain * innovation;
        let mut kh = DMatrix::<f64>::zeros(m, m);
        kh.columns_mut(0, n).copy_from(&gain);
        let covariance = (DMatrix::<f64>::identity(m, m) - kh) * covariance_pred;
        if !all_finite(state.iter()) || !all_finite(covariance.iter()) {
            return Err(EstimationError::NumericalInstability(
                "updated state or covariance is not finite".into(),
            ));
        }

        self.state = state;
        self.covariance = covariance;
        self.elapsed += dt;
        Ok(())
    }

    /// Absorb a known, non-growth jump in OD.
    ///
    /// Observation noise is multiplied by `factor` for `seconds`; OD process noise
    /// becomes `dilution_od_process_variance * |OD|` with no coupling to rate or
    /// acceleration for `2.5 * seconds`; the state covariance is decoupled the same
    /// way. Calling again before expiry re-applies on top of the baseline captured
    /// by the first call and pushes the deadlines out.
    pub fn scale_noise_temporarily(&mut self, factor: f64, seconds: f64) {
        let n = self.n;
        let window = util::hours(seconds.max(0.0));

        let record = self.shock.get_or_insert_with(|| ShockRecord {
            observation_baseline: None,
            observation_deadline: 0.0,
            process_baseline: None,
            process_deadline: 0.0,
        });
        let base_r = record
            .observation_baseline
            .get_or_insert_with(|| self.observation_noise.clone())
            .clone();
        let base_q = record
            .process_baseline
            .get_or_insert_with(|| self.process_noise.clone())
            .clone();
        record.observation_deadline = self.elapsed + window;
        record.process_deadline = self.elapsed + PROCESS_RELAXATION_RATIO * window;

        self.observation_noise = base_r * factor;

        let mut q = base_q;
        for i in 0..n {
            q[(i, i)] = self.dilution_od_process_variance * self.state[i].abs();
            for j in n..n + 2 {
                q[(i, j)] = 0.0;
                q[(j, i)] = 0.0;
                self.covariance[(i, j)] = 0.0;
                self.covariance[(j, i)] = 0.0;
            }
        }
        self.process_noise = q;
        debug!(
            factor,
            seconds,
            at_hours = self.elapsed,
            "absorbing shock"
        );
    }

    fn expire_relaxations(&mut self, now: f64) {
        let Some(record) = self.shock.as_mut() else {
            return;
        };
        if now >= record.observation_deadline {
            if let Some(r) = record.observation_baseline.take() {
                self.observation_noise = r;
                debug!(at_hours = now, "observation noise restored");
            }
        }
        if now >= record.process_deadline {
            if let Some(q) = record.process_baseline.take() {
                self.process_noise = q;
                debug!(at_hours = now, "process noise restored");
            }
        }
        if record.observation_baseline.is_none() && record.process_baseline.is_none() {
            self.shock = None;
        }
    }

    /// Full snapshot of the current state.
    pub fn snapshot(&self, timestamp: Timestamp) -> KalmanFilterOutput {
        KalmanFilterOutput {
            timestamp,
            state: self.state.iter().copied().collect(),
            covariance: self
                .covariance
                .row_iter()
                .map(|row| row.iter().copied().collect())
                .collect(),
        }
    }
}
