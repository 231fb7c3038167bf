//! Noise-level schedules for EDM-style samplers
//!
//! A schedule is an ordered, strictly decreasing sequence of noise levels
//! (sigmas) shared by the teacher and the student solvers. Four spacings are
//! supported; the `discrete` spacing needs the training schedule of the score
//! model to map between sigmas and (continuous) training timesteps.

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use serde::{Deserialize, Serialize};

use crate::solver::SolverError;

// ============================================================================
// Schedule Type
// ============================================================================

/// Spacing of the noise levels between `sigma_max` and `sigma_min`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleType {
    /// EDM polynomial spacing controlled by rho (Karras et al.)
    #[default]
    Polynomial,
    /// Uniform in log-SNR (geometric in sigma)
    Logsnr,
    /// Uniform in VP-SDE time
    TimeUniform,
    /// Polynomial in the model's discrete training timesteps
    Discrete,
}

impl ScheduleType {
    pub fn name(self) -> &'static str {
        match self {
            ScheduleType::Polynomial => "polynomial",
            ScheduleType::Logsnr => "logsnr",
            ScheduleType::TimeUniform => "time_uniform",
            ScheduleType::Discrete => "discrete",
        }
    }
}

impl fmt::Display for ScheduleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ScheduleType {
    type Err = SolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "polynomial" => Ok(ScheduleType::Polynomial),
            "logsnr" => Ok(ScheduleType::Logsnr),
            "time_uniform" => Ok(ScheduleType::TimeUniform),
            "discrete" => Ok(ScheduleType::Discrete),
            other => Err(SolverError::UnknownSchedule(other.to_string())),
        }
    }
}

// ============================================================================
// Schedule
// ============================================================================

/// Parameters that fully determine a schedule
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSpec {
    pub num_steps: usize,
    pub sigma_min: f64,
    pub sigma_max: f64,
    pub schedule_type: ScheduleType,
    pub schedule_rho: f64,
}

/// An ordered, strictly decreasing sequence of noise levels
#[derive(Debug, Clone, PartialEq)]
pub struct Schedule {
    sigmas: Vec<f32>,
}

impl Schedule {
    /// Wrap precomputed sigmas, checking they strictly decrease
    pub fn from_sigmas(sigmas: Vec<f32>) -> Result<Self, SolverError> {
        if sigmas.len() < 2 {
            return Err(SolverError::InvalidSchedule(format!(
                "need at least 2 noise levels, got {}",
                sigmas.len()
            )));
        }
        if let Some(i) = sigmas.iter().position(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(SolverError::InvalidSchedule(format!(
                "noise levels must be finite and positive (index {}: {})",
                i, sigmas[i]
            )));
        }
        if let Some(i) = sigmas.windows(2).position(|w| w[1] >= w[0]) {
            return Err(SolverError::InvalidSchedule(format!(
                "noise levels must strictly decrease (index {}: {} -> {})",
                i,
                sigmas[i],
                sigmas[i + 1]
            )));
        }
        Ok(Self { sigmas })
    }

    pub fn len(&self) -> usize {
        self.sigmas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sigmas.is_empty()
    }

    pub fn sigmas(&self) -> &[f32] {
        &self.sigmas
    }

    pub fn get(&self, idx: usize) -> Option<f32> {
        self.sigmas.get(idx).copied()
    }

    /// `(t_cur, t_next)` for the interval starting at `step_idx`
    pub fn interval(&self, step_idx: usize) -> Option<(f32, f32)> {
        Some((self.get(step_idx)?, self.get(step_idx + 1)?))
    }

    /// First (largest) noise level
    pub fn sigma_max(&self) -> f32 {
        self.sigmas[0]
    }
}

/// Build the schedule described by `spec`
///
/// `training_schedule` is only consulted for [`ScheduleType::Discrete`].
pub fn get_schedule<B: Backend>(
    spec: &ScheduleSpec,
    training_schedule: Option<&NoiseSchedule<B>>,
) -> Result<Schedule, SolverError> {
    let n = spec.num_steps;
    if n < 2 {
        return Err(SolverError::InvalidSchedule(format!(
            "need at least 2 steps, got {}",
            n
        )));
    }
    if !(spec.sigma_min > 0.0 && spec.sigma_min < spec.sigma_max) {
        return Err(SolverError::InvalidSchedule(format!(
            "sigma range must satisfy 0 < sigma_min < sigma_max, got [{}, {}]",
            spec.sigma_min, spec.sigma_max
        )));
    }

    if !(spec.schedule_rho.is_finite() && spec.schedule_rho > 0.0) {
        return Err(SolverError::InvalidSchedule(format!(
            "schedule_rho must be positive, got {}",
            spec.schedule_rho
        )));
    }

    let rho = spec.schedule_rho;
    let ramp = |i: usize| i as f64 / (n - 1) as f64;

    let sigmas: Vec<f64> = match spec.schedule_type {
        ScheduleType::Polynomial => {
            let max_inv_rho = spec.sigma_max.powf(1.0 / rho);
            let min_inv_rho = spec.sigma_min.powf(1.0 / rho);
            (0..n)
                .map(|i| (max_inv_rho + ramp(i) * (min_inv_rho - max_inv_rho)).powf(rho))
                .collect()
        }
        ScheduleType::Logsnr => {
            let log_max = spec.sigma_max.ln();
            let log_min = spec.sigma_min.ln();
            (0..n)
                .map(|i| (log_max + ramp(i) * (log_min - log_max)).exp())
                .collect()
        }
        ScheduleType::TimeUniform => {
            let vp = VpSchedule::fit(spec.sigma_min, spec.sigma_max);
            (0..n)
                .map(|i| {
                    let t = (1.0 + ramp(i) * (VpSchedule::EPS_S.powf(1.0 / rho) - 1.0)).powf(rho);
                    vp.sigma(t)
                })
                .collect()
        }
        ScheduleType::Discrete => {
            let table = training_schedule.ok_or(SolverError::MissingTrainingSchedule)?;
            let table = DiscreteSigmas::from_schedule(table);
            let t_max = table.sigma_inv(spec.sigma_max);
            let t_min = table.sigma_inv(spec.sigma_min);
            let max_inv_rho = t_max.powf(1.0 / rho);
            let min_inv_rho = t_min.powf(1.0 / rho);
            (0..n)
                .map(|i| table.sigma((max_inv_rho + ramp(i) * (min_inv_rho - max_inv_rho)).powf(rho)))
                .collect()
        }
    };

    tracing::debug!(
        schedule = %spec.schedule_type,
        num_steps = n,
        sigma_max = sigmas[0],
        sigma_min = sigmas[n - 1],
        "built noise schedule"
    );

    Schedule::from_sigmas(sigmas.into_iter().map(|s| s as f32).collect())
}

/// Variance-preserving schedule fitted to a sigma range
struct VpSchedule {
    beta_d: f64,
    beta_min: f64,
}

impl VpSchedule {
    const EPS_S: f64 = 1e-3;

    fn fit(sigma_min: f64, sigma_max: f64) -> Self {
        let log_min = (sigma_min.powi(2) + 1.0).ln();
        let log_max = (sigma_max.powi(2) + 1.0).ln();
        let beta_d = 2.0 * (log_min / Self::EPS_S - log_max) / (Self::EPS_S - 1.0);
        let beta_min = log_max - 0.5 * beta_d;
        Self { beta_d, beta_min }
    }

    fn sigma(&self, t: f64) -> f64 {
        ((0.5 * self.beta_d * t * t + self.beta_min * t).exp() - 1.0).sqrt()
    }
}

// ============================================================================
// Training Noise Schedule
// ============================================================================

/// Precomputed noise schedule of a discrete-time model
pub struct NoiseSchedule<B: Backend> {
    /// Cumulative product of alphas: ᾱₜ
    pub alphas_cumprod: Tensor<B, 1>,
    /// Number of training steps
    pub num_train_steps: usize,
}

impl<B: Backend> NoiseSchedule<B> {
    /// Latent diffusion schedule (scaled-linear betas, 1000 steps)
    pub fn ldm(device: &B::Device) -> Self {
        let n = 1000;
        let start = 0.00085f64.sqrt();
        let end = 0.012f64.sqrt();
        let mut alphas_cumprod = Vec::with_capacity(n);
        let mut cumprod = 1.0f64;
        for i in 0..n {
            let t = i as f64 / (n - 1) as f64;
            let beta = (start + t * (end - start)).powi(2);
            cumprod *= 1.0 - beta;
            alphas_cumprod.push(cumprod as f32);
        }
        let data = TensorData::new(alphas_cumprod, [n]);
        Self {
            alphas_cumprod: Tensor::from_data(data, device),
            num_train_steps: n,
        }
    }

    /// Sigma at every training timestep: sqrt((1 - ᾱ) / ᾱ)
    pub fn sigmas(&self) -> Vec<f32> {
        let alphas = self.alphas_cumprod.clone().into_data();
        alphas
            .iter::<f32>()
            .map(|alpha| ((1.0 - alpha) / alpha).sqrt())
            .collect()
    }
}

/// Sigma lookup table with linear interpolation in log-sigma
struct DiscreteSigmas {
    log_sigmas: Vec<f64>,
}

impl DiscreteSigmas {
    fn from_schedule<B: Backend>(schedule: &NoiseSchedule<B>) -> Self {
        Self {
            log_sigmas: schedule.sigmas().iter().map(|&s| (s as f64).ln()).collect(),
        }
    }

    /// Sigma at a continuous timestep
    fn sigma(&self, t: f64) -> f64 {
        let last = self.log_sigmas.len() - 1;
        let t = t.clamp(0.0, last as f64);
        let low = t.floor() as usize;
        let high = (low + 1).min(last);
        let frac = t - low as f64;
        ((1.0 - frac) * self.log_sigmas[low] + frac * self.log_sigmas[high]).exp()
    }

    /// Continuous timestep for a sigma (inverse of [`Self::sigma`])
    fn sigma_inv(&self, sigma: f64) -> f64 {
        let log_sigma = sigma.ln();
        let last = self.log_sigmas.len() - 1;
        if log_sigma <= self.log_sigmas[0] {
            return 0.0;
        }
        if log_sigma >= self.log_sigmas[last] {
            return last as f64;
        }
        let high = self.log_sigmas.partition_point(|&s| s < log_sigma);
        let low = high - 1;
        let span = self.log_sigmas[high] - self.log_sigmas[low];
        low as f64 + (log_sigma - self.log_sigmas[low]) / span
    }
}

// ============================================================================
// Shared Utilities
// ============================================================================

/// Adams-Bashforth coefficients for linear multi-step methods, newest first
pub fn adams_bashforth_coefficients(order: usize) -> Vec<f32> {
    match order {
        1 => vec![1.0],
        2 => vec![1.5, -0.5],
        3 => vec![23.0 / 12.0, -16.0 / 12.0, 5.0 / 12.0],
        4 => vec![55.0 / 24.0, -59.0 / 24.0, 37.0 / 24.0, -9.0 / 24.0],
        _ => vec![1.0], // Fallback to first order
    }
}
