//! Learnt per-step control for the noise-ensemble student
//!
//! `sigma = sigmoid(p) * noise_max` bounds each candidate's perturbation.
//! With `noise_damping > 0` the mixing logits are lowered by
//! `noise_damping * sigma²`, so a point that explores further is trusted less.

use burn::module::Param;
use burn::prelude::*;
use burn::tensor::activation::{sigmoid, softmax};
use burn_epd_samplers::{EnsembleControl, EnsemblePredictor, NoiseControl, SolverError};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, DistillError};
use crate::predictor::{AsStepIndex, ParamInit, check_step, step_row};

/// Configuration for [`NoiseEnsemblePredictor`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseEnsemblePredictorConfig {
    pub num_points: usize,
    pub num_steps: usize,
    /// Upper bound of the relative perturbation magnitude
    pub noise_max: f64,
    /// Coupling of perturbation magnitude into the mixing logits (0 disables)
    pub noise_damping: f64,
    pub alpha: f64,
    pub init: ParamInit,
}

impl Default for NoiseEnsemblePredictorConfig {
    fn default() -> Self {
        Self {
            num_points: 4,
            num_steps: 4,
            noise_max: 0.1,
            noise_damping: 1.0,
            alpha: 10.0,
            init: ParamInit::Zeros,
        }
    }
}

impl NoiseEnsemblePredictorConfig {
    pub fn new(num_steps: usize, num_points: usize) -> Self {
        Self {
            num_steps,
            num_points,
            ..Self::default()
        }
    }

    pub fn with_noise_max(mut self, noise_max: f64) -> Self {
        self.noise_max = noise_max;
        self
    }

    pub fn with_noise_damping(mut self, noise_damping: f64) -> Self {
        self.noise_damping = noise_damping;
        self
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_init(mut self, init: ParamInit) -> Self {
        self.init = init;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_steps < 2 {
            return Err(ConfigError::InvalidValue {
                field: "num_steps",
                reason: format!("need at least 2 noise levels, got {}", self.num_steps),
            });
        }
        if self.num_points == 0 {
            return Err(ConfigError::InvalidValue {
                field: "num_points",
                reason: "need at least one candidate point".to_string(),
            });
        }
        for (name, value) in [
            ("noise_max", self.noise_max),
            ("noise_damping", self.noise_damping),
        ] {
            if value.is_nan() || value < 0.0 {
                return Err(ConfigError::NegativeScale { name, value });
            }
        }
        Ok(())
    }

    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<NoiseEnsemblePredictor<B>, ConfigError> {
        self.validate()?;
        let shape = [self.num_steps - 1, self.num_points];
        Ok(NoiseEnsemblePredictor {
            sigma_params: self.init.param(shape, device),
            weight_params: self.init.param(shape, device),
            num_points: self.num_points,
            num_steps: self.num_steps,
            noise_max: self.noise_max,
            noise_damping: self.noise_damping,
            alpha: self.alpha,
        })
    }

    /// Build from existing raw parameters, e.g. a trained checkpoint
    pub fn init_with_params<B: Backend>(
        &self,
        sigma_params: Tensor<B, 2>,
        weight_params: Tensor<B, 2>,
    ) -> Result<NoiseEnsemblePredictor<B>, ConfigError> {
        self.validate()?;
        let expected = [self.num_steps - 1, self.num_points];
        for (field, dims) in [
            ("sigma_params", sigma_params.dims()),
            ("weight_params", weight_params.dims()),
        ] {
            if dims != expected {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: format!("expected shape {:?}, got {:?}", expected, dims),
                });
            }
        }
        Ok(NoiseEnsemblePredictor {
            sigma_params: Param::from_tensor(sigma_params),
            weight_params: Param::from_tensor(weight_params),
            num_points: self.num_points,
            num_steps: self.num_steps,
            noise_max: self.noise_max,
            noise_damping: self.noise_damping,
            alpha: self.alpha,
        })
    }
}

/// Predicts perturbation magnitudes and mixing weights per step
#[derive(Module, Debug)]
pub struct NoiseEnsemblePredictor<B: Backend> {
    sigma_params: Param<Tensor<B, 2>>,
    weight_params: Param<Tensor<B, 2>>,
    num_points: usize,
    num_steps: usize,
    noise_max: f64,
    noise_damping: f64,
    alpha: f64,
}

impl<B: Backend> NoiseEnsemblePredictor<B> {
    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    /// Control for one step; `step` may be an integer or a one-element tensor
    pub fn forward<S: AsStepIndex>(
        &self,
        batch_size: usize,
        step: S,
    ) -> Result<NoiseControl<B>, DistillError> {
        let step_idx = step.step_index().ok_or(DistillError::InvalidStepIndex)?;
        Ok(self.control_at(batch_size, step_idx)?)
    }

    fn control_at(&self, batch_size: usize, step_idx: usize) -> Result<NoiseControl<B>, SolverError> {
        check_step(step_idx, self.num_steps)?;

        let sigma = sigmoid(step_row(&self.sigma_params, step_idx, batch_size)) * self.noise_max;
        let mut logits = step_row(&self.weight_params, step_idx, batch_size);
        if self.noise_damping > 0.0 {
            logits = logits - sigma.clone().powf_scalar(2.0) * self.noise_damping;
        }

        Ok(NoiseControl {
            sigma,
            weight: softmax(logits, 1),
        })
    }
}

impl<B: Backend> EnsemblePredictor<B> for NoiseEnsemblePredictor<B> {
    fn num_points(&self) -> usize {
        self.num_points
    }

    fn alpha(&self) -> f64 {
        self.alpha
    }

    fn predict(&self, batch_size: usize, step_idx: usize) -> Result<EnsembleControl<B>, SolverError> {
        self.control_at(batch_size, step_idx).map(EnsembleControl::Noise)
    }
}
