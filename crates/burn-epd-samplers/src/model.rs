//! Score model capability consumed by the solvers
//!
//! Solvers only need a denoiser `D(x, sigma)` in the EDM parameterization:
//! the probability-flow ODE derivative is `(x - D(x, sigma)) / sigma`.
//! Latent models additionally expose a decode stage into pixel space.

use burn::prelude::*;

use crate::scheduler::NoiseSchedule;

/// Conditioning inputs forwarded untouched to the score model
#[derive(Debug, Clone)]
pub struct Conditioning<B: Backend> {
    /// One-hot (or embedded) class labels, `[batch, num_classes]`
    pub class_labels: Option<Tensor<B, 2>>,
    /// Text or image context, `[batch, seq, dim]`
    pub condition: Option<Tensor<B, 3>>,
    /// Context for the unconditional branch of guided models
    pub unconditional_condition: Option<Tensor<B, 3>>,
}

impl<B: Backend> Default for Conditioning<B> {
    fn default() -> Self {
        Self {
            class_labels: None,
            condition: None,
            unconditional_condition: None,
        }
    }
}

impl<B: Backend> Conditioning<B> {
    pub fn with_class_labels(mut self, labels: Tensor<B, 2>) -> Self {
        self.class_labels = Some(labels);
        self
    }

    pub fn with_condition(mut self, condition: Tensor<B, 3>) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_unconditional_condition(mut self, condition: Tensor<B, 3>) -> Self {
        self.unconditional_condition = Some(condition);
        self
    }

    /// Tile every input `times` along the batch dimension
    ///
    /// Used when several evaluations are stacked into one batched call.
    pub fn repeat(&self, times: usize) -> Self {
        Self {
            class_labels: self.class_labels.clone().map(|t| t.repeat_dim(0, times)),
            condition: self.condition.clone().map(|t| t.repeat_dim(0, times)),
            unconditional_condition: self
                .unconditional_condition
                .clone()
                .map(|t| t.repeat_dim(0, times)),
        }
    }
}

/// A denoising network usable by the solvers
pub trait ScoreModel<B: Backend> {
    /// Denoised estimate `D(x, sigma)`
    ///
    /// `sigma` holds one noise level per batch element.
    fn denoise(
        &self,
        sample: Tensor<B, 4>,
        sigma: Tensor<B, 1>,
        conditioning: &Conditioning<B>,
    ) -> Tensor<B, 4>;

    /// Decode a latent into pixel space without tracking gradients
    ///
    /// Returns `None` for models that operate directly in pixel space.
    fn decode(&self, _latent: Tensor<B, 4>) -> Option<Tensor<B, 4>> {
        None
    }

    /// Decode a latent into pixel space, keeping the autodiff graph
    fn differentiable_decode(&self, _latent: Tensor<B, 4>) -> Option<Tensor<B, 4>> {
        None
    }

    /// Training noise schedule, needed by the `discrete` schedule type
    fn training_schedule(&self) -> Option<&NoiseSchedule<B>> {
        None
    }
}

/// Exact denoiser for data drawn from `N(0, sigma_data²)`
///
/// `D(x, sigma) = x * sigma_data² / (sigma_data² + sigma²)`. Its ODE has a
/// closed-form solution, `x(sigma) = x(sigma_0) * sqrt((sigma_data² + sigma²) /
/// (sigma_data² + sigma_0²))`, which makes it a convenient reference model.
#[derive(Debug, Clone, Copy)]
pub struct GaussianDenoiser {
    pub sigma_data: f32,
}

impl Default for GaussianDenoiser {
    fn default() -> Self {
        Self { sigma_data: 0.5 }
    }
}

impl GaussianDenoiser {
    pub fn new(sigma_data: f32) -> Self {
        Self { sigma_data }
    }

    /// Exact ODE transport factor from `sigma_from` to `sigma_to`
    pub fn transport(&self, sigma_from: f32, sigma_to: f32) -> f32 {
        let sd2 = self.sigma_data * self.sigma_data;
        ((sd2 + sigma_to * sigma_to) / (sd2 + sigma_from * sigma_from)).sqrt()
    }
}

impl<B: Backend> ScoreModel<B> for GaussianDenoiser {
    fn denoise(
        &self,
        sample: Tensor<B, 4>,
        sigma: Tensor<B, 1>,
        _conditioning: &Conditioning<B>,
    ) -> Tensor<B, 4> {
        let sd2 = self.sigma_data * self.sigma_data;
        let [batch] = sigma.dims();
        let scale = (sigma.powf_scalar(2.0) + sd2).recip() * sd2;
        sample * scale.reshape([batch, 1, 1, 1])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_gaussian_denoiser_shrinks_per_sample() {
        let device = Default::default();
        let model = GaussianDenoiser::new(1.0);
        let x = Tensor::<TestBackend, 4>::ones([2, 1, 2, 2], &device);
        let sigma = Tensor::<TestBackend, 1>::from_floats([0.0, 1.0], &device);
        let out = model.denoise(x, sigma, &Conditioning::default());
        let values: Vec<f32> = out.into_data().to_vec().unwrap();
        assert!(values[..4].iter().all(|v| (v - 1.0).abs() < 1e-6));
        assert!(values[4..].iter().all(|v| (v - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_conditioning_repeat_tiles_batch() {
        let device = Default::default();
        let labels = Tensor::<TestBackend, 2>::ones([2, 10], &device);
        let cond = Conditioning::default().with_class_labels(labels).repeat(3);
        assert_eq!(cond.class_labels.unwrap().dims(), [6, 10]);
        assert!(cond.condition.is_none());
    }

    #[test]
    fn test_pixel_model_has_no_decoder() {
        let device = Default::default();
        let model = GaussianDenoiser::default();
        let x = Tensor::<TestBackend, 4>::zeros([1, 3, 2, 2], &device);
        assert!(ScoreModel::<TestBackend>::decode(&model, x).is_none());
    }
}
