//! Perceptual distance for the terminal step
//!
//! Both inputs are 8-bit range images (`[0, 255]`). The distance is one
//! scalar per sample so that gradients flow back into each student image.

use burn::prelude::*;
use burn::tensor::module::adaptive_avg_pool2d;

/// Per-sample distance between student and teacher images
pub trait PerceptualScorer<B: Backend> {
    /// Returns a `[batch]` tensor
    fn distance(&self, student: Tensor<B, 4>, teacher: Tensor<B, 4>) -> Tensor<B, 1>;
}

/// Maps images to feature vectors, `[batch, C, H, W] -> [batch, features]`
pub trait FeatureExtractor<B: Backend> {
    fn features(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

/// Per-sample mean squared distance between extracted features
///
/// Teacher features are detached; only the student side carries gradients.
#[derive(Debug, Clone)]
pub struct FeatureMseScorer<F> {
    extractor: F,
}

impl<F> FeatureMseScorer<F> {
    pub fn new(extractor: F) -> Self {
        Self { extractor }
    }
}

impl<B: Backend, F: FeatureExtractor<B>> PerceptualScorer<B> for FeatureMseScorer<F> {
    fn distance(&self, student: Tensor<B, 4>, teacher: Tensor<B, 4>) -> Tensor<B, 1> {
        let [batch, _, _, _] = student.dims();
        let student = self.extractor.features(student);
        let teacher = self.extractor.features(teacher.detach()).detach();
        (student - teacher)
            .powf_scalar(2.0)
            .mean_dim(1)
            .reshape([batch])
    }
}

/// Average-pooled pixel features
///
/// Images are scaled to `[0, 1]` and pooled to `size x size` per channel.
/// Useful when no learnt feature network is at hand.
#[derive(Debug, Clone, Copy)]
pub struct PooledFeatures {
    pub size: usize,
}

impl Default for PooledFeatures {
    fn default() -> Self {
        Self { size: 8 }
    }
}

impl<B: Backend> FeatureExtractor<B> for PooledFeatures {
    fn features(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let pooled = adaptive_avg_pool2d(images / 255.0, [self.size, self.size]);
        pooled.flatten(1, 3)
    }
}
