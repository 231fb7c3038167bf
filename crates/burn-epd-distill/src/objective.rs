//! Loss terms of a distillation step

use burn::prelude::*;

use crate::error::DistillError;

/// Unreduced squared error between student and teacher samples
pub fn squared_error<B: Backend>(student: Tensor<B, 4>, teacher: Tensor<B, 4>) -> Tensor<B, 4> {
    (student - teacher).powf_scalar(2.0)
}

/// Map `[-1, 1]` images to clipped 8-bit intensities
pub fn to_uint8_range<B: Backend>(images: Tensor<B, 4>) -> Tensor<B, 4> {
    (images * 127.5 + 128.0).clamp(0.0, 255.0)
}

/// Terminal loss: `alpha * perceptual`, each sample's distance broadcast over
/// that sample's elements of `shape`
///
/// `perceptual` holds one distance per sample, or a single distance shared by
/// the whole batch. The squared error is replaced, not added to.
pub fn terminal_loss<B: Backend>(
    perceptual: Tensor<B, 1>,
    alpha: f64,
    shape: [usize; 4],
) -> Result<Tensor<B, 4>, DistillError> {
    let [b, c, h, w] = shape;
    let per_sample = match perceptual.dims() {
        [n] if n == b => perceptual,
        [1] => perceptual.repeat_dim(0, b),
        [n] => {
            return Err(DistillError::ShapeMismatch {
                what: "perceptual distance",
                expected: vec![b],
                actual: vec![n],
            });
        }
    };
    Ok((per_sample * alpha)
        .reshape([b, 1, 1, 1])
        .repeat_dim(1, c)
        .repeat_dim(2, h)
        .repeat_dim(3, w))
}

/// Mean over the batch of the per-sample L2 norm
pub fn per_sample_norm<B: Backend>(loss: &Tensor<B, 4>) -> f32 {
    loss.clone()
        .detach()
        .flatten::<2>(1, 3)
        .powf_scalar(2.0)
        .sum_dim(1)
        .sqrt()
        .mean()
        .into_scalar()
        .elem()
}
