//! Human-readable per-step summary
//!
//! ```text
//! Step: 2 | Loss:   0.1234 | w0: 0.5000 | w1: 0.5000 | r0: 0.3000 | r1: 0.7000
//! ```

use std::fmt;

use burn::prelude::*;
use burn_epd_samplers::EnsembleControl;

use crate::objective::per_sample_norm;

/// Label prefix used for each control signal
fn prefix(signal: &'static str) -> &'static str {
    match signal {
        "weight" => "w",
        "ratio" => "r",
        "scale_time" => "st",
        "scale_dir" => "sd",
        "sigma" => "sig",
        other => other,
    }
}

/// Loss summary plus batch means of every control value
#[derive(Debug, Clone, PartialEq)]
pub struct StepDiagnostics {
    pub step: usize,
    /// Batch mean of the per-sample L2 norm of the loss
    pub loss: f32,
    /// `(label prefix, per-point means)` in reporting order
    pub signals: Vec<(&'static str, Vec<f32>)>,
}

impl StepDiagnostics {
    pub fn new<B: Backend>(step: usize, loss: &Tensor<B, 4>, control: &EnsembleControl<B>) -> Self {
        let signals = control
            .signals()
            .into_iter()
            .map(|(name, values)| {
                let means: Vec<f32> = values
                    .clone()
                    .detach()
                    .mean_dim(0)
                    .into_data()
                    .iter::<f32>()
                    .collect();
                (prefix(name), means)
            })
            .collect();
        Self {
            step,
            loss: per_sample_norm(loss),
            signals,
        }
    }

    /// Per-point means of one signal, by label prefix
    pub fn signal(&self, prefix: &str) -> Option<&[f32]> {
        self.signals
            .iter()
            .find(|(p, _)| *p == prefix)
            .map(|(_, v)| v.as_slice())
    }
}

impl fmt::Display for StepDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Step: {} | Loss: {:8.4} ", self.step, self.loss)?;
        for (prefix, means) in &self.signals {
            for (i, mean) in means.iter().enumerate() {
                write!(f, "| {}{}: {:5.4} ", prefix, i, mean)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_epd_samplers::{DirectionControl, NoiseControl};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_direction_line_format() {
        let device = Default::default();
        let control = EnsembleControl::Directions(DirectionControl {
            ratio: Tensor::<TestBackend, 2>::from_floats([[0.2, 0.6], [0.4, 0.8]], &device),
            scale_dir: Some(Tensor::ones([2, 2], &device)),
            scale_time: Some(Tensor::ones([2, 2], &device) * 0.9),
            weight: Tensor::ones([2, 2], &device) * 0.5,
        });
        let loss = Tensor::<TestBackend, 4>::zeros([2, 1, 2, 2], &device);
        let diagnostics = StepDiagnostics::new(3, &loss, &control);
        assert_eq!(
            diagnostics.to_string(),
            "Step: 3 | Loss:   0.0000 | w0: 0.5000 | w1: 0.5000 | r0: 0.3000 | r1: 0.7000 \
             | st0: 0.9000 | st1: 0.9000 | sd0: 1.0000 | sd1: 1.0000 "
        );
        assert_eq!(diagnostics.signal("r").unwrap().len(), 2);
    }

    #[test]
    fn test_noise_line_format() {
        let device = Default::default();
        let control = EnsembleControl::Noise(NoiseControl {
            sigma: Tensor::<TestBackend, 2>::ones([1, 1], &device) * 0.05,
            weight: Tensor::ones([1, 1], &device),
        });
        let loss = Tensor::<TestBackend, 4>::ones([1, 1, 2, 2], &device);
        let line = StepDiagnostics::new(0, &loss, &control).to_string();
        assert_eq!(line, "Step: 0 | Loss:   2.0000 | w0: 1.0000 | sig0: 0.0500 ");
    }
}
