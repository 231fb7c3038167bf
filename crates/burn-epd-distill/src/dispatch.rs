//! Single-interval student dispatch
//!
//! The dispatcher does no numerical work of its own. It checks the control
//! a predictor produced, hands one `[t_cur, t_next]` interval to the student
//! solver together with the carried history, and returns a uniform result
//! whatever control family the solver consumed.

use burn::prelude::*;
use burn_epd_samplers::{
    Conditioning, ControlSource, EnsembleControl, HistoryBuffer, ScoreModel, SolveRequest,
    SolverKind, SolverOptions, StepPosition, StepSolver,
};

use crate::error::DistillError;

/// Allowed deviation of a weight row from summing to 1
pub const WEIGHT_SUM_TOLERANCE: f32 = 1e-5;

/// Result of one dispatched interval
pub struct DispatchOutput<B: Backend> {
    pub sample: Tensor<B, 4>,
    pub history: HistoryBuffer<B>,
    /// Control as the solver consumed it
    pub control: EnsembleControl<B>,
}

/// Runs the student solver one interval at a time
pub struct StepDispatcher<B: Backend> {
    solver: Box<dyn StepSolver<B>>,
    options: SolverOptions,
}

impl<B: Backend> StepDispatcher<B> {
    pub fn new(kind: SolverKind, options: SolverOptions) -> Self {
        Self {
            solver: kind.build(),
            options,
        }
    }

    pub fn kind(&self) -> SolverKind {
        self.solver.kind()
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// Check shape and range of every control signal
    pub fn validate_control(
        &self,
        control: &EnsembleControl<B>,
        batch_size: usize,
        num_points: usize,
    ) -> Result<(), DistillError> {
        if let Some(expected) = self.kind().control_kind() {
            if control.kind() != expected {
                return Err(DistillError::ControlMismatch {
                    solver: self.kind(),
                    expected,
                    actual: control.kind(),
                });
            }
        }

        for (name, signal) in control.signals() {
            let dims = signal.dims();
            if dims != [batch_size, num_points] {
                return Err(DistillError::ShapeMismatch {
                    what: name,
                    expected: vec![batch_size, num_points],
                    actual: dims.to_vec(),
                });
            }
            let values: Vec<f32> = signal
                .clone()
                .detach()
                .into_data()
                .iter::<f32>()
                .collect();
            for (i, &value) in values.iter().enumerate() {
                let point = i % num_points;
                let reason = match name {
                    "weight" | "ratio" if !(0.0..=1.0).contains(&value) => Some("outside [0, 1]"),
                    "scale_dir" | "scale_time" | "sigma" if !(value >= 0.0 && value.is_finite()) => {
                        Some("must be finite and non-negative")
                    }
                    _ if !value.is_finite() => Some("not finite"),
                    _ => None,
                };
                if let Some(reason) = reason {
                    return Err(DistillError::ControlOutOfRange {
                        signal: name,
                        point,
                        value,
                        reason,
                    });
                }
            }
            if name == "weight" {
                for row in values.chunks(num_points) {
                    let sum: f32 = row.iter().sum();
                    if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
                        return Err(DistillError::ControlOutOfRange {
                            signal: name,
                            point: 0,
                            value: sum,
                            reason: "weights must sum to 1",
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Advance `x_unit * t_cur` to `t_next`
    ///
    /// `x_unit` is the current sample divided by `t_cur`.
    #[allow(clippy::too_many_arguments)]
    pub fn dispatch(
        &self,
        model: &dyn ScoreModel<B>,
        x_unit: Tensor<B, 4>,
        t_cur: f32,
        t_next: f32,
        position: StepPosition,
        control: EnsembleControl<B>,
        history: HistoryBuffer<B>,
        conditioning: &Conditioning<B>,
    ) -> Result<DispatchOutput<B>, DistillError> {
        let batch_size = x_unit.dims()[0];
        self.validate_control(&control, batch_size, control.num_points())?;

        let request = SolveRequest::new(conditioning, self.options)
            .with_control(ControlSource::Fixed(control.clone()))
            .with_history(history)
            .with_position(position);
        let out = self
            .solver
            .solve(model, x_unit, &[t_cur, t_next], request)?;

        Ok(DispatchOutput {
            sample: out.sample,
            history: out.history,
            control: out.control.unwrap_or(control),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_epd_samplers::{DirectionControl, GaussianDenoiser, NoiseControl};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn directions(weight: [[f32; 2]; 1], ratio: [[f32; 2]; 1]) -> EnsembleControl<TestBackend> {
        let device = Default::default();
        EnsembleControl::Directions(DirectionControl {
            ratio: Tensor::from_floats(ratio, &device),
            scale_dir: None,
            scale_time: None,
            weight: Tensor::from_floats(weight, &device),
        })
    }

    #[test]
    fn test_valid_control_passes() {
        let dispatcher = StepDispatcher::<TestBackend>::new(SolverKind::Epd, SolverOptions::default());
        let control = directions([[0.25, 0.75]], [[0.1, 0.9]]);
        assert!(dispatcher.validate_control(&control, 1, 2).is_ok());
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let dispatcher = StepDispatcher::<TestBackend>::new(SolverKind::Epd, SolverOptions::default());
        let control = directions([[0.5, 0.6]], [[0.1, 0.9]]);
        assert!(matches!(
            dispatcher.validate_control(&control, 1, 2),
            Err(DistillError::ControlOutOfRange { signal: "weight", .. })
        ));
    }

    #[test]
    fn test_ratio_out_of_range() {
        let dispatcher = StepDispatcher::<TestBackend>::new(SolverKind::Epd, SolverOptions::default());
        let control = directions([[0.5, 0.5]], [[0.1, 1.5]]);
        assert!(matches!(
            dispatcher.validate_control(&control, 1, 2),
            Err(DistillError::ControlOutOfRange { signal: "ratio", point: 1, .. })
        ));
    }

    #[test]
    fn test_shape_mismatch() {
        let dispatcher = StepDispatcher::<TestBackend>::new(SolverKind::Epd, SolverOptions::default());
        let control = directions([[0.5, 0.5]], [[0.1, 0.9]]);
        assert!(matches!(
            dispatcher.validate_control(&control, 2, 2),
            Err(DistillError::ShapeMismatch { what: "weight", .. })
        ));
    }

    #[test]
    fn test_control_family_must_match_solver() {
        let device = Default::default();
        let dispatcher =
            StepDispatcher::<TestBackend>::new(SolverKind::NoiseEnsemble, SolverOptions::default());
        let control = directions([[0.5, 0.5]], [[0.1, 0.9]]);
        assert!(matches!(
            dispatcher.validate_control(&control, 1, 2),
            Err(DistillError::ControlMismatch { .. })
        ));

        let noise = EnsembleControl::Noise(NoiseControl {
            sigma: Tensor::<TestBackend, 2>::zeros([1, 2], &device),
            weight: Tensor::ones([1, 2], &device) * 0.5,
        });
        assert!(dispatcher.validate_control(&noise, 1, 2).is_ok());
    }

    #[test]
    fn test_dispatch_returns_consumed_control_and_history() {
        let device = Default::default();
        let model = GaussianDenoiser::new(0.5);
        let dispatcher = StepDispatcher::<TestBackend>::new(SolverKind::Ipndm, SolverOptions::default());
        let x = Tensor::<TestBackend, 4>::ones([1, 1, 2, 2], &device);
        let out = dispatcher
            .dispatch(
                &model,
                x,
                2.0,
                1.0,
                StepPosition {
                    step_idx: 0,
                    num_steps: 3,
                },
                directions([[0.5, 0.5]], [[0.3, 0.7]]),
                HistoryBuffer::new(),
                &Conditioning::default(),
            )
            .unwrap();
        assert_eq!(out.history.len(), 1);
        assert_eq!(out.control.num_points(), 2);
        assert_eq!(out.sample.dims(), [1, 1, 2, 2]);
    }
}
