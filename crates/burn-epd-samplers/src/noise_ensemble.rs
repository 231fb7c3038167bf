//! Noise-perturbed ensemble solver
//!
//! Instead of spreading candidates in time like EPD, every candidate stays
//! at `t_cur` and is pushed off the trajectory by Gaussian noise of relative
//! magnitude `sigma_j`. The derivatives at the perturbed points are mixed by
//! the predicted weights. With all `sigma_j = 0` this is exactly Euler.

use burn::prelude::*;
use burn::tensor::Distribution;

use crate::control::{EnsembleControl, point};
use crate::history::HistoryBuffer;
use crate::model::ScoreModel;
use crate::solver::{
    SolveRequest, SolverKind, StepPosition, StepSolver, analytical_first_step, evaluate,
    per_sample,
};

/// Noise ensemble solver
#[derive(Debug, Clone, Copy, Default)]
pub struct NoiseEnsembleSolver;

impl<B: Backend> StepSolver<B> for NoiseEnsembleSolver {
    fn kind(&self) -> SolverKind {
        SolverKind::NoiseEnsemble
    }

    fn step(
        &self,
        model: &dyn ScoreModel<B>,
        x_cur: Tensor<B, 4>,
        t_cur: f32,
        t_next: f32,
        position: StepPosition,
        control: Option<&EnsembleControl<B>>,
        _history: &mut HistoryBuffer<B>,
        request: &SolveRequest<'_, B>,
    ) -> Tensor<B, 4> {
        let dt = t_next - t_cur;
        let Some(EnsembleControl::Noise(control)) = control else {
            let (_, d) = evaluate(model, x_cur.clone(), t_cur, request.conditioning);
            return x_cur + d * dt;
        };

        // Unperturbed candidates share the analytical first step
        let afs = request.options.afs && position.step_idx == 0;

        let mixed = (0..control.sigma.dims()[1])
            .map(|j| {
                let sigma_j = point(&control.sigma, j);
                let d_j = if afs {
                    analytical_first_step(x_cur.clone(), t_cur)
                } else {
                    let eps = Tensor::random(
                        x_cur.shape(),
                        Distribution::Normal(0.0, 1.0),
                        &x_cur.device(),
                    );
                    let x_j = x_cur.clone() + eps * per_sample(sigma_j * t_cur);
                    evaluate(model, x_j, t_cur, request.conditioning).1
                };
                d_j * per_sample(point(&control.weight, j))
            })
            .reduce(|acc, term| acc + term);

        match mixed {
            Some(d) => x_cur + d * dt,
            None => x_cur,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{ControlSource, NoiseControl};
    use crate::model::{Conditioning, GaussianDenoiser};
    use crate::solver::{SolverError, SolverOptions};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn solve(control: EnsembleControl<TestBackend>) -> Result<f32, SolverError> {
        let device = Default::default();
        let model = GaussianDenoiser::new(1.0);
        let cond = Conditioning::default();
        let solver: &dyn StepSolver<TestBackend> = &NoiseEnsembleSolver;
        let request = SolveRequest::new(&cond, SolverOptions::default())
            .with_control(ControlSource::Fixed(control));
        let x = Tensor::<TestBackend, 4>::ones([1, 1, 1, 1], &device);
        let out = solver.solve(&model, x, &[1.0, 0.5], request)?;
        assert_eq!(out.history.len(), 0);
        Ok(out.sample.into_scalar().elem())
    }

    #[test]
    fn test_zero_noise_reduces_to_euler() {
        let device = Default::default();
        let control = EnsembleControl::Noise(NoiseControl {
            sigma: Tensor::<TestBackend, 2>::zeros([1, 3], &device),
            weight: Tensor::<TestBackend, 2>::ones([1, 3], &device) / 3.0,
        });
        let value = solve(control).unwrap();
        assert!((value - 0.75).abs() < 1e-5);
    }

    #[test]
    fn test_direction_control_is_rejected() {
        let device = Default::default();
        let t = Tensor::<TestBackend, 2>::ones([1, 1], &device);
        let control = EnsembleControl::Directions(crate::control::DirectionControl {
            ratio: t.clone(),
            scale_dir: None,
            scale_time: None,
            weight: t,
        });
        assert!(matches!(
            solve(control),
            Err(SolverError::ControlMismatch { .. })
        ));
    }
}
