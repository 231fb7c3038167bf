//! DPM-Solver family
//!
//! - [`Dpm2Solver`]: DPM-Solver-2, a single-step second-order method that
//!   evaluates the model once more at the log-sigma midpoint.
//! - [`DpmPlusPlus2mSolver`]: DPM-Solver++(2M), a multistep data-prediction
//!   method that reuses the previous denoised estimate from the history.
//!
//! Both use the k-diffusion formulation (t = -log sigma).

use burn::prelude::*;

use crate::control::EnsembleControl;
use crate::history::HistoryBuffer;
use crate::model::ScoreModel;
use crate::solver::{
    SolveRequest, SolverKind, StepPosition, StepSolver, analytical_first_step, evaluate,
};

/// DPM-Solver-2 (midpoint)
#[derive(Debug, Clone, Copy, Default)]
pub struct Dpm2Solver;

impl<B: Backend> StepSolver<B> for Dpm2Solver {
    fn kind(&self) -> SolverKind {
        SolverKind::Dpm
    }

    fn step(
        &self,
        model: &dyn ScoreModel<B>,
        x_cur: Tensor<B, 4>,
        t_cur: f32,
        t_next: f32,
        position: StepPosition,
        _control: Option<&EnsembleControl<B>>,
        _history: &mut HistoryBuffer<B>,
        request: &SolveRequest<'_, B>,
    ) -> Tensor<B, 4> {
        let d_cur = if request.options.afs && position.step_idx == 0 {
            analytical_first_step(x_cur.clone(), t_cur)
        } else {
            evaluate(model, x_cur.clone(), t_cur, request.conditioning).1
        };

        if t_next <= 0.0 {
            return x_cur.clone() + d_cur * (t_next - t_cur);
        }

        // Midpoint in log-sigma: t_mid = sqrt(t_cur * t_next)
        let t_mid = (t_cur * t_next).sqrt();
        let x_mid = x_cur.clone() + d_cur * (t_mid - t_cur);
        let (_, d_mid) = evaluate(model, x_mid, t_mid, request.conditioning);

        x_cur + d_mid * (t_next - t_cur)
    }
}

/// DPM-Solver++ 2M (second-order multistep)
///
/// The history holds previous denoised estimates regardless of
/// `predict_x0`, since the update is written in data-prediction form.
#[derive(Debug, Clone, Copy, Default)]
pub struct DpmPlusPlus2mSolver;

impl<B: Backend> StepSolver<B> for DpmPlusPlus2mSolver {
    fn kind(&self) -> SolverKind {
        SolverKind::Dpmpp
    }

    fn step(
        &self,
        model: &dyn ScoreModel<B>,
        x_cur: Tensor<B, 4>,
        t_cur: f32,
        t_next: f32,
        position: StepPosition,
        _control: Option<&EnsembleControl<B>>,
        history: &mut HistoryBuffer<B>,
        request: &SolveRequest<'_, B>,
    ) -> Tensor<B, 4> {
        let denoised = if request.options.afs && position.step_idx == 0 {
            x_cur.clone() - analytical_first_step(x_cur.clone(), t_cur) * t_cur
        } else {
            evaluate(model, x_cur.clone(), t_cur, request.conditioning).0
        };

        // t = -log(sigma) in k-diffusion notation
        let lambda = -(t_cur.ln());
        let lambda_next = if t_next > 0.0 {
            -(t_next.ln())
        } else {
            f32::INFINITY
        };
        let h = lambda_next - lambda;
        let sigma_ratio = t_next / t_cur;
        // -expm1(-h) = 1 - exp(-h)
        let one_minus_exp = 1.0 - (-h).exp();

        let order = request.options.order(history.len() + 1, position);
        let previous = history.latest().map(|(d, t)| (d.clone(), t));

        let denoised_d = match previous {
            Some((prev_denoised, prev_sigma)) if order >= 2 && t_next > 0.0 => {
                let h_prev = lambda + prev_sigma.ln();
                let r = h_prev / h;
                // denoised_d = (1 + 1/(2r)) * denoised - (1/(2r)) * old_denoised
                let coeff = 1.0 / (2.0 * r);
                denoised.clone() * (1.0 + coeff) - prev_denoised * coeff
            }
            _ => denoised.clone(),
        };

        history.push(denoised, t_cur, request.options.max_order);
        x_cur * sigma_ratio + denoised_d * one_minus_exp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Conditioning, GaussianDenoiser};
    use crate::solver::SolverOptions;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn karras(n: usize) -> Vec<f32> {
        let (min, max, rho) = (0.002f32, 80.0f32, 7.0f32);
        (0..n)
            .map(|i| {
                let ramp = i as f32 / (n - 1) as f32;
                (max.powf(1.0 / rho) + ramp * (min.powf(1.0 / rho) - max.powf(1.0 / rho)))
                    .powf(rho)
            })
            .collect()
    }

    fn final_value(solver: &dyn StepSolver<TestBackend>, sigmas: &[f32]) -> f32 {
        let device = Default::default();
        let model = GaussianDenoiser::new(0.5);
        let cond = Conditioning::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 1, 1, 1], &device);
        let out = solver
            .solve(
                &model,
                x,
                sigmas,
                SolveRequest::new(&cond, SolverOptions::default()),
            )
            .unwrap();
        out.sample.into_scalar().elem()
    }

    #[test]
    fn test_dpm2_converges_to_exact() {
        let sigmas = karras(40);
        let model = GaussianDenoiser::new(0.5);
        let expected = 80.0 * model.transport(80.0, sigmas[39]);
        let value = final_value(&Dpm2Solver, &sigmas);
        assert!((value - expected).abs() / expected < 2e-2, "{} vs {}", value, expected);
    }

    #[test]
    fn test_dpmpp_uses_history() {
        let device = Default::default();
        let model = GaussianDenoiser::new(0.5);
        let cond = Conditioning::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 1, 1, 1], &device);
        let solver: &dyn StepSolver<TestBackend> = &DpmPlusPlus2mSolver;
        let out = solver
            .solve(
                &model,
                x,
                &karras(6),
                SolveRequest::new(&cond, SolverOptions::default()),
            )
            .unwrap();
        assert_eq!(out.history.len(), 4);
    }

    #[test]
    fn test_dpmpp_converges_to_exact() {
        let sigmas = karras(40);
        let model = GaussianDenoiser::new(0.5);
        let expected = 80.0 * model.transport(80.0, sigmas[39]);
        let value = final_value(&DpmPlusPlus2mSolver, &sigmas);
        assert!((value - expected).abs() / expected < 2e-2, "{} vs {}", value, expected);
    }
}
