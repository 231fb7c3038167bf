//! Ensemble Parallel Directions (EPD) solver
//!
//! Each step combines several candidate directions instead of following a
//! fixed integration rule. For candidate `j` the solver:
//!
//! 1. places an intermediate noise level between `t_cur` and `t_next` by the
//!    learnt ratio `r_j` (geometric interpolation,
//!    `t_j = t_next^r_j * t_cur^(1 - r_j)`),
//! 2. moves there along the multistep lead direction,
//! 3. evaluates the model at `t_j`, optionally rescaled by `scale_time_j`,
//! 4. contributes its derivative weighted by `weight_j * scale_dir_j`.
//!
//! The candidates are independent, so the parallel variant stacks them into
//! one batched model call.

use burn::prelude::*;

use crate::control::{DirectionControl, EnsembleControl, point};
use crate::history::HistoryBuffer;
use crate::model::ScoreModel;
use crate::solver::{
    SolveRequest, SolverKind, StepPosition, StepSolver, analytical_first_step, evaluate,
    multistep_direction, per_sample, sigma_batch,
};

/// EPD solver
#[derive(Debug, Clone, Copy)]
pub struct EpdSolver {
    parallel: bool,
}

impl EpdSolver {
    /// Evaluate candidates one after another
    pub fn sequential() -> Self {
        Self { parallel: false }
    }

    /// Evaluate all candidates in a single batched call
    pub fn parallel() -> Self {
        Self { parallel: true }
    }
}

/// A candidate point before its model evaluation
struct Candidate<B: Backend> {
    x: Tensor<B, 4>,
    /// Noise level the candidate sits at, `[batch]`
    t: Tensor<B, 1>,
    /// Noise level the model is queried at, `[batch]`
    t_eval: Tensor<B, 1>,
}

fn candidates<B: Backend>(
    x_cur: &Tensor<B, 4>,
    lead: &Tensor<B, 4>,
    t_cur: f32,
    t_next: f32,
    control: &DirectionControl<B>,
) -> Vec<Candidate<B>> {
    let [batch, num_points] = control.ratio.dims();
    let device = x_cur.device();
    let t_cur_b = sigma_batch::<B>(t_cur, batch, &device);

    (0..num_points)
        .map(|j| {
            let r = point(&control.ratio, j);
            let t = if t_next > 0.0 {
                // exp(r * ln t_next + (1 - r) * ln t_cur)
                (r * (t_next.ln() - t_cur.ln()) + t_cur.ln()).exp()
            } else {
                (r.neg() + 1.0) * t_cur
            };
            let x = x_cur.clone() + lead.clone() * per_sample(t.clone() - t_cur_b.clone());
            let t_eval = match &control.scale_time {
                Some(st) => t.clone() * point(st, j),
                None => t.clone(),
            };
            Candidate { x, t, t_eval }
        })
        .collect()
}

impl EpdSolver {
    fn evaluate_candidates<B: Backend>(
        &self,
        model: &dyn ScoreModel<B>,
        candidates: Vec<Candidate<B>>,
        request: &SolveRequest<'_, B>,
    ) -> Vec<Tensor<B, 4>> {
        let derivative = |c: &Candidate<B>, denoised: Tensor<B, 4>| {
            (c.x.clone() - denoised) / per_sample(c.t.clone())
        };

        if !self.parallel || candidates.len() == 1 {
            return candidates
                .iter()
                .map(|c| {
                    let denoised = model.denoise(c.x.clone(), c.t_eval.clone(), request.conditioning);
                    derivative(c, denoised)
                })
                .collect();
        }

        let n = candidates.len();
        let xs = Tensor::cat(candidates.iter().map(|c| c.x.clone()).collect(), 0);
        let ts = Tensor::cat(candidates.iter().map(|c| c.t_eval.clone()).collect(), 0);
        let conditioning = request.conditioning.repeat(n);
        let denoised = model.denoise(xs, ts, &conditioning);

        denoised
            .chunk(n, 0)
            .into_iter()
            .zip(candidates.iter())
            .map(|(d, c)| derivative(c, d))
            .collect()
    }
}

impl<B: Backend> StepSolver<B> for EpdSolver {
    fn kind(&self) -> SolverKind {
        if self.parallel {
            SolverKind::EpdParallel
        } else {
            SolverKind::Epd
        }
    }

    fn step(
        &self,
        model: &dyn ScoreModel<B>,
        x_cur: Tensor<B, 4>,
        t_cur: f32,
        t_next: f32,
        position: StepPosition,
        control: Option<&EnsembleControl<B>>,
        history: &mut HistoryBuffer<B>,
        request: &SolveRequest<'_, B>,
    ) -> Tensor<B, 4> {
        let (denoised, d_cur) = if request.options.afs && position.step_idx == 0 {
            let d = analytical_first_step(x_cur.clone(), t_cur);
            (x_cur.clone() - d.clone() * t_cur, d)
        } else {
            evaluate(model, x_cur.clone(), t_cur, request.conditioning)
        };

        let lead = multistep_direction(
            &x_cur,
            denoised,
            d_cur,
            t_cur,
            position,
            history,
            &request.options,
        );

        // `solve` only calls an EPD step with direction control
        let Some(EnsembleControl::Directions(control)) = control else {
            return x_cur + lead * (t_next - t_cur);
        };

        let points = candidates(&x_cur, &lead, t_cur, t_next, control);
        let derivatives = self.evaluate_candidates(model, points, request);

        let update = derivatives
            .into_iter()
            .enumerate()
            .map(|(j, d)| {
                let mut coeff = point(&control.weight, j);
                if let Some(sd) = &control.scale_dir {
                    coeff = coeff * point(sd, j);
                }
                d * per_sample(coeff)
            })
            .reduce(|acc, term| acc + term)
            .unwrap_or(lead);

        x_cur + update * (t_next - t_cur)
    }
}
