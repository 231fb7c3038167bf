//! Euler solver for the probability-flow ODE
//!
//! First order, one model evaluation per step. Mostly useful as a cheap
//! teacher at very fine resolution and as a baseline.

use burn::prelude::*;

use crate::control::EnsembleControl;
use crate::history::HistoryBuffer;
use crate::model::ScoreModel;
use crate::solver::{
    SolveRequest, SolverKind, StepPosition, StepSolver, analytical_first_step, evaluate,
};

/// Euler solver
#[derive(Debug, Clone, Copy, Default)]
pub struct EulerSolver;

impl<B: Backend> StepSolver<B> for EulerSolver {
    fn kind(&self) -> SolverKind {
        SolverKind::Euler
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
        // Euler step: x_next = x + dt * dx/dt, with dx/dt = (x - denoised) / sigma
        let d_cur = if request.options.afs && position.step_idx == 0 {
            analytical_first_step(x_cur.clone(), t_cur)
        } else {
            evaluate(model, x_cur.clone(), t_cur, request.conditioning).1
        };

        x_cur + d_cur * (t_next - t_cur)
    }
}
