//! iPNDM (improved Pseudo Numerical Diffusion Model) solver
//!
//! Fourth-order pseudo-linear multi-step method for the probability-flow ODE.
//! Uses past function evaluations for higher-order accuracy; the first steps
//! warm up with lower orders until the history is long enough.

use burn::prelude::*;

use crate::control::EnsembleControl;
use crate::history::HistoryBuffer;
use crate::model::ScoreModel;
use crate::solver::{
    SolveRequest, SolverKind, StepPosition, StepSolver, analytical_first_step, evaluate,
    multistep_direction,
};

/// iPNDM solver
///
/// One model evaluation per step. The Adams-Bashforth combination of the
/// current and up to `max_order - 1` previous evaluations replaces the
/// single-point derivative of Euler.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpndmSolver;

impl<B: Backend> StepSolver<B> for IpndmSolver {
    fn kind(&self) -> SolverKind {
        SolverKind::Ipndm
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
        let (denoised, d_cur) = if request.options.afs && position.step_idx == 0 {
            let d = analytical_first_step(x_cur.clone(), t_cur);
            (x_cur.clone() - d.clone() * t_cur, d)
        } else {
            evaluate(model, x_cur.clone(), t_cur, request.conditioning)
        };

        let direction = multistep_direction(
            &x_cur,
            denoised,
            d_cur,
            t_cur,
            position,
            history,
            &request.options,
        );

        x_cur + direction * (t_next - t_cur)
    }
}
