//! Heun solver implementation
//!
//! Heun's method is a second-order Runge-Kutta method that provides
//! better accuracy than Euler at the cost of two function evaluations per step.
//! It is the default fine-grained teacher.

use burn::prelude::*;

use crate::control::EnsembleControl;
use crate::history::HistoryBuffer;
use crate::model::ScoreModel;
use crate::solver::{
    SolveRequest, SolverKind, StepPosition, StepSolver, analytical_first_step, evaluate,
};

/// Heun solver (second-order)
///
/// Uses Heun's method (improved Euler / modified trapezoidal) for
/// solving the probability flow ODE.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeunSolver;

impl<B: Backend> StepSolver<B> for HeunSolver {
    fn kind(&self) -> SolverKind {
        SolverKind::Heun
    }

    /// Perform one Heun step
    ///
    /// 1. Compute initial derivative d1 = (x - D(x, t)) / t
    /// 2. Compute Euler step: x_euler = x + dt * d1
    /// 3. Compute derivative at new point: d2 = (x_euler - D(x_euler, t_next)) / t_next
    /// 4. Combine: x_next = x + dt * (d1 + d2) / 2
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
        let dt = t_next - t_cur;

        let d1 = if request.options.afs && position.step_idx == 0 {
            analytical_first_step(x_cur.clone(), t_cur)
        } else {
            evaluate(model, x_cur.clone(), t_cur, request.conditioning).1
        };
        let x_euler = x_cur.clone() + d1.clone() * dt;

        if t_next <= 0.0 {
            // Fall back to Euler when the target is noise-free
            return x_euler;
        }

        let (_, d2) = evaluate(model, x_euler, t_next, request.conditioning);
        x_cur + (d1 + d2) * (dt / 2.0)
    }
}
