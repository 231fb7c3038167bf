//! Solver capability table
//!
//! Every solver integrates the probability-flow ODE over a schedule of noise
//! levels. A solver is chosen by name once, at construction time, through
//! [`SolverKind`]; unknown names fail immediately.

use std::fmt;
use std::str::FromStr;

use burn::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::control::{ControlKind, ControlSource, EnsembleControl};
use crate::history::HistoryBuffer;
use crate::model::{Conditioning, ScoreModel};

#[derive(Error, Debug)]
pub enum SolverError {
    #[error("Unknown solver: {0}")]
    UnknownSolver(String),

    #[error("Unknown schedule type: {0}")]
    UnknownSchedule(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Step {step_idx} outside a schedule of {num_steps} noise levels")]
    StepOutOfRange { step_idx: usize, num_steps: usize },

    #[error("Discrete schedule requires the score model's training schedule")]
    MissingTrainingSchedule,

    #[error("Solver {solver} needs {expected} ensemble control")]
    MissingControl {
        solver: SolverKind,
        expected: ControlKind,
    },

    #[error("Solver {solver} needs {expected} ensemble control, got {actual}")]
    ControlMismatch {
        solver: SolverKind,
        expected: ControlKind,
        actual: ControlKind,
    },
}

// ============================================================================
// Solver Kind
// ============================================================================

/// Closed set of available solvers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    /// First-order Euler
    Euler,
    /// EDM second-order Heun
    Heun,
    /// DPM-Solver-2 (single-step midpoint)
    Dpm,
    /// DPM-Solver++ 2M (multistep)
    Dpmpp,
    /// Improved PNDM (multistep, up to fourth order)
    Ipndm,
    /// Ensemble parallel directions
    Epd,
    /// Ensemble parallel directions, candidates evaluated in one batch
    EpdParallel,
    /// Noise-perturbed ensemble
    NoiseEnsemble,
}

impl SolverKind {
    pub const ALL: [SolverKind; 8] = [
        SolverKind::Euler,
        SolverKind::Heun,
        SolverKind::Dpm,
        SolverKind::Dpmpp,
        SolverKind::Ipndm,
        SolverKind::Epd,
        SolverKind::EpdParallel,
        SolverKind::NoiseEnsemble,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SolverKind::Euler => "euler",
            SolverKind::Heun => "heun",
            SolverKind::Dpm => "dpm",
            SolverKind::Dpmpp => "dpmpp",
            SolverKind::Ipndm => "ipndm",
            SolverKind::Epd => "epd",
            SolverKind::EpdParallel => "epd_parallel",
            SolverKind::NoiseEnsemble => "noise_ensemble",
        }
    }

    /// Control family the solver consumes, if any
    pub fn control_kind(self) -> Option<ControlKind> {
        match self {
            SolverKind::Epd | SolverKind::EpdParallel => Some(ControlKind::Directions),
            SolverKind::NoiseEnsemble => Some(ControlKind::Noise),
            _ => None,
        }
    }

    /// Whether the solver reads and writes a [`HistoryBuffer`]
    pub fn uses_history(self) -> bool {
        matches!(
            self,
            SolverKind::Dpmpp | SolverKind::Ipndm | SolverKind::Epd | SolverKind::EpdParallel
        )
    }

    /// Instantiate the solver
    pub fn build<B: Backend>(self) -> Box<dyn StepSolver<B>> {
        match self {
            SolverKind::Euler => Box::new(crate::euler::EulerSolver),
            SolverKind::Heun => Box::new(crate::heun::HeunSolver),
            SolverKind::Dpm => Box::new(crate::dpm::Dpm2Solver),
            SolverKind::Dpmpp => Box::new(crate::dpm::DpmPlusPlus2mSolver),
            SolverKind::Ipndm => Box::new(crate::ipndm::IpndmSolver),
            SolverKind::Epd => Box::new(crate::epd::EpdSolver::sequential()),
            SolverKind::EpdParallel => Box::new(crate::epd::EpdSolver::parallel()),
            SolverKind::NoiseEnsemble => Box::new(crate::noise_ensemble::NoiseEnsembleSolver),
        }
    }
}

impl fmt::Display for SolverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SolverKind {
    type Err = SolverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SolverKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| SolverError::UnknownSolver(s.to_string()))
    }
}

// ============================================================================
// Options and Requests
// ============================================================================

/// Numerical options shared by all solvers
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverOptions {
    /// Multistep history stores data (x0) predictions instead of derivatives
    pub predict_x0: bool,
    /// Maximum multistep order (1-4)
    pub max_order: usize,
    /// Drop to at most second order on the last interval of short schedules
    pub lower_order_final: bool,
    /// Analytical first step: skip the model call at global step 0
    pub afs: bool,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            predict_x0: true,
            max_order: 4,
            lower_order_final: true,
            afs: false,
        }
    }
}

impl SolverOptions {
    /// Schedules shorter than this use a lower order on the final interval
    pub const LOWER_ORDER_FINAL_BELOW: usize = 10;

    /// Effective multistep order for an interval
    pub fn order(&self, available: usize, position: StepPosition) -> usize {
        let order = available.min(self.max_order).max(1);
        if self.lower_order_final
            && position.is_final()
            && position.num_steps < Self::LOWER_ORDER_FINAL_BELOW
        {
            order.min(2)
        } else {
            order
        }
    }
}

/// Location of an interval inside the full (coarse) schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPosition {
    /// Index of the interval's starting noise level
    pub step_idx: usize,
    /// Number of noise levels in the full schedule
    pub num_steps: usize,
}

impl StepPosition {
    /// Whether this is the last interval of the schedule
    pub fn is_final(&self) -> bool {
        self.step_idx + 2 == self.num_steps
    }

    fn offset(self, local: usize) -> Self {
        Self {
            step_idx: self.step_idx + local,
            num_steps: self.num_steps,
        }
    }
}

/// Everything a solver consumes besides the model and the latent
pub struct SolveRequest<'a, B: Backend> {
    pub conditioning: &'a Conditioning<B>,
    pub control: ControlSource<'a, B>,
    pub history: HistoryBuffer<B>,
    pub options: SolverOptions,
    /// Global position of the first interval when solving a sub-schedule;
    /// `None` means the schedule is the full schedule
    pub position: Option<StepPosition>,
    /// Collect every intermediate sample, starting with the initial one
    pub return_trajectory: bool,
}

impl<'a, B: Backend> SolveRequest<'a, B> {
    pub fn new(conditioning: &'a Conditioning<B>, options: SolverOptions) -> Self {
        Self {
            conditioning,
            control: ControlSource::None,
            history: HistoryBuffer::new(),
            options,
            position: None,
            return_trajectory: false,
        }
    }

    pub fn with_control(mut self, control: ControlSource<'a, B>) -> Self {
        self.control = control;
        self
    }

    pub fn with_history(mut self, history: HistoryBuffer<B>) -> Self {
        self.history = history;
        self
    }

    pub fn with_position(mut self, position: StepPosition) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_trajectory(mut self) -> Self {
        self.return_trajectory = true;
        self
    }
}

/// Result of a solver pass
pub struct SolveOutput<B: Backend> {
    /// Sample at the last noise level
    pub sample: Tensor<B, 4>,
    /// Intermediate samples (only when requested)
    pub trajectory: Vec<Tensor<B, 4>>,
    /// History after the last interval
    pub history: HistoryBuffer<B>,
    /// Control applied on the last interval, for diagnostics
    pub control: Option<EnsembleControl<B>>,
}

/// One-interval update rule of a solver
///
/// Implementors only describe a single interval; [`StepSolver::solve`] runs
/// the interval rule over the whole schedule.
pub trait StepSolver<B: Backend> {
    fn kind(&self) -> SolverKind;

    /// Advance `x_cur` from `t_cur` to `t_next`
    #[allow(clippy::too_many_arguments)]
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
    ) -> Tensor<B, 4>;

    /// Integrate over `sigmas`
    ///
    /// `latents` are unit-scaled; they are multiplied by `sigmas[0]` first.
    fn solve(
        &self,
        model: &dyn ScoreModel<B>,
        latents: Tensor<B, 4>,
        sigmas: &[f32],
        mut request: SolveRequest<'_, B>,
    ) -> Result<SolveOutput<B>, SolverError> {
        if sigmas.len() < 2 {
            return Err(SolverError::InvalidSchedule(format!(
                "need at least 2 noise levels, got {}",
                sigmas.len()
            )));
        }
        let kind = self.kind();
        let base = request.position.unwrap_or(StepPosition {
            step_idx: 0,
            num_steps: sigmas.len(),
        });
        let batch_size = latents.dims()[0];
        let mut history = std::mem::take(&mut request.history);

        let mut x_next = latents * sigmas[0];
        let mut trajectory = Vec::new();
        if request.return_trajectory {
            trajectory.push(x_next.clone());
        }

        let mut applied = None;
        for (i, window) in sigmas.windows(2).enumerate() {
            let position = base.offset(i);
            let control = match kind.control_kind() {
                Some(expected) => {
                    let control = request
                        .control
                        .resolve(batch_size, position.step_idx)?
                        .ok_or(SolverError::MissingControl {
                            solver: kind,
                            expected,
                        })?;
                    if control.kind() != expected {
                        return Err(SolverError::ControlMismatch {
                            solver: kind,
                            expected,
                            actual: control.kind(),
                        });
                    }
                    Some(control)
                }
                None => request.control.resolve(batch_size, position.step_idx)?,
            };

            x_next = self.step(
                model,
                x_next,
                window[0],
                window[1],
                position,
                control.as_ref(),
                &mut history,
                &request,
            );
            if request.return_trajectory {
                trajectory.push(x_next.clone());
            }
            applied = control;
        }

        Ok(SolveOutput {
            sample: x_next,
            trajectory,
            history,
            control: applied,
        })
    }
}

// ============================================================================
// Shared Helpers
// ============================================================================

/// One noise level per batch element
pub(crate) fn sigma_batch<B: Backend>(sigma: f32, batch: usize, device: &B::Device) -> Tensor<B, 1> {
    Tensor::ones([batch], device) * sigma
}

/// Broadcast a `[batch]` tensor against `[batch, C, H, W]`
pub(crate) fn per_sample<B: Backend>(values: Tensor<B, 1>) -> Tensor<B, 4> {
    let [batch] = values.dims();
    values.reshape([batch, 1, 1, 1])
}

/// Model evaluation at a scalar noise level: `(denoised, derivative)`
pub(crate) fn evaluate<B: Backend>(
    model: &dyn ScoreModel<B>,
    x: Tensor<B, 4>,
    sigma: f32,
    conditioning: &Conditioning<B>,
) -> (Tensor<B, 4>, Tensor<B, 4>) {
    let batch = x.dims()[0];
    let denoised = model.denoise(x.clone(), sigma_batch(sigma, batch, &x.device()), conditioning);
    let d = (x - denoised.clone()) / sigma;
    (denoised, d)
}

/// Derivative at global step 0 under the analytical first step
pub(crate) fn analytical_first_step<B: Backend>(x: Tensor<B, 4>, sigma: f32) -> Tensor<B, 4> {
    x / (1.0 + sigma * sigma).sqrt()
}

/// Multistep lead derivative at `x_cur`, recording the new evaluation
///
/// The new evaluation is pushed first so the buffer holds at most
/// `max_order` entries. With `predict_x0` the buffer stores data
/// predictions and the combination is converted back into a derivative.
pub(crate) fn multistep_direction<B: Backend>(
    x_cur: &Tensor<B, 4>,
    denoised: Tensor<B, 4>,
    d_cur: Tensor<B, 4>,
    t_cur: f32,
    position: StepPosition,
    history: &mut HistoryBuffer<B>,
    options: &SolverOptions,
) -> Tensor<B, 4> {
    let entry = if options.predict_x0 { denoised } else { d_cur.clone() };
    history.push(entry, t_cur, options.max_order);

    let order = options.order(history.len(), position);
    let coeffs = crate::scheduler::adams_bashforth_coefficients(order);
    match history.combine(&coeffs) {
        Some(combined) if options.predict_x0 => (x_cur.clone() - combined) / t_cur,
        Some(combined) => combined,
        None => d_cur,
    }
}
