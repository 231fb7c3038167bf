//! Learnt per-step control for the EPD student
//!
//! One row of raw parameters per student step, one column per candidate
//! point. Activations map them into the ranges the solver expects:
//!
//! ```text
//! weight = softmax(w)                     rows sum to 1
//! ratio  = sigmoid(r)                     in (0, 1)
//! scale  = 2 * sigmoid(p / 2) * s + 1 - s in (1 - s, 1 + s)
//! ```
//!
//! Scales are only emitted when their bound `s` is non-zero.

use burn::module::Param;
use burn::prelude::*;
use burn::tensor::Distribution;
use burn::tensor::activation::{sigmoid, softmax};
use burn_epd_samplers::{
    DirectionControl, EnsembleControl, EnsemblePredictor, SolverError, SolverKind,
};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, DistillError};

/// Students an EPD predictor can drive
pub const STUDENT_SOLVERS: &[SolverKind] = &[SolverKind::Epd, SolverKind::Ipndm];

/// Teachers an EPD predictor can be distilled from
pub const TEACHER_SOLVERS: &[SolverKind] = &[
    SolverKind::Heun,
    SolverKind::Dpm,
    SolverKind::Dpmpp,
    SolverKind::Euler,
    SolverKind::Ipndm,
];

/// Initial values of the raw per-step parameters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamInit {
    /// Standard normal
    #[default]
    Normal,
    /// All zeros (uniform weights, centred ratios and scales)
    Zeros,
}

impl ParamInit {
    pub(crate) fn param<B: Backend>(self, shape: [usize; 2], device: &B::Device) -> Param<Tensor<B, 2>> {
        let tensor = match self {
            ParamInit::Normal => Tensor::random(shape, Distribution::Normal(0.0, 1.0), device),
            ParamInit::Zeros => Tensor::zeros(shape, device),
        };
        Param::from_tensor(tensor)
    }
}

/// A step index given either as an integer or as a one-element tensor
pub trait AsStepIndex {
    /// `None` unless the value is a single non-negative integer
    fn step_index(&self) -> Option<usize>;
}

impl AsStepIndex for usize {
    fn step_index(&self) -> Option<usize> {
        Some(*self)
    }
}

impl<B: Backend> AsStepIndex for Tensor<B, 1, Int> {
    fn step_index(&self) -> Option<usize> {
        let data = self.clone().into_data();
        let mut values = data.iter::<i64>();
        let first = values.next()?;
        if values.next().is_some() {
            return None;
        }
        usize::try_from(first).ok()
    }
}

/// Parameter row for `step_idx`, repeated for every batch element
pub(crate) fn step_row<B: Backend>(
    param: &Param<Tensor<B, 2>>,
    step_idx: usize,
    batch_size: usize,
) -> Tensor<B, 2> {
    let [_, num_points] = param.val().dims();
    param
        .val()
        .slice([step_idx..step_idx + 1, 0..num_points])
        .repeat_dim(0, batch_size)
}

pub(crate) fn check_step(step_idx: usize, num_steps: usize) -> Result<(), SolverError> {
    if step_idx + 1 < num_steps {
        Ok(())
    } else {
        Err(SolverError::StepOutOfRange {
            step_idx,
            num_steps,
        })
    }
}

/// Configuration for [`EpdPredictor`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpdPredictorConfig {
    /// Candidate points per step
    pub num_points: usize,
    /// Noise levels in the student schedule
    pub num_steps: usize,
    pub student: SolverKind,
    pub teacher: SolverKind,
    /// Bound of the direction scale around 1 (0 disables it)
    pub scale_dir: f64,
    /// Bound of the time scale around 1 (0 disables it)
    pub scale_time: f64,
    /// Weight of the terminal perceptual loss
    pub alpha: f64,
    pub init: ParamInit,
}

impl Default for EpdPredictorConfig {
    fn default() -> Self {
        Self {
            num_points: 2,
            num_steps: 4,
            student: SolverKind::Epd,
            teacher: SolverKind::Heun,
            scale_dir: 0.0,
            scale_time: 0.0,
            alpha: 10.0,
            init: ParamInit::Normal,
        }
    }
}

impl EpdPredictorConfig {
    pub fn new(num_steps: usize, num_points: usize) -> Self {
        Self {
            num_steps,
            num_points,
            ..Self::default()
        }
    }

    /// Parse solver names, failing on unknown ones
    pub fn with_solver_names(mut self, student: &str, teacher: &str) -> Result<Self, ConfigError> {
        self.student = student.parse()?;
        self.teacher = teacher.parse()?;
        Ok(self)
    }

    pub fn with_scale_dir(mut self, scale_dir: f64) -> Self {
        self.scale_dir = scale_dir;
        self
    }

    pub fn with_scale_time(mut self, scale_time: f64) -> Self {
        self.scale_time = scale_time;
        self
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_init(mut self, init: ParamInit) -> Self {
        self.init = init;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !STUDENT_SOLVERS.contains(&self.student) {
            return Err(ConfigError::UnsupportedStudent {
                kind: self.student,
                allowed: STUDENT_SOLVERS,
            });
        }
        if !TEACHER_SOLVERS.contains(&self.teacher) {
            return Err(ConfigError::UnsupportedTeacher {
                kind: self.teacher,
                allowed: TEACHER_SOLVERS,
            });
        }
        for (name, value) in [("scale_dir", self.scale_dir), ("scale_time", self.scale_time)] {
            if value.is_nan() || value < 0.0 {
                return Err(ConfigError::NegativeScale { name, value });
            }
        }
        if self.num_points == 0 {
            return Err(ConfigError::InvalidValue {
                field: "num_points",
                reason: "need at least one candidate point".to_string(),
            });
        }
        if self.num_steps < 2 {
            return Err(ConfigError::InvalidValue {
                field: "num_steps",
                reason: format!("need at least 2 noise levels, got {}", self.num_steps),
            });
        }
        Ok(())
    }

    /// Validate and allocate the parameters
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<EpdPredictor<B>, ConfigError> {
        self.validate()?;
        let shape = [self.num_steps - 1, self.num_points];
        Ok(EpdPredictor {
            ratio_params: self.init.param(shape, device),
            scale_dir_params: self.init.param(shape, device),
            scale_time_params: self.init.param(shape, device),
            weight_params: self.init.param(shape, device),
            num_points: self.num_points,
            num_steps: self.num_steps,
            scale_dir: self.scale_dir,
            scale_time: self.scale_time,
            alpha: self.alpha,
        })
    }
}

/// Ensemble Parallel Directions control predictor
#[derive(Module, Debug)]
pub struct EpdPredictor<B: Backend> {
    ratio_params: Param<Tensor<B, 2>>,
    scale_dir_params: Param<Tensor<B, 2>>,
    scale_time_params: Param<Tensor<B, 2>>,
    weight_params: Param<Tensor<B, 2>>,
    num_points: usize,
    num_steps: usize,
    scale_dir: f64,
    scale_time: f64,
    alpha: f64,
}

impl<B: Backend> EpdPredictor<B> {
    /// Noise levels in the schedule this predictor was built for
    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    /// Raw mixing logits, `[num_steps - 1, num_points]`
    pub fn weight_logits(&self) -> Tensor<B, 2> {
        self.weight_params.val()
    }

    /// Raw ratio logits, `[num_steps - 1, num_points]`
    pub fn ratio_logits(&self) -> Tensor<B, 2> {
        self.ratio_params.val()
    }

    /// Control for one step, for `batch_size` samples
    pub fn forward<S: AsStepIndex>(
        &self,
        batch_size: usize,
        step: S,
    ) -> Result<DirectionControl<B>, DistillError> {
        let step_idx = step.step_index().ok_or(DistillError::InvalidStepIndex)?;
        Ok(self.control_at(batch_size, step_idx)?)
    }

    fn control_at(&self, batch_size: usize, step_idx: usize) -> Result<DirectionControl<B>, SolverError> {
        check_step(step_idx, self.num_steps)?;

        let weight = softmax(step_row(&self.weight_params, step_idx, batch_size), 1);
        let ratio = sigmoid(step_row(&self.ratio_params, step_idx, batch_size));
        let bounded = |param: &Param<Tensor<B, 2>>, s: f64| {
            (s != 0.0).then(|| {
                let raw = step_row(param, step_idx, batch_size);
                sigmoid(raw * 0.5) * (2.0 * s) + (1.0 - s)
            })
        };

        Ok(DirectionControl {
            ratio,
            scale_dir: bounded(&self.scale_dir_params, self.scale_dir),
            scale_time: bounded(&self.scale_time_params, self.scale_time),
            weight,
        })
    }
}

impl<B: Backend> EnsemblePredictor<B> for EpdPredictor<B> {
    fn num_points(&self) -> usize {
        self.num_points
    }

    fn alpha(&self) -> f64 {
        self.alpha
    }

    fn predict(&self, batch_size: usize, step_idx: usize) -> Result<EnsembleControl<B>, SolverError> {
        self.control_at(batch_size, step_idx)
            .map(EnsembleControl::Directions)
    }
}
