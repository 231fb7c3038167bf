//! Error types for predictor construction and stepwise distillation

use burn_epd_samplers::{ControlKind, SolverError, SolverKind};
use thiserror::Error;

use crate::config::DatasetKind;

/// Invalid configuration, raised when a config is validated or initialized
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Student solver must be one of {allowed:?}, got {kind}")]
    UnsupportedStudent {
        kind: SolverKind,
        allowed: &'static [SolverKind],
    },

    #[error("Teacher solver must be one of {allowed:?}, got {kind}")]
    UnsupportedTeacher {
        kind: SolverKind,
        allowed: &'static [SolverKind],
    },

    #[error("{name} must be non-negative, got {value}")]
    NegativeScale { name: &'static str, value: f64 },

    #[error("Invalid {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Unknown dataset: {0}")]
    UnknownDataset(String),

    #[error(transparent)]
    Solver(#[from] SolverError),
}

/// Failure of a distillation step
#[derive(Error, Debug)]
pub enum DistillError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Solver(#[from] SolverError),

    #[error("Step {step_idx} is not a training step of a {num_steps}-level schedule")]
    StepOutOfRange { step_idx: usize, num_steps: usize },

    #[error("Step index must be a single non-negative integer")]
    InvalidStepIndex,

    #[error("Steps must run in order: expected step {expected}, got {got}")]
    SequenceViolation { expected: usize, got: usize },

    #[error("Shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Control {signal} out of range at point {point}: {value} ({reason})")]
    ControlOutOfRange {
        signal: &'static str,
        point: usize,
        value: f32,
        reason: &'static str,
    },

    #[error("Student {solver} needs {expected} control, predictor emitted {actual}")]
    ControlMismatch {
        solver: SolverKind,
        expected: ControlKind,
        actual: ControlKind,
    },

    #[error("Dataset {0} needs a score model with a decode stage")]
    MissingDecoder(DatasetKind),
}
