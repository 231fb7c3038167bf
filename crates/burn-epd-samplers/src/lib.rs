//! Probability-flow ODE solvers for ensemble distillation
//!
//! Schedules, the score model capability, ensemble control signals and the
//! pluggable step solvers. Every solver can be driven over a whole schedule
//! or one interval at a time with an explicit [`HistoryBuffer`].

pub mod control;
pub mod history;
pub mod model;
pub mod scheduler;
pub mod solver;

pub mod dpm;
pub mod epd;
pub mod euler;
pub mod heun;
pub mod ipndm;
pub mod noise_ensemble;

pub use control::{
    ControlKind, ControlSource, DirectionControl, EnsembleControl, EnsemblePredictor,
    NoiseControl,
};
pub use history::HistoryBuffer;
pub use model::{Conditioning, GaussianDenoiser, ScoreModel};
pub use scheduler::{
    NoiseSchedule, Schedule, ScheduleSpec, ScheduleType, adams_bashforth_coefficients,
    get_schedule,
};
pub use solver::{
    SolveOutput, SolveRequest, SolverError, SolverKind, SolverOptions, StepPosition, StepSolver,
};

pub use dpm::{Dpm2Solver, DpmPlusPlus2mSolver};
pub use epd::EpdSolver;
pub use euler::EulerSolver;
pub use heun::HeunSolver;
pub use ipndm::IpndmSolver;
pub use noise_ensemble::NoiseEnsembleSolver;
