//! Ensemble parallel direction distillation
//!
//! Trains a tiny per-step predictor so that a few-step student solver
//! reproduces the samples of a many-step teacher:
//!
//! - [`EpdPredictor`] and [`NoiseEnsemblePredictor`] hold the learnt
//!   per-step parameters and turn them into ensemble control.
//! - [`EpdLoss`] plans the teacher trajectory, runs the student one interval
//!   at a time and scores it against the teacher.
//!
//! ```ignore
//! let mut loss = EpdLoss::new(config, FeatureMseScorer::new(PooledFeatures::default()))?;
//! let slice = loss.build_teacher_trajectory(&model, noisy, &cond)?;
//! for (i, target) in slice.iter().enumerate() {
//!     let out = loss.distill_step(PredictorRef::Direct(&predictor), &model, x, i, target.clone(), &cond)?;
//!     let grads = out.loss.mean().backward();
//!     x = out.sample.detach();
//! }
//! ```

pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod handle;
pub mod loss;
pub mod noise_predictor;
pub mod objective;
pub mod perceptual;
pub mod predictor;
pub mod teacher;

pub use config::{DatasetKind, EpdLossConfig};
pub use diagnostics::StepDiagnostics;
pub use dispatch::{DispatchOutput, StepDispatcher, WEIGHT_SUM_TOLERANCE};
pub use error::{ConfigError, DistillError};
pub use handle::{PredictorRef, Replicated, unwrap_predictor};
pub use loss::{EpdLoss, StepOutput};
pub use noise_predictor::{NoiseEnsemblePredictor, NoiseEnsemblePredictorConfig};
pub use objective::{per_sample_norm, squared_error, terminal_loss, to_uint8_range};
pub use perceptual::{FeatureExtractor, FeatureMseScorer, PerceptualScorer, PooledFeatures};
pub use predictor::{
    AsStepIndex, EpdPredictor, EpdPredictorConfig, ParamInit, STUDENT_SOLVERS, TEACHER_SOLVERS,
};
pub use teacher::{TeacherPlan, TeacherSlice, num_steps_teacher, slice_indices};
