//! Ensemble control signals
//!
//! An ensemble solver combines several candidate update directions per
//! step. How it combines them is not fixed: a small learnt predictor emits,
//! for every step, one row of control values per candidate point.
//! All tensors here are shaped `[batch, num_points]`.

use burn::prelude::*;

use crate::solver::SolverError;

/// Controls for direction ensembling (EPD solvers)
#[derive(Debug, Clone)]
pub struct DirectionControl<B: Backend> {
    /// Position of each intermediate time between `t_cur` and `t_next`, in (0, 1)
    pub ratio: Tensor<B, 2>,
    /// Multiplier on each candidate direction, in (1 - s, 1 + s)
    pub scale_dir: Option<Tensor<B, 2>>,
    /// Multiplier on the noise level each candidate is evaluated at
    pub scale_time: Option<Tensor<B, 2>>,
    /// Mixing weights over the candidates; rows sum to 1
    pub weight: Tensor<B, 2>,
}

/// Controls for noise ensembling
#[derive(Debug, Clone)]
pub struct NoiseControl<B: Backend> {
    /// Relative perturbation magnitude per candidate, in [0, noise_max]
    pub sigma: Tensor<B, 2>,
    /// Mixing weights over the candidates; rows sum to 1
    pub weight: Tensor<B, 2>,
}

/// Which family of control a solver consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Directions,
    Noise,
}

impl std::fmt::Display for ControlKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlKind::Directions => f.write_str("direction"),
            ControlKind::Noise => f.write_str("noise"),
        }
    }
}

/// Per-step ensemble control emitted by a predictor
#[derive(Debug, Clone)]
pub enum EnsembleControl<B: Backend> {
    Directions(DirectionControl<B>),
    Noise(NoiseControl<B>),
}

impl<B: Backend> EnsembleControl<B> {
    pub fn kind(&self) -> ControlKind {
        match self {
            EnsembleControl::Directions(_) => ControlKind::Directions,
            EnsembleControl::Noise(_) => ControlKind::Noise,
        }
    }

    /// Mixing weights, present in every variant
    pub fn weight(&self) -> &Tensor<B, 2> {
        match self {
            EnsembleControl::Directions(c) => &c.weight,
            EnsembleControl::Noise(c) => &c.weight,
        }
    }

    /// `[batch, num_points]` of the mixing weights
    pub fn dims(&self) -> [usize; 2] {
        self.weight().dims()
    }

    pub fn num_points(&self) -> usize {
        self.dims()[1]
    }

    /// Every control tensor, labelled, for validation and reporting
    pub fn signals(&self) -> Vec<(&'static str, &Tensor<B, 2>)> {
        match self {
            EnsembleControl::Directions(c) => {
                let mut signals = vec![("weight", &c.weight), ("ratio", &c.ratio)];
                if let Some(st) = &c.scale_time {
                    signals.push(("scale_time", st));
                }
                if let Some(sd) = &c.scale_dir {
                    signals.push(("scale_dir", sd));
                }
                signals
            }
            EnsembleControl::Noise(c) => vec![("weight", &c.weight), ("sigma", &c.sigma)],
        }
    }

    /// Detach every tensor from the autodiff graph
    pub fn detach(self) -> Self {
        match self {
            EnsembleControl::Directions(c) => EnsembleControl::Directions(DirectionControl {
                ratio: c.ratio.detach(),
                scale_dir: c.scale_dir.map(|t| t.detach()),
                scale_time: c.scale_time.map(|t| t.detach()),
                weight: c.weight.detach(),
            }),
            EnsembleControl::Noise(c) => EnsembleControl::Noise(NoiseControl {
                sigma: c.sigma.detach(),
                weight: c.weight.detach(),
            }),
        }
    }
}

/// Learnt source of per-step ensemble control
pub trait EnsemblePredictor<B: Backend> {
    /// Number of candidate points per step
    fn num_points(&self) -> usize;

    /// Weight of the terminal perceptual loss term
    fn alpha(&self) -> f64;

    /// Control values for `step_idx`, broadcast to `batch_size` rows
    fn predict(&self, batch_size: usize, step_idx: usize)
        -> Result<EnsembleControl<B>, SolverError>;
}

/// Where an ensemble solver takes its control from
pub enum ControlSource<'a, B: Backend> {
    /// No control: ensemble solvers refuse to run
    None,
    /// One control, applied to the single interval of a training step
    Fixed(EnsembleControl<B>),
    /// Query a predictor at every step of a sampling pass
    Predictor(&'a dyn EnsemblePredictor<B>),
}

impl<B: Backend> ControlSource<'_, B> {
    /// Resolve the control for global step `step_idx`
    pub fn resolve(
        &self,
        batch_size: usize,
        step_idx: usize,
    ) -> Result<Option<EnsembleControl<B>>, SolverError> {
        match self {
            ControlSource::None => Ok(None),
            ControlSource::Fixed(control) => Ok(Some(control.clone())),
            ControlSource::Predictor(predictor) => predictor.predict(batch_size, step_idx).map(Some),
        }
    }
}

/// Column `j` of a `[batch, num_points]` control as a `[batch]` tensor
pub(crate) fn point<B: Backend>(signal: &Tensor<B, 2>, j: usize) -> Tensor<B, 1> {
    let [batch, _] = signal.dims();
    signal.clone().slice([0..batch, j..j + 1]).reshape([batch])
}
