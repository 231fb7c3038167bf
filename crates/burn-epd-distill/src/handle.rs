//! Predictor handles
//!
//! Training harnesses sometimes hand the orchestrator a predictor wrapped for
//! replication instead of the predictor itself. Both shapes are accepted and
//! unwrapped in one place, so attribute lookups never guess.

use burn::prelude::*;
use burn_epd_samplers::{EnsembleControl, EnsemblePredictor, SolverError};

/// A predictor held by a replication wrapper
#[derive(Debug, Clone)]
pub struct Replicated<P> {
    module: P,
}

impl<P> Replicated<P> {
    pub fn new(module: P) -> Self {
        Self { module }
    }

    /// The wrapped predictor
    pub fn module(&self) -> &P {
        &self.module
    }
}

impl<B: Backend, P: EnsemblePredictor<B>> EnsemblePredictor<B> for Replicated<P> {
    fn num_points(&self) -> usize {
        self.module.num_points()
    }

    fn alpha(&self) -> f64 {
        self.module.alpha()
    }

    fn predict(&self, batch_size: usize, step_idx: usize) -> Result<EnsembleControl<B>, SolverError> {
        self.module.predict(batch_size, step_idx)
    }
}

/// Either a bare predictor or a replicated one
#[derive(Debug)]
pub enum PredictorRef<'a, P> {
    Direct(&'a P),
    Wrapped(&'a Replicated<P>),
}

impl<P> Clone for PredictorRef<'_, P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for PredictorRef<'_, P> {}

impl<'a, P> PredictorRef<'a, P> {
    /// The underlying predictor, whichever shape was given
    pub fn unwrap_predictor(self) -> &'a P {
        match self {
            PredictorRef::Direct(predictor) => predictor,
            PredictorRef::Wrapped(wrapper) => wrapper.module(),
        }
    }
}

impl<'a, P> From<&'a Replicated<P>> for PredictorRef<'a, P> {
    fn from(wrapper: &'a Replicated<P>) -> Self {
        PredictorRef::Wrapped(wrapper)
    }
}

/// Unwrap a predictor handle
pub fn unwrap_predictor<'a, P>(handle: impl Into<PredictorRef<'a, P>>) -> &'a P
where
    P: 'a,
{
    handle.into().unwrap_predictor()
}
