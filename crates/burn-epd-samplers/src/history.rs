//! History of past model evaluations for multistep solvers
//!
//! Multistep solvers extrapolate from earlier evaluations. When a sampling
//! pass is split into one call per interval (as in stepwise distillation),
//! the history has to survive between calls, so it is an explicit value
//! that solvers take and give back.

use std::collections::VecDeque;

use burn::prelude::*;

/// Past `(model output, noise level)` pairs, newest first
#[derive(Debug, Clone)]
pub struct HistoryBuffer<B: Backend> {
    outputs: VecDeque<Tensor<B, 4>>,
    times: VecDeque<f32>,
}

impl<B: Backend> Default for HistoryBuffer<B> {
    fn default() -> Self {
        Self {
            outputs: VecDeque::new(),
            times: VecDeque::new(),
        }
    }
}

impl<B: Backend> HistoryBuffer<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn clear(&mut self) {
        self.outputs.clear();
        self.times.clear();
    }

    /// Record an evaluation, keeping at most `capacity` entries
    pub fn push(&mut self, output: Tensor<B, 4>, time: f32, capacity: usize) {
        self.outputs.push_front(output);
        self.times.push_front(time);
        while self.outputs.len() > capacity.max(1) {
            self.outputs.pop_back();
            self.times.pop_back();
        }
    }

    /// Most recent evaluation
    pub fn latest(&self) -> Option<(&Tensor<B, 4>, f32)> {
        Some((self.outputs.front()?, *self.times.front()?))
    }

    /// Evaluation `age` steps back (0 = newest)
    pub fn get(&self, age: usize) -> Option<(&Tensor<B, 4>, f32)> {
        Some((self.outputs.get(age)?, *self.times.get(age)?))
    }

    /// Recorded noise levels, newest first
    pub fn times(&self) -> impl Iterator<Item = f32> + '_ {
        self.times.iter().copied()
    }

    /// Weighted sum of the newest `coeffs.len()` outputs
    pub fn combine(&self, coeffs: &[f32]) -> Option<Tensor<B, 4>> {
        coeffs
            .iter()
            .zip(self.outputs.iter())
            .map(|(c, out)| out.clone() * *c)
            .reduce(|acc, term| acc + term)
    }

    /// Drop autodiff graphs while keeping the values
    pub fn detach(self) -> Self {
        Self {
            outputs: self.outputs.into_iter().map(|t| t.detach()).collect(),
            times: self.times,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn filled(value: f32) -> Tensor<TestBackend, 4> {
        Tensor::ones([1, 1, 1, 1], &Default::default()) * value
    }

    #[test]
    fn test_push_respects_capacity() {
        let mut history = HistoryBuffer::<TestBackend>::new();
        for i in 0..6 {
            history.push(filled(i as f32), 10.0 - i as f32, 4);
            assert_eq!(history.len(), (i + 1).min(4));
        }
        let times: Vec<f32> = history.times().collect();
        assert_eq!(times, vec![5.0, 6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_combine_newest_first() {
        let mut history = HistoryBuffer::<TestBackend>::new();
        history.push(filled(1.0), 2.0, 4);
        history.push(filled(3.0), 1.0, 4);
        let combined = history.combine(&[1.5, -0.5]).unwrap();
        let value: f32 = combined.into_scalar().elem();
        assert!((value - (1.5 * 3.0 - 0.5 * 1.0)).abs() < 1e-6);
    }

    #[test]
    fn test_clear_empties() {
        let mut history = HistoryBuffer::<TestBackend>::new();
        history.push(filled(1.0), 2.0, 4);
        history.clear();
        assert!(history.is_empty());
        assert!(history.latest().is_none());
        assert!(history.combine(&[1.0]).is_none());
    }
}
