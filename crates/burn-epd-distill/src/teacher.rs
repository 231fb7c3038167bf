//! Teacher trajectory planning
//!
//! The teacher integrates a schedule with `M` extra levels between every
//! pair of student levels. Its trajectory therefore has
//! `(M + 1) * (num_steps - 1) + 1` samples, and the sample matching student
//! level `k` sits at index `k * (M + 1)`.

use burn::prelude::*;
use burn_epd_samplers::Schedule;

/// Length of the fine teacher schedule
pub fn num_steps_teacher(num_steps: usize, m: usize) -> usize {
    (m + 1) * num_steps.saturating_sub(1) + 1
}

/// Trajectory indices matching student levels `1..num_steps`
pub fn slice_indices(num_steps: usize, m: usize) -> Vec<usize> {
    (1..num_steps).map(|k| k * (m + 1)).collect()
}

/// Fine schedule and slice indices, fixed for a whole run
#[derive(Debug, Clone, PartialEq)]
pub struct TeacherPlan {
    num_steps_teacher: usize,
    slice: Vec<usize>,
    schedule: Schedule,
}

impl TeacherPlan {
    pub fn new(num_steps: usize, m: usize, schedule: Schedule) -> Self {
        Self {
            num_steps_teacher: num_steps_teacher(num_steps, m),
            slice: slice_indices(num_steps, m),
            schedule,
        }
    }

    pub fn num_steps_teacher(&self) -> usize {
        self.num_steps_teacher
    }

    pub fn slice(&self) -> &[usize] {
        &self.slice
    }

    /// Fine teacher schedule
    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }
}

/// Teacher targets for one batch, one per student step
///
/// Entry `i` is the target for the student step from level `i` to `i + 1`.
#[derive(Debug, Clone)]
pub struct TeacherSlice<B: Backend> {
    targets: Vec<Tensor<B, 4>>,
}

impl<B: Backend> TeacherSlice<B> {
    /// Keep the trajectory entries at `indices`, detached from any graph
    pub fn from_trajectory(trajectory: &[Tensor<B, 4>], indices: &[usize]) -> Option<Self> {
        let targets = indices
            .iter()
            .map(|&i| trajectory.get(i).map(|t| t.clone().detach()))
            .collect::<Option<Vec<_>>>()?;
        Some(Self { targets })
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Target for student step `step_idx`
    pub fn get(&self, step_idx: usize) -> Option<&Tensor<B, 4>> {
        self.targets.get(step_idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tensor<B, 4>> {
        self.targets.iter()
    }
}
