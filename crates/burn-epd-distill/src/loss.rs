//! Stepwise distillation orchestrator
//!
//! A training trajectory is processed one student step at a time:
//!
//! 1. [`EpdLoss::build_teacher_trajectory`] integrates the fine teacher
//!    schedule once per batch and keeps the samples that line up with the
//!    student's noise levels.
//! 2. [`EpdLoss::distill_step`] is called for steps `0..num_steps - 1` in
//!    order. Each call asks the predictor for the step's control, advances
//!    the student one interval and scores it against the teacher target.
//!
//! The student schedule and teacher plan are built on first use and then
//! reused for every batch. The multistep history lives between calls and is
//! reset whenever step 0 begins a new trajectory.

use std::cell::OnceCell;

use burn::prelude::*;
use burn_epd_samplers::{
    Conditioning, EnsemblePredictor, HistoryBuffer, Schedule, ScoreModel, SolveRequest,
    SolverOptions, StepPosition, StepSolver, get_schedule,
};

use crate::config::EpdLossConfig;
use crate::diagnostics::StepDiagnostics;
use crate::dispatch::StepDispatcher;
use crate::error::{ConfigError, DistillError};
use crate::handle::PredictorRef;
use crate::objective::{squared_error, terminal_loss, to_uint8_range};
use crate::perceptual::PerceptualScorer;
use crate::teacher::{TeacherPlan, TeacherSlice};

/// Result of one distillation step
#[derive(Debug)]
pub struct StepOutput<B: Backend> {
    /// Unreduced loss, shaped like the sample
    pub loss: Tensor<B, 4>,
    pub diagnostics: StepDiagnostics,
    /// Student sample at `t_next`, still attached to the predictor's graph
    pub sample: Tensor<B, 4>,
    /// Decoded 8-bit student images, terminal step only
    pub images: Option<Tensor<B, 4>>,
}

/// Distillation loss for one student/teacher pairing
pub struct EpdLoss<B: Backend> {
    config: EpdLossConfig,
    student: StepDispatcher<B>,
    teacher: Box<dyn StepSolver<B>>,
    scorer: Box<dyn PerceptualScorer<B>>,
    schedule: OnceCell<Schedule>,
    plan: OnceCell<TeacherPlan>,
    history: HistoryBuffer<B>,
    last_step: Option<usize>,
}

impl<B: Backend> EpdLoss<B> {
    pub fn new(
        config: EpdLossConfig,
        scorer: impl PerceptualScorer<B> + 'static,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            student: StepDispatcher::new(config.student, config.student_options()),
            teacher: config.teacher.build(),
            scorer: Box::new(scorer),
            schedule: OnceCell::new(),
            plan: OnceCell::new(),
            history: HistoryBuffer::new(),
            last_step: None,
            config,
        })
    }

    pub fn config(&self) -> &EpdLossConfig {
        &self.config
    }

    /// History carried into the next step
    pub fn history(&self) -> &HistoryBuffer<B> {
        &self.history
    }

    /// Student schedule, built on first use
    pub fn schedule(&self, model: &dyn ScoreModel<B>) -> Result<&Schedule, DistillError> {
        if let Some(schedule) = self.schedule.get() {
            return Ok(schedule);
        }
        let schedule = get_schedule(&self.config.schedule_spec(), model.training_schedule())?;
        Ok(self.schedule.get_or_init(|| schedule))
    }

    /// Teacher schedule and slice indices, built on first use
    pub fn teacher_plan(&self, model: &dyn ScoreModel<B>) -> Result<&TeacherPlan, DistillError> {
        if let Some(plan) = self.plan.get() {
            return Ok(plan);
        }
        let schedule = get_schedule(
            &self.config.teacher_schedule_spec(),
            model.training_schedule(),
        )?;
        let plan = TeacherPlan::new(self.config.num_steps, self.config.m, schedule);
        tracing::debug!(
            teacher = %self.config.teacher,
            num_steps_teacher = plan.num_steps_teacher(),
            slice = ?plan.slice(),
            "planned teacher trajectory"
        );
        Ok(self.plan.get_or_init(|| plan))
    }

    /// Run the teacher over the fine schedule and keep one target per step
    ///
    /// `noisy_input` is the starting sample at the largest noise level.
    pub fn build_teacher_trajectory(
        &self,
        model: &dyn ScoreModel<B>,
        noisy_input: Tensor<B, 4>,
        conditioning: &Conditioning<B>,
    ) -> Result<TeacherSlice<B>, DistillError> {
        let sigma_max = self.schedule(model)?.sigma_max();
        let plan = self.teacher_plan(model)?;

        let request =
            SolveRequest::new(conditioning, self.config.teacher_options()).with_trajectory();
        let out = self.teacher.solve(
            model,
            noisy_input / sigma_max,
            plan.schedule().sigmas(),
            request,
        )?;

        TeacherSlice::from_trajectory(&out.trajectory, plan.slice()).ok_or_else(|| {
            DistillError::ShapeMismatch {
                what: "teacher trajectory",
                expected: vec![plan.num_steps_teacher()],
                actual: vec![out.trajectory.len()],
            }
        })
    }

    /// One student step against its teacher target
    ///
    /// `noisy_input` is the current sample at noise level `step_idx`.
    pub fn distill_step<P: EnsemblePredictor<B>>(
        &mut self,
        predictor: PredictorRef<'_, P>,
        model: &dyn ScoreModel<B>,
        noisy_input: Tensor<B, 4>,
        step_idx: usize,
        teacher_output: Tensor<B, 4>,
        conditioning: &Conditioning<B>,
    ) -> Result<StepOutput<B>, DistillError> {
        let num_steps = self.config.num_steps;
        let (t_cur, t_next) = self
            .schedule(model)?
            .interval(step_idx)
            .ok_or(DistillError::StepOutOfRange {
                step_idx,
                num_steps,
            })?;
        self.begin_step(step_idx)?;

        let sample_dims = noisy_input.dims();
        if teacher_output.dims() != sample_dims {
            return Err(DistillError::ShapeMismatch {
                what: "teacher output",
                expected: sample_dims.to_vec(),
                actual: teacher_output.dims().to_vec(),
            });
        }

        let predictor = predictor.unwrap_predictor();
        let batch_size = sample_dims[0];
        let control = predictor.predict(batch_size, step_idx)?;
        if control.dims() != [batch_size, predictor.num_points()] {
            return Err(DistillError::ShapeMismatch {
                what: "ensemble control",
                expected: vec![batch_size, predictor.num_points()],
                actual: control.dims().to_vec(),
            });
        }

        let position = StepPosition {
            step_idx,
            num_steps,
        };
        if position.is_final() {
            self.note_lower_order_final();
        }

        let out = self.student.dispatch(
            model,
            noisy_input / t_cur,
            t_cur,
            t_next,
            position,
            control,
            self.history.clone(),
            conditioning,
        )?;
        self.history = out.history.detach();

        let mut loss = squared_error(out.sample.clone(), teacher_output.clone());
        let mut images = None;
        if position.is_final() {
            let (student, teacher) = self.decode_pair(model, out.sample.clone(), teacher_output)?;
            let student = to_uint8_range(student);
            let teacher = to_uint8_range(teacher);
            let perceptual = self.scorer.distance(student.clone(), teacher);
            loss = terminal_loss(perceptual, predictor.alpha(), loss.dims())?;
            images = Some(student);
        }

        let diagnostics = StepDiagnostics::new(step_idx, &loss, &out.control);
        tracing::info!(step = step_idx, loss = diagnostics.loss, "{}", diagnostics);
        self.last_step = Some(step_idx);

        Ok(StepOutput {
            loss,
            diagnostics,
            sample: out.sample,
            images,
        })
    }

    /// Distil one whole trajectory for a batch
    ///
    /// `noise` is unit-variance; it is scaled to the largest noise level.
    /// Each step starts from the previous (detached) student sample, and
    /// every [`StepOutput`] is handed to `on_step`, where the caller runs
    /// its backward pass. Returns the final student sample.
    pub fn distill_trajectory<P, F>(
        &mut self,
        predictor: PredictorRef<'_, P>,
        model: &dyn ScoreModel<B>,
        noise: Tensor<B, 4>,
        conditioning: &Conditioning<B>,
        mut on_step: F,
    ) -> Result<Tensor<B, 4>, DistillError>
    where
        P: EnsemblePredictor<B>,
        F: FnMut(&StepOutput<B>),
    {
        let sigma_max = self.schedule(model)?.sigma_max();
        let start = noise * sigma_max;
        let targets = self.build_teacher_trajectory(model, start.clone(), conditioning)?;

        let mut x = start;
        for (step_idx, target) in targets.iter().enumerate() {
            let output =
                self.distill_step(predictor, model, x, step_idx, target.clone(), conditioning)?;
            on_step(&output);
            x = output.sample.detach();
        }
        Ok(x)
    }

    fn begin_step(&mut self, step_idx: usize) -> Result<(), DistillError> {
        if step_idx == 0 {
            if !self.history.is_empty() {
                tracing::debug!(entries = self.history.len(), "new trajectory, clearing history");
            }
            self.history.clear();
            self.last_step = None;
            return Ok(());
        }
        let expected = self.last_step.map_or(0, |last| last + 1);
        if step_idx != expected {
            return Err(DistillError::SequenceViolation {
                expected,
                got: step_idx,
            });
        }
        Ok(())
    }

    fn note_lower_order_final(&self) {
        let options = self.student.options();
        if self.student.kind().uses_history()
            && options.lower_order_final
            && options.max_order > 2
            && self.config.num_steps < SolverOptions::LOWER_ORDER_FINAL_BELOW
        {
            tracing::debug!(
                max_order = options.max_order,
                "final interval of a short schedule runs at order 2"
            );
        }
    }

    fn decode_pair(
        &self,
        model: &dyn ScoreModel<B>,
        student: Tensor<B, 4>,
        teacher: Tensor<B, 4>,
    ) -> Result<(Tensor<B, 4>, Tensor<B, 4>), DistillError> {
        let dataset = self.config.dataset;
        if !dataset.requires_decode() {
            return Ok((student, teacher));
        }
        let student = model
            .differentiable_decode(student)
            .ok_or(DistillError::MissingDecoder(dataset))?;
        let teacher = model
            .decode(teacher)
            .ok_or(DistillError::MissingDecoder(dataset))?;
        Ok((student, teacher))
    }
}
