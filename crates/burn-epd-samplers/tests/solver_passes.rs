//! Full sampling passes over the analytic Gaussian denoiser.
//!
//! `GaussianDenoiser` has a closed-form ODE solution, so every solver can be
//! checked against the exact end point instead of stored fixtures.

use std::cell::Cell;

use burn::prelude::*;
use burn_epd_samplers::{
    Conditioning, ControlSource, DirectionControl, EnsembleControl, EnsemblePredictor,
    GaussianDenoiser, ScheduleSpec, ScheduleType, SolveRequest, SolverError, SolverKind,
    SolverOptions, get_schedule,
};
use burn_ndarray::NdArray;

type TestBackend = NdArray<f32>;

/// Tolerance for floating point comparisons
const EPSILON: f32 = 1e-3;

fn assert_approx_eq(expected: f32, actual: f32, name: &str) {
    let diff = (expected - actual).abs();
    assert!(
        diff < EPSILON,
        "{}: expected {}, got {} (diff: {})",
        name,
        expected,
        actual,
        diff
    );
}

fn edm_spec(schedule_type: ScheduleType, num_steps: usize) -> ScheduleSpec {
    ScheduleSpec {
        num_steps,
        sigma_min: 0.002,
        sigma_max: 80.0,
        schedule_type,
        schedule_rho: 7.0,
    }
}

// ============================================================================
// Schedule Tests
// ============================================================================

#[test]
fn test_polynomial_schedule_matches_reference() {
    let schedule = get_schedule::<TestBackend>(&edm_spec(ScheduleType::Polynomial, 5), None).unwrap();
    let expected = [80.0, 17.527832, 2.515219, 0.169753, 0.002];
    for (i, (e, a)) in expected.iter().zip(schedule.sigmas()).enumerate() {
        assert_approx_eq(*e, *a, &format!("polynomial[{}]", i));
    }
}

#[test]
fn test_logsnr_schedule_matches_reference() {
    let schedule = get_schedule::<TestBackend>(&edm_spec(ScheduleType::Logsnr, 5), None).unwrap();
    let expected = [80.0, 5.656854, 0.4, 0.028284, 0.002];
    for (i, (e, a)) in expected.iter().zip(schedule.sigmas()).enumerate() {
        assert_approx_eq(*e, *a, &format!("logsnr[{}]", i));
    }
}

#[test]
fn test_schedule_names_parse() {
    assert_eq!("time_uniform".parse::<ScheduleType>().unwrap(), ScheduleType::TimeUniform);
    assert!("cosine".parse::<ScheduleType>().is_err());
}

// ============================================================================
// Solver Passes
// ============================================================================

/// Uniform weights, midpoint ratios, neutral scales
struct ConstantPredictor {
    num_points: usize,
    calls: Cell<usize>,
}

impl ConstantPredictor {
    fn new(num_points: usize) -> Self {
        Self {
            num_points,
            calls: Cell::new(0),
        }
    }
}

impl<B: Backend> EnsemblePredictor<B> for ConstantPredictor {
    fn num_points(&self) -> usize {
        self.num_points
    }

    fn alpha(&self) -> f64 {
        10.0
    }

    fn predict(
        &self,
        batch_size: usize,
        _step_idx: usize,
    ) -> Result<EnsembleControl<B>, SolverError> {
        self.calls.set(self.calls.get() + 1);
        let device = Default::default();
        let shape = [batch_size, self.num_points];
        Ok(EnsembleControl::Directions(DirectionControl {
            ratio: Tensor::ones(shape, &device) * 0.5,
            scale_dir: Some(Tensor::ones(shape, &device)),
            scale_time: Some(Tensor::ones(shape, &device)),
            weight: Tensor::ones(shape, &device) / self.num_points as f32,
        }))
    }
}

fn exact_end(schedule: &[f32]) -> f32 {
    let model = GaussianDenoiser::new(0.5);
    schedule[0] * model.transport(schedule[0], schedule[schedule.len() - 1])
}

#[test]
fn test_plain_solvers_reach_exact_solution() {
    let device = Default::default();
    let model = GaussianDenoiser::new(0.5);
    let cond = Conditioning::default();
    let schedule = get_schedule::<TestBackend>(&edm_spec(ScheduleType::Polynomial, 40), None).unwrap();
    let expected = exact_end(schedule.sigmas());

    for kind in [
        SolverKind::Heun,
        SolverKind::Dpm,
        SolverKind::Dpmpp,
        SolverKind::Ipndm,
    ] {
        let solver = kind.build::<TestBackend>();
        let x = Tensor::<TestBackend, 4>::ones([2, 1, 2, 2], &device);
        let out = solver
            .solve(
                &model,
                x,
                schedule.sigmas(),
                SolveRequest::new(&cond, SolverOptions::default()),
            )
            .unwrap();
        let values: Vec<f32> = out.sample.into_data().to_vec().unwrap();
        for v in values {
            assert!(
                (v - expected).abs() / expected < 2e-2,
                "{}: {} vs {}",
                kind,
                v,
                expected
            );
        }
    }
}

#[test]
fn test_epd_with_predictor_queries_every_step() {
    let device = Default::default();
    let model = GaussianDenoiser::new(0.5);
    let cond = Conditioning::default();
    let schedule = get_schedule::<TestBackend>(&edm_spec(ScheduleType::Polynomial, 30), None).unwrap();
    let predictor = ConstantPredictor::new(2);
    let expected = exact_end(schedule.sigmas());

    for kind in [SolverKind::Epd, SolverKind::EpdParallel] {
        predictor.calls.set(0);
        let solver = kind.build::<TestBackend>();
        let x = Tensor::<TestBackend, 4>::ones([1, 1, 2, 2], &device);
        let request = SolveRequest::new(&cond, SolverOptions::default())
            .with_control(ControlSource::Predictor(&predictor))
            .with_trajectory();
        let out = solver.solve(&model, x, schedule.sigmas(), request).unwrap();

        assert_eq!(predictor.calls.get(), 29);
        assert_eq!(out.trajectory.len(), 30);
        assert_eq!(out.history.len(), 4);
        let values: Vec<f32> = out.sample.into_data().to_vec().unwrap();
        for v in values {
            assert!(
                (v - expected).abs() / expected < 2e-2,
                "{}: {} vs {}",
                kind,
                v,
                expected
            );
        }
    }
}

#[test]
fn test_ensemble_solver_without_control_fails() {
    let device = Default::default();
    let model = GaussianDenoiser::new(0.5);
    let cond = Conditioning::default();
    let solver = SolverKind::NoiseEnsemble.build::<TestBackend>();
    let x = Tensor::<TestBackend, 4>::ones([1, 1, 1, 1], &device);
    let result = solver.solve(
        &model,
        x,
        &[1.0, 0.5],
        SolveRequest::new(&cond, SolverOptions::default()),
    );
    assert!(result.is_err());
}

#[test]
fn test_solver_options_from_json() {
    let options: SolverOptions = serde_json::from_str(r#"{"afs": true, "max_order": 3}"#).unwrap();
    assert!(options.afs);
    assert_eq!(options.max_order, 3);
    assert!(options.predict_x0);
    assert!(options.lower_order_final);
}
