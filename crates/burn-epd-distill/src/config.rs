//! Distillation run configuration

use std::fmt;
use std::str::FromStr;

use burn_epd_samplers::{ScheduleSpec, ScheduleType, SolverKind, SolverOptions};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Where the perceptual loss is computed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetKind {
    /// Pixel-space models, scored directly
    #[default]
    Pixel,
    /// LSUN bedroom latent diffusion model
    LsunBedroomLdm,
    /// MS-COCO text-to-image latent model
    MsCoco,
}

impl DatasetKind {
    pub fn name(self) -> &'static str {
        match self {
            DatasetKind::Pixel => "pixel",
            DatasetKind::LsunBedroomLdm => "lsun_bedroom_ldm",
            DatasetKind::MsCoco => "ms_coco",
        }
    }

    /// Latent datasets are decoded to pixels before perceptual scoring
    pub fn requires_decode(self) -> bool {
        matches!(self, DatasetKind::LsunBedroomLdm | DatasetKind::MsCoco)
    }
}

impl fmt::Display for DatasetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DatasetKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            DatasetKind::Pixel,
            DatasetKind::LsunBedroomLdm,
            DatasetKind::MsCoco,
        ]
        .into_iter()
        .find(|kind| kind.name() == s)
        .ok_or_else(|| ConfigError::UnknownDataset(s.to_string()))
    }
}

/// Configuration of a stepwise distillation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EpdLossConfig {
    /// Noise levels in the student schedule (steps + 1)
    pub num_steps: usize,
    /// Solver the student runs with learnt control
    pub student: SolverKind,
    /// Solver producing the reference trajectory
    pub teacher: SolverKind,
    /// Extra teacher steps inserted between consecutive student levels
    #[serde(alias = "M")]
    pub m: usize,
    pub schedule_type: ScheduleType,
    pub schedule_rho: f64,
    /// Analytical first step for the student
    pub afs: bool,
    pub max_order: usize,
    pub sigma_min: f64,
    pub sigma_max: f64,
    pub predict_x0: bool,
    pub lower_order_final: bool,
    pub dataset: DatasetKind,
}

impl Default for EpdLossConfig {
    fn default() -> Self {
        Self {
            num_steps: 4,
            student: SolverKind::Epd,
            teacher: SolverKind::Heun,
            m: 3,
            schedule_type: ScheduleType::Polynomial,
            schedule_rho: 7.0,
            afs: false,
            max_order: 4,
            sigma_min: 0.002,
            sigma_max: 80.0,
            predict_x0: true,
            lower_order_final: true,
            dataset: DatasetKind::Pixel,
        }
    }
}

impl EpdLossConfig {
    pub fn new(num_steps: usize, student: SolverKind, teacher: SolverKind, m: usize) -> Self {
        Self {
            num_steps,
            student,
            teacher,
            m,
            ..Self::default()
        }
    }

    /// Parse solver names, failing on unknown ones
    pub fn with_solver_names(mut self, student: &str, teacher: &str) -> Result<Self, ConfigError> {
        self.student = student.parse()?;
        self.teacher = teacher.parse()?;
        Ok(self)
    }

    pub fn with_schedule(mut self, schedule_type: ScheduleType, schedule_rho: f64) -> Self {
        self.schedule_type = schedule_type;
        self.schedule_rho = schedule_rho;
        self
    }

    pub fn with_sigma_range(mut self, sigma_min: f64, sigma_max: f64) -> Self {
        self.sigma_min = sigma_min;
        self.sigma_max = sigma_max;
        self
    }

    pub fn with_afs(mut self, afs: bool) -> Self {
        self.afs = afs;
        self
    }

    pub fn with_max_order(mut self, max_order: usize) -> Self {
        self.max_order = max_order;
        self
    }

    pub fn with_predict_x0(mut self, predict_x0: bool) -> Self {
        self.predict_x0 = predict_x0;
        self
    }

    pub fn with_lower_order_final(mut self, lower_order_final: bool) -> Self {
        self.lower_order_final = lower_order_final;
        self
    }

    pub fn with_dataset(mut self, dataset: DatasetKind) -> Self {
        self.dataset = dataset;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_steps < 2 {
            return Err(ConfigError::InvalidValue {
                field: "num_steps",
                reason: format!("need at least 2 noise levels, got {}", self.num_steps),
            });
        }
        if !(1..=4).contains(&self.max_order) {
            return Err(ConfigError::InvalidValue {
                field: "max_order",
                reason: format!("must be between 1 and 4, got {}", self.max_order),
            });
        }
        if !(self.sigma_min > 0.0 && self.sigma_min < self.sigma_max) {
            return Err(ConfigError::InvalidValue {
                field: "sigma range",
                reason: format!(
                    "need 0 < sigma_min < sigma_max, got [{}, {}]",
                    self.sigma_min, self.sigma_max
                ),
            });
        }
        if self.schedule_rho <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "schedule_rho",
                reason: format!("must be positive, got {}", self.schedule_rho),
            });
        }
        if self.teacher.control_kind().is_some() {
            return Err(ConfigError::InvalidValue {
                field: "teacher",
                reason: format!("{} needs learnt control", self.teacher),
            });
        }
        Ok(())
    }

    /// Options the student solver runs with
    pub fn student_options(&self) -> SolverOptions {
        SolverOptions {
            predict_x0: self.predict_x0,
            max_order: self.max_order,
            lower_order_final: self.lower_order_final,
            afs: self.afs,
        }
    }

    /// Options the teacher solver runs with (never the analytical first step)
    pub fn teacher_options(&self) -> SolverOptions {
        SolverOptions {
            afs: false,
            ..self.student_options()
        }
    }

    /// Length of the fine teacher schedule
    pub fn num_steps_teacher(&self) -> usize {
        (self.m + 1) * self.num_steps.saturating_sub(1) + 1
    }

    /// Student schedule parameters
    pub fn schedule_spec(&self) -> ScheduleSpec {
        ScheduleSpec {
            num_steps: self.num_steps,
            sigma_min: self.sigma_min,
            sigma_max: self.sigma_max,
            schedule_type: self.schedule_type,
            schedule_rho: self.schedule_rho,
        }
    }

    /// Teacher schedule parameters: same curve, finer resolution
    pub fn teacher_schedule_spec(&self) -> ScheduleSpec {
        ScheduleSpec {
            num_steps: self.num_steps_teacher(),
            ..self.schedule_spec()
        }
    }
}
