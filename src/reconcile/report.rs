use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ClusterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStep {
    ControlPlane,
    Membership,
    Services,
    Resources,
    Housekeeping,
}

impl fmt::Display for ReconcileStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconcileStep::ControlPlane => "control_plane",
            ReconcileStep::Membership => "membership",
            ReconcileStep::Services => "services",
            ReconcileStep::Resources => "resources",
            ReconcileStep::Housekeeping => "housekeeping",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StepOutcome {
    Ok(String),
    Skipped(String),
    Failed(String),
}

impl StepOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, StepOutcome::Ok(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: ReconcileStep,
    pub outcome: StepOutcome,
}

/// What one reconciliation cycle observed and did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub steps: Vec<StepRecord>,
    /// Services that received a forced update this cycle
    pub forced_updates: Vec<String>,
    pub cleanup_ran: bool,
    pub load_shed: bool,
    pub removed_units: usize,
    /// First local precondition failure seen; ends a daemon loop
    #[serde(skip)]
    pub fatal: Option<ClusterError>,
}

impl CycleReport {
    pub fn begin() -> Self {
        Self {
            started_at: Utc::now(),
            finished_at: None,
            steps: Vec::new(),
            forced_updates: Vec::new(),
            cleanup_ran: false,
            load_shed: false,
            removed_units: 0,
            fatal: None,
        }
    }

    /// Keep `error` if it is fatal and nothing fatal was seen yet.
    pub fn note(&mut self, error: &ClusterError) {
        if self.fatal.is_none() && error.is_fatal() {
            self.fatal = Some(error.clone());
        }
    }

    pub fn record(&mut self, step: ReconcileStep, outcome: StepOutcome) {
        self.steps.push(StepRecord { step, outcome });
    }

    pub fn outcome(&self, step: ReconcileStep) -> Option<&StepOutcome> {
        self.steps.iter().find(|r| r.step == step).map(|r| &r.outcome)
    }

    pub fn failed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|r| matches!(r.outcome, StepOutcome::Failed(_)))
            .count()
    }
}
