use crate::error::{PipelineError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Phase of the control flow a failure is attributed to. Surfaces in the
/// final status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Readiness,
    Stages,
    Rebind,
    Verification,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Readiness => "readiness",
            RunPhase::Stages => "stages",
            RunPhase::Rebind => "rebind",
            RunPhase::Verification => "verification",
        }
    }
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunStatus {
    Pending {
        created_at: DateTime<Utc>,
    },
    Running {
        started_at: DateTime<Utc>,
        current_stage: Option<String>,
    },
    Succeeded {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        duration_ms: u64,
    },
    Failed {
        started_at: DateTime<Utc>,
        failed_at: DateTime<Utc>,
        phase: RunPhase,
        failed_stage_index: Option<usize>,
        error: String,
    },
}

impl RunStatus {
    pub fn state_name(&self) -> &'static str {
        match self {
            RunStatus::Pending { .. } => "pending",
            RunStatus::Running { .. } => "running",
            RunStatus::Succeeded { .. } => "succeeded",
            RunStatus::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded { .. } | RunStatus::Failed { .. })
    }
}

/// One pipeline execution. The run names the index artifact it builds and
/// is immutable once terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    /// Identifier of the index artifact this run produces.
    pub index_id: String,
    pub stage_names: Vec<String>,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(index_id: String, stage_names: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            index_id,
            stage_names,
            status: RunStatus::Pending { created_at: now },
            created_at: now,
            updated_at: now,
        }
    }

    /// Transition: pending -> running.
    pub fn start(&mut self) -> Result<()> {
        match &self.status {
            RunStatus::Pending { .. } => {
                let now = Utc::now();
                self.status = RunStatus::Running {
                    started_at: now,
                    current_stage: None,
                };
                self.updated_at = now;
                Ok(())
            }
            _ => Err(self.invalid_transition("running")),
        }
    }

    /// Update the stage currently executing (running runs only).
    pub fn enter_stage(&mut self, stage_name: &str) -> Result<()> {
        match &mut self.status {
            RunStatus::Running { current_stage, .. } => {
                *current_stage = Some(stage_name.to_string());
                self.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(self.invalid_transition("enter_stage")),
        }
    }

    /// Transition: running -> succeeded.
    pub fn complete(&mut self) -> Result<()> {
        match &self.status {
            RunStatus::Running { started_at, .. } => {
                let now = Utc::now();
                let duration_ms = (now - *started_at).num_milliseconds().max(0) as u64;
                self.status = RunStatus::Succeeded {
                    started_at: *started_at,
                    finished_at: now,
                    duration_ms,
                };
                self.updated_at = now;
                Ok(())
            }
            _ => Err(self.invalid_transition("succeeded")),
        }
    }

    /// Transition: running -> failed, recording the phase and (for stage
    /// failures) the index of the failing stage.
    pub fn fail(
        &mut self,
        phase: RunPhase,
        failed_stage_index: Option<usize>,
        error: String,
    ) -> Result<()> {
        match &self.status {
            RunStatus::Running { started_at, .. } => {
                let now = Utc::now();
                self.status = RunStatus::Failed {
                    started_at: *started_at,
                    failed_at: now,
                    phase,
                    failed_stage_index,
                    error,
                };
                self.updated_at = now;
                Ok(())
            }
            _ => Err(self.invalid_transition("failed")),
        }
    }

    pub fn stage_index(&self, stage_name: &str) -> Option<usize> {
        self.stage_names.iter().position(|name| name == stage_name)
    }

    fn invalid_transition(&self, to: &str) -> PipelineError {
        PipelineError::InvalidStateTransition {
            from: self.status.state_name().to_string(),
            to: to.to_string(),
        }
    }
}
