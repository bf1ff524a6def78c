use serde::Serialize;
use uuid::Uuid;

use crate::state_machine::JobState;

/// Event names as published on the lifecycle channel
pub mod constants {
    pub const JOB_EXPANDED: &str = "job.expanded";
    pub const JOB_EXPANSION_FAILED: &str = "job.expansion_failed";
    pub const JOB_CANCEL_REQUESTED: &str = "job.cancel_requested";
    pub const UNIT_COMPLETED: &str = "unit.completed";
    pub const UNIT_RETRYING: &str = "unit.retrying";
    pub const UNIT_FAILED: &str = "unit.failed";
    pub const JOB_FINALIZED: &str = "job.finalized";
}

/// Job and unit lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    JobExpanded {
        job_id: Uuid,
        total_units: u32,
    },
    JobExpansionFailed {
        job_id: Uuid,
        error: String,
    },
    JobCancelRequested {
        job_id: Uuid,
    },
    UnitCompleted {
        job_id: Uuid,
        unit_id: Uuid,
        attempt: u32,
    },
    UnitRetrying {
        job_id: Uuid,
        unit_id: Uuid,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    UnitFailed {
        job_id: Uuid,
        unit_id: Uuid,
        attempt: u32,
        error: String,
    },
    JobFinalized {
        job_id: Uuid,
        status: JobState,
        completed_units: u32,
        failed_units: u32,
        archive_ref: Option<String>,
    },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobExpanded { .. } => constants::JOB_EXPANDED,
            Self::JobExpansionFailed { .. } => constants::JOB_EXPANSION_FAILED,
            Self::JobCancelRequested { .. } => constants::JOB_CANCEL_REQUESTED,
            Self::UnitCompleted { .. } => constants::UNIT_COMPLETED,
            Self::UnitRetrying { .. } => constants::UNIT_RETRYING,
            Self::UnitFailed { .. } => constants::UNIT_FAILED,
            Self::JobFinalized { .. } => constants::JOB_FINALIZED,
        }
    }

    pub fn job_id(&self) -> Uuid {
        match self {
            Self::JobExpanded { job_id, .. }
            | Self::JobExpansionFailed { job_id, .. }
            | Self::JobCancelRequested { job_id }
            | Self::UnitCompleted { job_id, .. }
            | Self::UnitRetrying { job_id, .. }
            | Self::UnitFailed { job_id, .. }
            | Self::JobFinalized { job_id, .. } => *job_id,
        }
    }

    /// Whether the job reached a terminal status with this event
    pub fn is_job_terminal(&self) -> bool {
        matches!(
            self,
            Self::JobExpansionFailed { .. } | Self::JobFinalized { .. }
        )
    }
}
