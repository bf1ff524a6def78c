//! # Unit Model
//!
//! One member of a batch, converted independently. Maps to `docbatch_units`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state_machine::UnitState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub unit_id: Uuid,
    pub job_id: Uuid,
    /// Member name as it appeared in the batch, shown in status reports
    pub source_name: String,
    /// Locator handed to the converter
    pub source_ref: String,
    pub status: UnitState,
    /// Attempts started so far; a claim consumes one
    pub attempt_count: u32,
    /// Set only when `status` is `FAILED`
    pub error: Option<String>,
    /// Set only when `status` is `COMPLETED`
    pub output_ref: Option<String>,
    /// Start of the current attempt
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Unit {
    pub fn new(job_id: Uuid, source_name: impl Into<String>, source_ref: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            unit_id: Uuid::new_v4(),
            job_id,
            source_name: source_name.into(),
            source_ref: source_ref.into(),
            status: UnitState::Pending,
            attempt_count: 0,
            error: None,
            output_ref: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Outcome of the final attempt of a unit, applied as one terminal transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitOutcome {
    Completed { output_ref: String },
    Failed { error: String },
}

impl UnitOutcome {
    pub fn status(&self) -> UnitState {
        match self {
            Self::Completed { .. } => UnitState::Completed,
            Self::Failed { .. } => UnitState::Failed,
        }
    }
}
