use serde::{Deserialize, Serialize};

/// Events that can trigger job state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum JobEvent {
    /// The expander picked the job up
    StartExpansion,
    /// Enumeration failed or produced zero members
    ExpansionFailed(String),
    /// Units were created and the total fixed
    UnitsExpanded(u32),
    /// The completion barrier drained
    AllUnitsTerminal {
        total: u32,
        completed: u32,
        failed: u32,
    },
    /// Packaging of completed outputs failed
    PackagingFailed(String),
    /// The drained job's records could not be finalized as they stand
    FinalizationFailed(String),
}

impl JobEvent {
    /// Get a string representation of the event type for logging
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StartExpansion => "start_expansion",
            Self::ExpansionFailed(_) => "expansion_failed",
            Self::UnitsExpanded(_) => "units_expanded",
            Self::AllUnitsTerminal { .. } => "all_units_terminal",
            Self::PackagingFailed(_) => "packaging_failed",
            Self::FinalizationFailed(_) => "finalization_failed",
        }
    }

    /// Extract error message if this is a failure event
    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::ExpansionFailed(msg)
            | Self::PackagingFailed(msg)
            | Self::FinalizationFailed(msg) => Some(msg),
            _ => None,
        }
    }
}

/// Events that can trigger unit state transitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum UnitEvent {
    /// A worker claims the unit for a new attempt
    Claim,
    /// The converter produced an output
    Succeed(String),
    /// The attempt failed and attempts remain
    Retry,
    /// The attempt failed and no attempts remain
    Fail(String),
    /// The job was cancelled before this unit started
    Abandon(String),
}

impl UnitEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Succeed(_) => "succeed",
            Self::Retry => "retry",
            Self::Fail(_) => "fail",
            Self::Abandon(_) => "abandon",
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Self::Fail(msg) | Self::Abandon(msg) => Some(msg),
            _ => None,
        }
    }

    /// Check if this event represents a terminal transition
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeed(_) | Self::Fail(_) | Self::Abandon(_))
    }
}
