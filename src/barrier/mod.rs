//! # Completion Barrier
//!
//! Per-job fan-in gate. The barrier is seeded once with the number of units,
//! then receives one notification per unit terminal transition. The
//! decrement-and-test is atomic: across any number of concurrent notifiers,
//! exactly one observes [`BarrierSignal::Released`], and that caller runs the
//! job finalizer.
//!
//! Notified unit ids are recorded so a duplicate notification is rejected
//! instead of driving the counter past zero, and so recovery can tell which
//! terminal units never reached the barrier.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

pub use memory::InMemoryCompletionBarrier;
#[cfg(feature = "postgres")]
pub use postgres::PgCompletionBarrier;

/// Result of a single barrier notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierSignal {
    /// Other units are still outstanding
    Pending { outstanding: u32 },
    /// This notification drained the barrier
    Released,
}

impl BarrierSignal {
    pub fn is_released(&self) -> bool {
        matches!(self, Self::Released)
    }
}

#[derive(Debug, Error)]
pub enum BarrierError {
    #[error("Barrier for job {job_id} is already seeded")]
    AlreadySeeded { job_id: Uuid },

    #[error("Barrier for job {job_id} cannot be seeded with zero units")]
    ZeroSeed { job_id: Uuid },

    #[error("Barrier for job {job_id} was never seeded")]
    NotSeeded { job_id: Uuid },

    #[error("Unit {unit_id} already notified the barrier for job {job_id}")]
    DuplicateNotification { job_id: Uuid, unit_id: Uuid },

    #[error("Barrier for job {job_id} is already drained; notification from unit {unit_id} has nothing to release")]
    Exhausted { job_id: Uuid, unit_id: Uuid },

    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl BarrierError {
    /// Every variant except storage failures means a caller broke the
    /// seed-once / notify-once contract
    pub fn is_contract_violation(&self) -> bool {
        match self {
            #[cfg(feature = "postgres")]
            Self::Database(_) => false,
            _ => true,
        }
    }
}

pub type BarrierResult<T> = Result<T, BarrierError>;

#[async_trait]
pub trait CompletionBarrier: Send + Sync + 'static {
    /// Initialize the outstanding counter. Called exactly once per job, before
    /// any unit can notify.
    async fn seed(&self, job_id: Uuid, total_units: u32) -> BarrierResult<()>;

    /// Record `unit_id`'s terminal transition and decrement the counter
    async fn notify(&self, job_id: Uuid, unit_id: Uuid) -> BarrierResult<BarrierSignal>;

    /// Outstanding units, `None` when the job has no barrier
    async fn outstanding(&self, job_id: Uuid) -> BarrierResult<Option<u32>>;

    async fn has_notified(&self, job_id: Uuid, unit_id: Uuid) -> BarrierResult<bool>;

    /// Drop barrier state once the job is terminal
    async fn retire(&self, job_id: Uuid) -> BarrierResult<()>;
}
