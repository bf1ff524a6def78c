//! # Orchestration Engine
//!
//! Fan-out / fan-in execution of document batches.
//!
//! ## Core Components
//!
//! - **BatchExpander**: turns a submitted batch into units, fixes the job's
//!   unit count and seeds the completion barrier before dispatching
//! - **WorkerPool** / **UnitExecutor**: bounded parallel execution of unit
//!   attempts with timeout, retry and exponential backoff
//! - **JobFinalizer**: runs once per job in the worker that drains the barrier,
//!   packages outputs and writes the terminal status
//! - **StuckUnitSweeper**: periodic repair of stuck attempts, orphaned
//!   dispatches and missed barrier notifications
//! - **OrchestrationSystem**: the running engine and its submit / status /
//!   result / cancel boundary
//! - **SystemBootstrap**: builds an engine from configuration

pub mod batch_expander;
pub mod bootstrap;
pub mod context;
pub mod job_finalizer;
pub mod orchestration_system;
pub mod recovery;
pub mod types;
pub mod unit_executor;
pub mod worker_pool;

pub use batch_expander::{BatchExpander, ExpansionResult};
pub use bootstrap::{DefaultServices, SystemBootstrap};
pub use context::SystemContext;
pub use job_finalizer::{FinalizationAction, FinalizationError, FinalizationResult, JobFinalizer};
pub use orchestration_system::OrchestrationSystem;
pub use recovery::{StuckUnitSweeper, SweepReport};
pub use types::{JobStatusReport, ResultLookup, UnitDispatch, UnitStatusReport};
pub use unit_executor::{UnitExecutionOutcome, UnitExecutor, CANCELLED_BEFORE_START};
pub use worker_pool::{dispatch_channel, DispatchHandle, WorkerPool};
