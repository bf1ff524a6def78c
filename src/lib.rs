#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # docbatch-core
//!
//! Batch orchestration engine for bulk document conversion.
//!
//! ## Overview
//!
//! A submitted batch (a zip of office documents) becomes a **job**. The job is
//! expanded into one **unit** per member, units are converted in parallel by a
//! bounded worker pool with per-unit retry, and when the last unit reaches a
//! terminal state a **completion barrier** releases exactly one caller, which
//! finalizes the job: the converted outputs are packaged and the job gets its
//! terminal status.
//!
//! ## Module Organization
//!
//! - [`orchestration`] - Expander, worker pool, finalizer, recovery and the engine boundary
//! - [`barrier`] - Per-job fan-in counter with release-once semantics
//! - [`store`] - Job and unit persistence (in-memory and PostgreSQL)
//! - [`state_machine`] - Job and unit lifecycles
//! - [`services`] - Batch source, converter and packager boundaries with shipped adapters
//! - [`models`] - Job and unit records
//! - [`events`] - Lifecycle event broadcast
//! - [`config`] - Layered configuration
//! - [`logging`] - Structured logging setup
//! - [`database`] - PostgreSQL connection and schema (feature `postgres`)
//! - [`error`] - Crate-level error type
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use docbatch_core::config::ConfigManager;
//! use docbatch_core::orchestration::SystemBootstrap;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config_manager = ConfigManager::load()?;
//! let system = SystemBootstrap::in_memory(&config_manager);
//!
//! let job_id = system.submit("/uploads/contracts.zip").await?;
//! let report = system
//!     .wait_for_terminal(job_id, Duration::from_secs(600))
//!     .await?;
//! println!("{} finished as {}", report.job_id, report.status);
//!
//! system.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod barrier;
pub mod config;
#[cfg(feature = "postgres")]
pub mod database;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod services;
pub mod state_machine;
pub mod store;

pub use barrier::{BarrierError, BarrierSignal, CompletionBarrier, InMemoryCompletionBarrier};
pub use config::{BatchConfig, ConfigManager, ConfigurationError};
pub use error::{BatchError, Result};
pub use events::{EventPublisher, LifecycleEvent};
pub use models::{Job, JobCounts, Unit, UnitOutcome};
pub use orchestration::{
    JobStatusReport, OrchestrationSystem, ResultLookup, SystemBootstrap, SystemContext,
    UnitStatusReport,
};
pub use services::{
    BatchSource, CommandConverter, ConversionError, ConversionRequest, Converter,
    DirectoryBatchSource, ExpansionError, Packager, PackagingError, SourceItem, ZipBatchSource,
    ZipPackager,
};
pub use state_machine::{JobState, UnitState};
pub use store::{InMemoryStateStore, StateStore, StoreError};
