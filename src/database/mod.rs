//! # Database Operations
//!
//! PostgreSQL plumbing shared by [`PgStateStore`](crate::store::PgStateStore)
//! and [`PgCompletionBarrier`](crate::barrier::PgCompletionBarrier).
//!
//! ## Key Components
//!
//! - [`connection`] - Pool construction from [`DatabaseConfig`](crate::config::DatabaseConfig)
//! - [`migrations`] - Schema setup guarded by a PostgreSQL advisory lock
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use docbatch_core::config::DatabaseConfig;
//! use docbatch_core::database::{DatabaseConnection, DatabaseMigrations};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = DatabaseConnection::connect(&DatabaseConfig::default()).await?;
//! DatabaseMigrations::run_all(db.pool()).await?;
//! # Ok(())
//! # }
//! ```

pub mod connection;
pub mod migrations;

pub use connection::DatabaseConnection;
pub use migrations::DatabaseMigrations;
