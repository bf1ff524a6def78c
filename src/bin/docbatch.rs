//! # docbatch
//!
//! Command-line driver for the batch conversion engine.
//!
//! ```bash
//! docbatch run uploads/contracts.zip --work-dir /var/tmp/docbatch
//! docbatch validate-config --config-dir config --environment production
//! ```

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use docbatch_core::config::ConfigManager;
use docbatch_core::logging::init_structured_logging;
use docbatch_core::orchestration::SystemBootstrap;
use docbatch_core::ResultLookup;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "docbatch")]
#[command(about = "Convert batches of office documents")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration directory (default: ./config)
    #[arg(short, long, global = true)]
    config_dir: Option<PathBuf>,

    /// Environment override (default: DOCBATCH_ENV, APP_ENV, then development)
    #[arg(short, long, global = true)]
    environment: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a zip batch, wait for it to finish and print the status report as JSON
    Run {
        /// Zip archive of documents to convert
        batch: PathBuf,

        /// Override `storage.work_dir`
        #[arg(short, long)]
        work_dir: Option<PathBuf>,

        /// State backend
        #[arg(long, value_enum, default_value_t = StoreKind::Memory)]
        store: StoreKind,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 3600)]
        timeout_secs: u64,
    },

    /// Load and validate configuration, then print it with secrets masked
    ValidateConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Memory,
    Postgres,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(err) = execute(cli).await {
        error!("{err:#}");
        eprintln!("❌ {err:#}");
        process::exit(1);
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let environment = cli
        .environment
        .clone()
        .unwrap_or_else(ConfigManager::detect_environment);
    let config_manager =
        ConfigManager::load_from_directory_with_env(cli.config_dir.clone(), &environment)
            .context("failed to load configuration")?;

    match cli.command {
        Commands::ValidateConfig => {
            println!("✅ Configuration is valid ({environment})");
            println!(
                "{}",
                serde_json::to_string_pretty(&config_manager.debug_config())?
            );
            Ok(())
        }
        Commands::Run {
            batch,
            work_dir,
            store,
            timeout_secs,
        } => {
            let config_manager = match work_dir {
                Some(work_dir) => {
                    let mut config = config_manager.config().clone();
                    config.storage.work_dir = work_dir;
                    ConfigManager::from_config(config, &environment)?
                }
                None => config_manager,
            };
            init_structured_logging(&config_manager.config().logging, &environment);

            let batch = batch
                .canonicalize()
                .with_context(|| format!("batch not found: {}", batch.display()))?;

            let system = match store {
                StoreKind::Memory => SystemBootstrap::in_memory(&config_manager),
                #[cfg(feature = "postgres")]
                StoreKind::Postgres => SystemBootstrap::postgres(&config_manager).await?,
                #[cfg(not(feature = "postgres"))]
                StoreKind::Postgres => bail!("built without the `postgres` feature"),
            };

            let job_id = system.submit(batch.display().to_string()).await?;
            info!(job_id = %job_id, batch = %batch.display(), "Batch submitted");

            let waited = system
                .wait_for_terminal(job_id, Duration::from_secs(timeout_secs))
                .await;
            let result = system.get_result(job_id).await;
            system.shutdown().await;

            let report = waited?;
            println!("{}", serde_json::to_string_pretty(&report)?);

            match result? {
                ResultLookup::Ready { archive_ref } => {
                    eprintln!("📦 Result archive: {archive_ref}");
                    Ok(())
                }
                ResultLookup::Unavailable { status } => {
                    bail!("job {job_id} finished as {status} without a result archive")
                }
                other => bail!("unexpected result lookup for job {job_id}: {other:?}"),
            }
        }
    }
}
