use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use jobrelay::config::{Config, SchedulerConfig};
use jobrelay::destination::build_destinations;
use jobrelay::orchestrator::Orchestrator;
use jobrelay::picker::PickerRegistry;
use jobrelay::registry::ApplicationRegistry;
use jobrelay::scheduler::queue::run_worker;
use jobrelay::shutdown::Shutdown;
use jobrelay::store::MemoryJobStore;

#[derive(Parser, Debug)]
#[command(name = "jobrelay")]
#[command(about = "Job-brokering middleware: dispatches jobs to configured destinations")]
struct Args {
    /// Path of the YAML configuration file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the job orchestrator until shutdown
    Serve,
    /// Run workers draining the redis queue destinations
    Perform {
        /// Only drain this destination
        #[arg(long)]
        destination: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::from_file(&args.config)?;

    match args.command {
        Command::Serve => serve(config).await,
        Command::Perform { destination } => perform(config, destination).await,
    }
}

/// Build the core from the configuration and run the reconcile loop until
/// a shutdown signal arrives. An embedding web service drives submissions
/// through [`Orchestrator::submit`]; this bootstrap wires the in-memory
/// store so the core can run stand-alone.
async fn serve(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(&config.job_root_dir)?;

    let registry = Arc::new(ApplicationRegistry::from_config(&config)?);
    let destinations = build_destinations(&config.destinations)?;
    let picker = PickerRegistry::new().build(&config.destination_picker)?;
    let store = Arc::new(MemoryJobStore::new());
    let shutdown = Shutdown::new();
    shutdown.install_signal_handler();

    tracing::info!(
        job_root = %config.job_root_dir.display(),
        applications = config.applications.len(),
        destinations = config.destinations.len(),
        picker = %config.destination_picker,
        "starting job orchestrator"
    );

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        registry,
        destinations,
        picker,
        config.job_root_dir.clone(),
        shutdown.clone(),
    ));
    orchestrator.startup().await?;
    Arc::clone(&orchestrator).run().await;
    orchestrator.close_destinations().await;
    tracing::info!("orchestrator stopped");
    Ok(())
}

/// Run a worker loop for every redis queue destination in the config.
async fn perform(
    config: Config,
    only_destination: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = Shutdown::new();
    shutdown.install_signal_handler();
    let mut workers = Vec::new();
    for (name, destination) in &config.destinations {
        if let Some(only) = &only_destination {
            if name != only {
                continue;
            }
        }
        if let SchedulerConfig::Arq {
            redis_dsn,
            queue,
            max_jobs,
            job_timeout,
        } = &destination.scheduler
        {
            tracing::info!(destination = %name, queue = %queue, "starting queue worker");
            let redis_dsn = redis_dsn.clone();
            let queue = queue.clone();
            let max_jobs = *max_jobs;
            let job_timeout = *job_timeout;
            let token = shutdown.token().clone();
            workers.push(tokio::spawn(async move {
                run_worker(&redis_dsn, &queue, max_jobs, job_timeout, token).await
            }));
        }
    }
    if workers.is_empty() {
        return Err("no queue destinations to perform against".into());
    }
    for worker in workers {
        if let Err(e) = worker.await? {
            tracing::error!(error = %e, "queue worker failed");
        }
    }
    Ok(())
}
