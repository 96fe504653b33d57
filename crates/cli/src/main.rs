use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use vmstress_config::{Config, Credential};
use vmstress_runner::sim::SimCompute;
use vmstress_runner::{wipe_servers, ComputeBackend, RunOptions, SessionDriver};

#[derive(Parser)]
#[command(name = "vmstress", version, about = "randomized lifecycle stress driver for compute instances")]
struct Cli {
    /// Config file (defaults to .vmstress.toml in the current directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the randomized lifecycle loop until the deadline
    Run {
        /// Override run duration in seconds
        #[arg(long)]
        duration: Option<u64>,
        /// Override poll interval in seconds
        #[arg(long)]
        poll_interval: Option<u64>,
        /// One tokio task per session instead of sequential sessions
        #[arg(long)]
        parallel: bool,
        /// Delete all existing servers before the run starts
        #[arg(long)]
        wipe: bool,
        /// Fixed RNG seed for reproducible operation sequences
        #[arg(long)]
        seed: Option<u64>,
        /// Drive the in-process simulated compute service
        #[arg(long)]
        simulate: bool,
    },
    /// Delete every server of every configured credential set, then exit
    Wipe {
        /// Wipe the in-process simulated compute service
        #[arg(long)]
        simulate: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load(path)?,
        None => Config::load_from_dir(&std::env::current_dir()?)?,
    };
    Ok(config)
}

/// One backend per credential set. The wire client to a real compute
/// service is not wired up here; without --simulate there is nothing to
/// talk to.
fn backends(
    credentials: &[Credential],
    simulate: bool,
) -> anyhow::Result<Vec<(Credential, Arc<dyn ComputeBackend>)>> {
    if !simulate {
        anyhow::bail!("no compute client configured, run with --simulate");
    }
    Ok(credentials
        .iter()
        .map(|credential| {
            let backend: Arc<dyn ComputeBackend> = Arc::new(SimCompute::new());
            (credential.clone(), backend)
        })
        .collect())
}

async fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            duration,
            poll_interval,
            parallel,
            wipe,
            seed,
            simulate,
        } => {
            let config = load_config(cli.config.as_ref())?;
            let mut options = RunOptions::from_config(&config.run);
            if let Some(secs) = duration {
                options.duration = std::time::Duration::from_secs(secs);
            }
            if let Some(secs) = poll_interval {
                options.poll_interval = std::time::Duration::from_secs(secs);
            }
            options.parallel |= parallel;
            options.wipe |= wipe;
            if seed.is_some() {
                options.seed = seed;
            }

            let driver = SessionDriver::new(backends(&config.credentials, simulate)?, options);
            let stats = driver.run().await?;

            for (credential, session_stats) in config.credentials.iter().zip(&stats) {
                info!(
                    session = %credential.name,
                    dispatched = session_stats.dispatched,
                    completed = session_stats.completed,
                    expected_errors = session_stats.expected_errors,
                    removed = session_stats.removed,
                    per_op = %session_stats.per_op_summary(),
                    "session finished"
                );
            }
        }
        Commands::Wipe { simulate } => {
            let config = load_config(cli.config.as_ref())?;
            for (credential, backend) in backends(&config.credentials, simulate)? {
                let deleted = wipe_servers(backend.as_ref()).await?;
                println!("{}: deleted {} server(s)", credential.name, deleted);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
