use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;

use fedavg_coordinator::config::LogFormat;
use fedavg_coordinator::logging::init_logging;
use fedavg_coordinator::transport::{router, RegistryState};
use fedavg_coordinator::{
    CheckpointStore, ClientPool, FedError, FileCheckpointStore, ParameterVector, RoundNumber,
    RoundScheduler, ServerConfig,
};

/// Federated averaging coordination server
#[derive(Parser, Debug)]
#[command(name = "fedavg-server")]
#[command(about = "Round-based federated averaging coordinator")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "fedavg-server.toml")]
    config: PathBuf,

    /// Number of rounds (overrides config file)
    #[arg(short, long)]
    rounds: Option<RoundNumber>,

    /// Successful updates required per round (overrides config file)
    #[arg(short = 'c', long)]
    min_clients: Option<usize>,

    /// Registry listen address, e.g. 0.0.0.0:8080
    #[arg(short, long)]
    listen: Option<String>,

    /// CBOR-encoded initial parameters
    #[arg(long)]
    initial_model: Option<PathBuf>,

    /// Checkpoint directory
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,

    /// Continue from the latest checkpoint in the checkpoint directory
    #[arg(long)]
    resume: bool,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Override log format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,

    /// Write the default configuration to --config and exit
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Server failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    if cli.generate_config {
        ServerConfig::default().save(&cli.config)?;
        println!("Generated default configuration at: {}", cli.config.display());
        return Ok(ExitCode::SUCCESS);
    }

    let config = load_config(&cli)?;
    init_logging(&config.logging.level, config.logging.format)?;
    tracing::info!(version = fedavg_coordinator::VERSION, "Starting fedavg-server");

    let store = Arc::new(
        FileCheckpointStore::open(&config.checkpoint.dir).with_context(|| {
            format!("opening checkpoint directory {}", config.checkpoint.dir.display())
        })?,
    );
    let (initial, first_round) = initial_model(&config, store.as_ref(), cli.resume)?;
    let total_rounds = config.rounds.total_rounds;
    let min_clients = config.rounds.min_clients;
    if first_round > total_rounds {
        tracing::info!(first_round, total_rounds, "All rounds already checkpointed, nothing to do");
        return Ok(ExitCode::SUCCESS);
    }

    let pool = Arc::new(ClientPool::new());
    let mut scheduler = RoundScheduler::new(
        config.round_settings(),
        initial,
        Arc::clone(&pool),
        config.strategy()?,
        store.clone(),
    )?;

    let state = RegistryState {
        pool,
        http: reqwest::Client::new(),
        progress: scheduler.subscribe(),
    };
    let addr = config.listen_address()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(address = %listener.local_addr()?, "Registry listening");
    let server = tokio::spawn(async move { axum::serve(listener, router(state)).await });

    let outcome = tokio::select! {
        result = scheduler.run_from(first_round, total_rounds, min_clients) => Some(result),
        _ = signal::ctrl_c() => None,
    };
    server.abort();

    match outcome {
        Some(Ok(summary)) => {
            let path = store.dir().join("history.json");
            std::fs::write(&path, summary.history.to_json()?)
                .with_context(|| format!("writing {}", path.display()))?;
            tracing::info!(
                rounds = summary.history.len(),
                history = %path.display(),
                "Training complete"
            );
            Ok(ExitCode::SUCCESS)
        }
        Some(Err(e)) => {
            tracing::error!(error = %e, "Training aborted");
            Ok(ExitCode::FAILURE)
        }
        None => {
            tracing::warn!("Received shutdown signal, stopping before the run finished");
            Ok(ExitCode::from(130))
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<ServerConfig> {
    let mut config = if cli.config.exists() {
        ServerConfig::load(&cli.config)?
    } else {
        ServerConfig::default()
    };

    if let Some(rounds) = cli.rounds {
        config.rounds.total_rounds = rounds;
    }
    if let Some(min_clients) = cli.min_clients {
        config.rounds.min_clients = min_clients;
        config.rounds.min_available_clients = config.rounds.min_available_clients.max(min_clients);
    }
    if let Some(listen) = &cli.listen {
        config.server.listen_address = listen.clone();
    }
    if let Some(path) = &cli.initial_model {
        config.checkpoint.initial_model = Some(path.clone());
    }
    if let Some(dir) = &cli.checkpoint_dir {
        config.checkpoint.dir = dir.clone();
    }
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }

    config.validate()?;
    Ok(config)
}

/// Parameters to start from and the first round to run.
fn initial_model(
    config: &ServerConfig,
    store: &dyn CheckpointStore,
    resume: bool,
) -> anyhow::Result<(ParameterVector, RoundNumber)> {
    if resume {
        match store.latest() {
            Ok(checkpoint) => {
                tracing::info!(round = checkpoint.round, "Resuming from checkpoint");
                return Ok((checkpoint.parameters, checkpoint.round + 1));
            }
            Err(FedError::EmptyStore) => {
                tracing::warn!("No checkpoint to resume from, starting from the initial model");
            }
            Err(e) => return Err(e.into()),
        }
    }

    let Some(path) = &config.checkpoint.initial_model else {
        bail!("no initial model: set checkpoint.initial_model or pass --initial-model");
    };
    Ok((read_model(path)?, 1))
}

fn read_model(path: &Path) -> anyhow::Result<ParameterVector> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let parameters = ParameterVector::from_cbor(&bytes)
        .with_context(|| format!("decoding initial model {}", path.display()))?;
    tracing::info!(
        path = %path.display(),
        layers = parameters.num_layers(),
        params = parameters.num_params(),
        "Loaded initial model"
    );
    Ok(parameters)
}
