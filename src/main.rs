//! searchd-sentinel - main entry point.

use std::sync::Arc;

use tracing::error;
use tracing_subscriber::EnvFilter;

use sentinel::agent::Agent;
use sentinel::cli::{Cli, Commands};
use sentinel::clock::SystemClock;
use sentinel::config::AgentConfig;
use sentinel::engine::EngineConnector;
use sentinel::SentinelError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse_args();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "configuration failed");
            std::process::exit(1);
        }
    };

    let result = run(&cli, config).await;

    if let Err(err) = result {
        error!(error = %err, "agent tick failed");
        // Fatal conditions terminate with a non-zero status; the
        // orchestrator restarts us and the next tick retries.
        std::process::exit(err.exit_code());
    }
}

fn load_config(cli: &Cli) -> Result<AgentConfig, SentinelError> {
    let mut config = match &cli.config {
        Some(path) => AgentConfig::from_file(path)?,
        None if cli.dev => AgentConfig::development(),
        None => AgentConfig::default(),
    };

    if cli.dev {
        config.dev_mode = true;
    }

    config.validate()?;
    Ok(config)
}

async fn run(cli: &Cli, config: AgentConfig) -> Result<(), SentinelError> {
    match cli.command {
        Commands::Run => Agent::production(config)?.reconcile().await,
        Commands::Optimize => Agent::production(config)?.optimize_tick().await,
        Commands::Status => print_status(config).await,
    }
}

async fn print_status(config: AgentConfig) -> Result<(), SentinelError> {
    let mut connector = EngineConnector::connect(
        &config.engine.host,
        config.engine.worker_port,
        Some(&config.engine.cluster_name),
        config.engine.max_attempts,
        config.engine.binary_port,
        Arc::new(SystemClock),
    )
    .await?;

    println!("cluster:  {}", config.full_cluster_name());
    println!("member:   {}", connector.cluster_name_matches().await?);
    println!("primary:  {}", connector.is_primary().await?);
    match connector.view_nodes().await? {
        Some(nodes) => println!("nodes:    {}", nodes),
        None => println!("nodes:    (no cluster)"),
    }

    let tables = connector.tables(false, None).await?;
    println!("tables:   {}", tables.join(", "));

    Ok(())
}
