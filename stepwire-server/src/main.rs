//! # Stepwire Server
//!
//! Coordinating server for long-running workflows. Consumes the task queue
//! and the server RPC topic, and exposes the trigger endpoints the upstream
//! API calls.

use std::{net::SocketAddr, path::PathBuf};

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use stepwire_server::{
    infra::{
        config::{Config, ConfigLoad, ConfigLoader},
        startup::{BrokerHandle, build_runtime, connect_postgres, connect_store},
    },
    routes,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "stepwire-server")]
#[command(about = "Coordinating server for long-running workflows")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    serve: ServeArgs,
}

#[derive(ClapArgs, Debug, Clone)]
struct ServeArgs {
    /// Path to a TOML config file
    #[arg(long, env = "STEPWIRE_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Server port (overrides config)
    #[arg(short, long, env = "SERVER_PORT", global = true)]
    port: Option<u16>,

    /// Server host (overrides config)
    #[arg(long, env = "SERVER_HOST", global = true)]
    host: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the server (default)
    Serve,
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_runtime_config(&cli.serve)?;

    match cli.command {
        Some(Command::Db(DbCommand::Migrate)) => run_db_migrate(&config).await,
        Some(Command::Serve) | None => run_server(config).await,
    }
}

fn load_runtime_config(args: &ServeArgs) -> anyhow::Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = args.config.clone() {
        loader = loader.with_config_path(path);
    }
    let ConfigLoad {
        mut config,
        warnings,
    } = loader.load().context("failed to load configuration")?;

    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host.clone() {
        config.server.host = host;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(
                |_| "info,stepwire=debug,tower_http=warn".into(),
            ),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    for warning in &warnings.items {
        match warning.hint.as_deref() {
            Some(hint) => warn!(warning = %warning.message, hint, "configuration warning"),
            None => warn!(warning = %warning.message, "configuration warning"),
        }
    }
    if let Some(path) = config.metadata.config_path.as_ref() {
        info!(path = %path.display(), "Loaded config file");
    }
    if config.metadata.env_file_loaded {
        info!("Loaded .env file");
    }

    Ok(config)
}

async fn run_db_migrate(config: &Config) -> anyhow::Result<()> {
    let url = config
        .database
        .url
        .as_deref()
        .context("DATABASE_URL is required for `db migrate`")?;
    let store = connect_postgres(&config.database, url).await?;
    store.migrate().await.context("database migration failed")?;
    info!("Database migrations applied successfully");
    Ok(())
}

async fn run_server(config: Config) -> anyhow::Result<()> {
    let broker = BrokerHandle::connect(&config.broker).await?;
    let store = connect_store(&config.database).await?;
    let runtime = build_runtime(&config, broker, store)?;

    if let Err(consumer) = runtime.workers.start().await {
        runtime.broker.shutdown().await;
        anyhow::bail!("failed to start {consumer} consumer");
    }
    info!(
        task_topic = %config.broker.task_topic,
        rpc_topic = %config.broker.rpc_request_topic,
        "Consumers started"
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid listen address {}:{}",
                config.server.host, config.server.port
            )
        })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Server listening on http://{}", addr);

    let app = routes::create_app(runtime.state.clone());
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("Shutting down consumers");
    if let Err(err) = runtime.workers.close().await {
        error!(error = %err, "consumer shutdown did not complete cleanly");
    }
    runtime.broker.shutdown().await;

    served.context("HTTP server failed")?;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("Received ctrl-c");
}
