use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use stepwire_core::broker::{
    Broker, InMemoryBroker, RedisStreamBroker, SubscriptionConfig,
};
use stepwire_core::coordination::{
    InMemoryWorkflowStore, StepCoordinator, WorkflowStore,
};
use stepwire_core::messaging::{Publisher, Subscriber};
use stepwire_core::persistence::PgWorkflowStore;
use stepwire_core::rpc::server_rpc_catalog;
use stepwire_core::task_queue::task_catalog;
use tracing::{info, warn};

use crate::handlers::rpc::{ServerRpc, server_rpc};
use crate::handlers::task_queue::task_handlers;
use crate::infra::app_state::{AppState, Workers};
use crate::infra::config::{BrokerConfig, BrokerKind, Config, DatabaseConfig};

/// The broker the process is wired to, kept concrete so shutdown can reach
/// transport-specific teardown.
#[derive(Debug, Clone)]
pub enum BrokerHandle {
    Memory(InMemoryBroker),
    Redis(Arc<RedisStreamBroker>),
}

impl BrokerHandle {
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        match config.kind {
            BrokerKind::Memory => {
                info!("Using in-memory broker");
                Ok(Self::Memory(InMemoryBroker::new()))
            }
            BrokerKind::Redis => {
                let redis = config
                    .redis_stream_config()
                    .context("redis broker selected without a redis url")?;
                let broker = RedisStreamBroker::connect(redis)
                    .await
                    .context("failed to connect to Redis broker")?;
                Ok(Self::Redis(Arc::new(broker)))
            }
        }
    }

    pub fn as_broker(&self) -> Arc<dyn Broker> {
        match self {
            Self::Memory(broker) => Arc::new(broker.clone()),
            Self::Redis(broker) => Arc::clone(broker) as Arc<dyn Broker>,
        }
    }

    pub async fn shutdown(&self) {
        if let Self::Redis(broker) = self {
            broker.shutdown().await;
        }
    }
}

pub async fn connect_postgres(config: &DatabaseConfig, url: &str) -> Result<PgWorkflowStore> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections.unwrap_or(10))
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL")?;
    Ok(PgWorkflowStore::new(pool))
}

/// Opens the configured store, applying migrations to PostgreSQL.
pub async fn connect_store(config: &DatabaseConfig) -> Result<Arc<dyn WorkflowStore>> {
    let Some(url) = config.url.as_deref() else {
        warn!("No database configured; workflow state will not survive a restart");
        return Ok(Arc::new(InMemoryWorkflowStore::new()));
    };
    let store = connect_postgres(config, url).await?;
    store
        .migrate()
        .await
        .context("database migration failed")?;
    info!(store = ?store, "Connected to PostgreSQL");
    Ok(Arc::new(store))
}

/// Everything `serve` needs once connections are up.
#[derive(Debug)]
pub struct Runtime {
    pub state: AppState,
    pub workers: Arc<Workers>,
    pub broker: BrokerHandle,
}

pub fn build_runtime(
    config: &Config,
    broker: BrokerHandle,
    store: Arc<dyn WorkflowStore>,
) -> Result<Runtime> {
    let transport = broker.as_broker();
    let task_catalog = Arc::new(task_catalog().context("invalid task catalog")?);
    let tasks = Publisher::new(
        Arc::clone(&transport),
        Arc::clone(&task_catalog),
        config.broker.task_topic.as_str(),
    );
    let coordinator = StepCoordinator::new(store, tasks);

    let settings = config
        .subscriber
        .settings(config.broker.dead_letter_topic.clone());
    let subscription = |topic: &str| {
        SubscriptionConfig::new(topic, config.broker.subscription.as_str())
            .with_consumer_name(config.broker.consumer_name.as_str())
            .with_max_in_flight(config.broker.max_in_flight)
    };

    let task_queue = Subscriber::new(
        Arc::clone(&transport),
        subscription(&config.broker.task_topic),
        task_handlers(task_catalog, coordinator.clone())
            .context("failed to register task handlers")?,
        settings.clone(),
    );
    let rpc = server_rpc(
        transport,
        Arc::new(server_rpc_catalog().context("invalid server rpc catalog")?),
        ServerRpc::new(coordinator.clone()),
        subscription(&config.broker.rpc_request_topic),
        settings,
    )
    .context("failed to register server rpc handlers")?;

    let workers = Arc::new(Workers { task_queue, rpc });
    Ok(Runtime {
        state: AppState::new(coordinator).with_workers(Arc::clone(&workers)),
        workers,
        broker,
    })
}
