use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use stepwire_core::broker::RedisStreamConfig;
use stepwire_core::messaging::{FailurePolicy, SubscriberSettings};
use stepwire_core::rpc::DEFAULT_SERVER_RPC_TOPIC;
use stepwire_core::task_queue::DEFAULT_TASK_TOPIC;

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub broker: BrokerConfig,
    pub subscriber: SubscriberConfig,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 3030,
        }
    }
}

#[derive(Clone, Default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: Option<u32>,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Redis,
    Memory,
}

impl FromStr for BrokerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(BrokerKind::Redis),
            "memory" | "in-memory" => Ok(BrokerKind::Memory),
            other => Err(format!("expected `redis` or `memory`, got `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    pub redis_url: Option<String>,
    pub key_prefix: String,
    pub task_topic: String,
    pub rpc_request_topic: String,
    pub dead_letter_topic: Option<String>,
    /// Subscription name shared by every server instance.
    pub subscription: String,
    pub consumer_name: String,
    pub poll_interval: Duration,
    pub claim_idle: Duration,
    pub scheduler_poll: Duration,
    pub max_in_flight: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Redis,
            redis_url: None,
            key_prefix: "stepwire".to_owned(),
            task_topic: DEFAULT_TASK_TOPIC.to_owned(),
            rpc_request_topic: DEFAULT_SERVER_RPC_TOPIC.to_owned(),
            dead_letter_topic: None,
            subscription: "stepwire-server".to_owned(),
            consumer_name: "stepwire-server".to_owned(),
            poll_interval: Duration::from_millis(100),
            claim_idle: Duration::from_secs(60),
            scheduler_poll: Duration::from_millis(500),
            max_in_flight: 32,
        }
    }
}

impl BrokerConfig {
    pub fn redis_stream_config(&self) -> Option<RedisStreamConfig> {
        let url = self.redis_url.clone()?;
        Some(RedisStreamConfig {
            url,
            key_prefix: self.key_prefix.clone(),
            poll_interval: self.poll_interval,
            claim_idle: self.claim_idle,
            schedule_poll_interval: self.scheduler_poll,
            ..RedisStreamConfig::default()
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicyKind {
    Redeliver,
    Acknowledge,
}

impl FromStr for FailurePolicyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redeliver" => Ok(FailurePolicyKind::Redeliver),
            "acknowledge" | "ack" => Ok(FailurePolicyKind::Acknowledge),
            other => Err(format!(
                "expected `redeliver` or `acknowledge`, got `{other}`"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub failure_policy: FailurePolicyKind,
    pub max_redeliveries: u32,
    pub handler_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicyKind::Redeliver,
            max_redeliveries: 5,
            handler_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl SubscriberConfig {
    pub fn settings(&self, dead_letter_topic: Option<String>) -> SubscriberSettings {
        let failure_policy = match self.failure_policy {
            FailurePolicyKind::Redeliver => FailurePolicy::Redeliver {
                max_redeliveries: self.max_redeliveries,
            },
            FailurePolicyKind::Acknowledge => FailurePolicy::AcknowledgeOnFailure,
        };
        SubscriberSettings {
            failure_policy,
            handler_timeout: Some(self.handler_timeout),
            shutdown_timeout: self.shutdown_timeout,
            dead_letter_topic,
        }
    }
}

/// Where the configuration came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub env_file_loaded: bool,
    pub config_path: Option<PathBuf>,
}
