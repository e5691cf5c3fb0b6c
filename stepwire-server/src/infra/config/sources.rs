use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Raw configuration as defined in a TOML file.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub server: FileServerConfig,
    #[serde(default)]
    pub database: FileDatabaseConfig,
    #[serde(default)]
    pub broker: FileBrokerConfig,
    #[serde(default)]
    pub subscriber: FileSubscriberConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

/// Durations are humantime strings such as `"250ms"` or `"1m 30s"`.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileBrokerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_request_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_letter_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_idle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler_poll: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileSubscriberConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_redeliveries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handler_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shutdown_timeout: Option<String>,
}

/// Environment-derived configuration values. Kept as raw strings so the
/// loader can report which variable failed to parse.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub server_host: Option<String>,
    pub server_port: Option<String>,
    pub database_url: Option<String>,
    pub database_max_connections: Option<String>,
    pub broker_kind: Option<String>,
    pub redis_url: Option<String>,
    pub task_topic: Option<String>,
    pub rpc_request_topic: Option<String>,
    pub dead_letter_topic: Option<String>,
    pub subscription: Option<String>,
    pub consumer_name: Option<String>,
    pub max_in_flight: Option<String>,
    pub failure_policy: Option<String>,
    pub max_redeliveries: Option<String>,
    pub handler_timeout: Option<String>,
    pub shutdown_timeout: Option<String>,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: var("STEPWIRE_CONFIG").map(PathBuf::from),
            server_host: var("SERVER_HOST"),
            server_port: var("SERVER_PORT"),
            database_url: var("DATABASE_URL"),
            database_max_connections: var("DATABASE_MAX_CONNECTIONS"),
            broker_kind: var("BROKER_KIND"),
            redis_url: var("REDIS_URL"),
            task_topic: var("TASK_TOPIC"),
            rpc_request_topic: var("RPC_REQUEST_TOPIC"),
            dead_letter_topic: var("DEAD_LETTER_TOPIC"),
            subscription: var("BROKER_SUBSCRIPTION"),
            consumer_name: var("BROKER_CONSUMER_NAME"),
            max_in_flight: var("BROKER_MAX_IN_FLIGHT"),
            failure_policy: var("SUBSCRIBER_FAILURE_POLICY"),
            max_redeliveries: var("SUBSCRIBER_MAX_REDELIVERIES"),
            handler_timeout: var("SUBSCRIBER_HANDLER_TIMEOUT"),
            shutdown_timeout: var("SUBSCRIBER_SHUTDOWN_TIMEOUT"),
        }
    }
}
