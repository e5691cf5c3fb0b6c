use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use url::Url;

use super::models::{
    BrokerConfig, BrokerKind, Config, ConfigMetadata, DatabaseConfig, ServerConfig,
    SubscriberConfig,
};
use super::sources::{EnvConfig, FileConfig};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["stepwire.toml", "config/stepwire.toml"];

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid duration for {key}: {value:?} ({source})")]
    InvalidDuration {
        key: &'static str,
        value: String,
        #[source]
        source: humantime::DurationError,
    },

    #[error("invalid value for {key}: {value:?} ({reason})")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("invalid url for {key}: {source}")]
    InvalidUrl {
        key: &'static str,
        #[source]
        source: url::ParseError,
    },

    #[error("broker.kind is `redis` but no REDIS_URL / broker.redis_url is set")]
    MissingRedisUrl,
}

/// A non-fatal configuration issue, reported once logging is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push(&mut self, message: impl Into<String>, hint: Option<&str>) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: hint.map(str::to_owned),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}

/// Layers `.env`, an optional TOML file and the process environment.
/// Environment values win over file values; CLI flags are applied by the
/// caller on top of the result.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    load_env_file: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_path: None,
            load_env_file: true,
        }
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn without_env_file(mut self) -> Self {
        self.load_env_file = false;
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        let env_file_loaded = self.load_env_file && dotenvy::dotenv().is_ok();
        let env = EnvConfig::gather();

        let path = self
            .config_path
            .clone()
            .or_else(|| env.config_path.clone())
            .or_else(|| {
                DEFAULT_CONFIG_PATHS
                    .iter()
                    .map(PathBuf::from)
                    .find(|path| path.is_file())
            });
        let file = match path.as_deref() {
            Some(path) => read_file_config(path)?,
            None => FileConfig::default(),
        };

        let mut load = compose(file, env)?;
        load.config.metadata = ConfigMetadata {
            env_file_loaded,
            config_path: path,
        };
        Ok(load)
    }
}

pub fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigLoadError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&raw).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn duration(
    key: &'static str,
    env: Option<String>,
    file: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigLoadError> {
    match env.or(file) {
        Some(value) => humantime::parse_duration(&value).map_err(|source| {
            ConfigLoadError::InvalidDuration { key, value, source }
        }),
        None => Ok(default),
    }
}

fn parsed<T>(key: &'static str, value: Option<String>) -> Result<Option<T>, ConfigLoadError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|value| {
            value.parse::<T>().map_err(|err| ConfigLoadError::InvalidValue {
                key,
                reason: err.to_string(),
                value,
            })
        })
        .transpose()
}

fn checked_url(
    key: &'static str,
    value: Option<String>,
    schemes: &[&str],
) -> Result<Option<String>, ConfigLoadError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let parsed =
        Url::parse(&value).map_err(|source| ConfigLoadError::InvalidUrl { key, source })?;
    if !schemes.contains(&parsed.scheme()) {
        return Err(ConfigLoadError::InvalidValue {
            key,
            reason: format!("expected one of {schemes:?}, got `{}`", parsed.scheme()),
            value: parsed.scheme().to_owned(),
        });
    }
    Ok(Some(value))
}

/// Merges file and environment values over the defaults.
pub fn compose(file: FileConfig, env: EnvConfig) -> Result<ConfigLoad, ConfigLoadError> {
    let mut warnings = ConfigWarnings::default();

    let server_defaults = ServerConfig::default();
    let server = ServerConfig {
        host: env
            .server_host
            .or(file.server.host)
            .unwrap_or(server_defaults.host),
        port: parsed("SERVER_PORT", env.server_port)?
            .or(file.server.port)
            .unwrap_or(server_defaults.port),
    };

    let database = DatabaseConfig {
        url: checked_url(
            "DATABASE_URL",
            env.database_url.or(file.database.url),
            &["postgres", "postgresql"],
        )?,
        max_connections: parsed("DATABASE_MAX_CONNECTIONS", env.database_max_connections)?
            .or(file.database.max_connections),
    };

    let broker_defaults = BrokerConfig::default();
    let fb = file.broker;
    let broker = BrokerConfig {
        kind: parsed::<BrokerKind>("broker.kind", env.broker_kind.or(fb.kind))?
            .unwrap_or(broker_defaults.kind),
        redis_url: checked_url(
            "REDIS_URL",
            env.redis_url.or(fb.redis_url),
            &["redis", "rediss", "redis+unix"],
        )?,
        key_prefix: fb.key_prefix.unwrap_or(broker_defaults.key_prefix),
        task_topic: env
            .task_topic
            .or(fb.task_topic)
            .unwrap_or(broker_defaults.task_topic),
        rpc_request_topic: env
            .rpc_request_topic
            .or(fb.rpc_request_topic)
            .unwrap_or(broker_defaults.rpc_request_topic),
        dead_letter_topic: env.dead_letter_topic.or(fb.dead_letter_topic),
        subscription: env
            .subscription
            .or(fb.subscription)
            .unwrap_or(broker_defaults.subscription),
        consumer_name: env
            .consumer_name
            .or(fb.consumer_name)
            .unwrap_or(broker_defaults.consumer_name),
        poll_interval: duration(
            "broker.poll_interval",
            None,
            fb.poll_interval,
            broker_defaults.poll_interval,
        )?,
        claim_idle: duration(
            "broker.claim_idle",
            None,
            fb.claim_idle,
            broker_defaults.claim_idle,
        )?,
        scheduler_poll: duration(
            "broker.scheduler_poll",
            None,
            fb.scheduler_poll,
            broker_defaults.scheduler_poll,
        )?,
        max_in_flight: parsed("BROKER_MAX_IN_FLIGHT", env.max_in_flight)?
            .or(fb.max_in_flight)
            .unwrap_or(broker_defaults.max_in_flight),
    };

    let subscriber_defaults = SubscriberConfig::default();
    let fs = file.subscriber;
    let subscriber = SubscriberConfig {
        failure_policy: parsed(
            "subscriber.failure_policy",
            env.failure_policy.or(fs.failure_policy),
        )?
        .unwrap_or(subscriber_defaults.failure_policy),
        max_redeliveries: parsed("SUBSCRIBER_MAX_REDELIVERIES", env.max_redeliveries)?
            .or(fs.max_redeliveries)
            .unwrap_or(subscriber_defaults.max_redeliveries),
        handler_timeout: duration(
            "subscriber.handler_timeout",
            env.handler_timeout,
            fs.handler_timeout,
            subscriber_defaults.handler_timeout,
        )?,
        shutdown_timeout: duration(
            "subscriber.shutdown_timeout",
            env.shutdown_timeout,
            fs.shutdown_timeout,
            subscriber_defaults.shutdown_timeout,
        )?,
    };

    if broker.kind == BrokerKind::Redis && broker.redis_url.is_none() {
        return Err(ConfigLoadError::MissingRedisUrl);
    }
    if database.url.is_none() {
        warnings.push(
            "no database configured, workflow state is kept in memory",
            Some("set DATABASE_URL to persist runs, steps and delays"),
        );
    }
    if broker.dead_letter_topic.is_none() {
        warnings.push(
            "no dead-letter topic configured, undeliverable messages are dropped",
            Some("set DEAD_LETTER_TOPIC to keep them for inspection"),
        );
    }
    if broker.max_in_flight == 0 {
        warnings.push("broker.max_in_flight is 0, using 1", None);
    }

    Ok(ConfigLoad {
        config: Config {
            server,
            database,
            broker,
            subscriber,
            metadata: ConfigMetadata::default(),
        },
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::config::models::FailurePolicyKind;

    fn memory_env() -> EnvConfig {
        EnvConfig {
            broker_kind: Some("memory".into()),
            ..EnvConfig::default()
        }
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let load = compose(FileConfig::default(), memory_env()).unwrap();
        assert_eq!(load.config.server.port, 3030);
        assert_eq!(load.config.broker.task_topic, "workflows-task-queue");
        assert_eq!(load.config.broker.rpc_request_topic, "workflows-server-rpc");
        assert_eq!(load.config.subscriber.max_redeliveries, 5);
        assert_eq!(load.warnings.items.len(), 2);
    }

    #[test]
    fn environment_overrides_file_values() {
        let file: FileConfig = toml::from_str(
            r#"
            [server]
            port = 8080

            [broker]
            kind = "memory"
            task_topic = "from-file"

            [subscriber]
            failure_policy = "acknowledge"
            handler_timeout = "5s"
            "#,
        )
        .unwrap();
        let env = EnvConfig {
            server_port: Some("9090".into()),
            handler_timeout: Some("250ms".into()),
            ..EnvConfig::default()
        };

        let config = compose(file, env).unwrap().config;

        assert_eq!(config.server.port, 9090);
        assert_eq!(config.broker.task_topic, "from-file");
        assert_eq!(config.subscriber.failure_policy, FailurePolicyKind::Acknowledge);
        assert_eq!(config.subscriber.handler_timeout, Duration::from_millis(250));
    }

    #[test]
    fn redis_broker_requires_a_url() {
        let err = compose(FileConfig::default(), EnvConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigLoadError::MissingRedisUrl));
    }

    #[test]
    fn bad_values_name_their_key() {
        let env = EnvConfig {
            shutdown_timeout: Some("soon".into()),
            ..memory_env()
        };
        let err = compose(FileConfig::default(), env).unwrap_err();
        assert!(matches!(
            err,
            ConfigLoadError::InvalidDuration {
                key: "subscriber.shutdown_timeout",
                ..
            }
        ));

        let env = EnvConfig {
            server_port: Some("eighty".into()),
            ..memory_env()
        };
        assert!(matches!(
            compose(FileConfig::default(), env).unwrap_err(),
            ConfigLoadError::InvalidValue { key: "SERVER_PORT", .. }
        ));
    }

    #[test]
    fn urls_must_use_a_supported_scheme() {
        let env = EnvConfig {
            redis_url: Some("redis://cache:6379".into()),
            database_url: Some("mysql://db/stepwire".into()),
            ..EnvConfig::default()
        };
        assert!(matches!(
            compose(FileConfig::default(), env).unwrap_err(),
            ConfigLoadError::InvalidValue { key: "DATABASE_URL", .. }
        ));

        let env = EnvConfig {
            redis_url: Some("not a url".into()),
            ..EnvConfig::default()
        };
        assert!(matches!(
            compose(FileConfig::default(), env).unwrap_err(),
            ConfigLoadError::InvalidUrl { key: "REDIS_URL", .. }
        ));

        let env = EnvConfig {
            redis_url: Some("redis://cache:6379".into()),
            database_url: Some("postgres://db/stepwire".into()),
            ..EnvConfig::default()
        };
        let load = compose(FileConfig::default(), env).unwrap();
        assert!(load.config.broker.redis_stream_config().is_some());
        assert_eq!(load.warnings.items.len(), 1);
    }

    #[test]
    fn unknown_file_keys_are_rejected() {
        let parsed: Result<FileConfig, _> = toml::from_str("[brokr]\nkind = \"memory\"\n");
        assert!(parsed.is_err());
    }
}
