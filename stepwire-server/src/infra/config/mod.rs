pub mod loader;
pub mod models;
pub mod sources;

pub use loader::{
    ConfigLoad, ConfigLoadError, ConfigLoader, ConfigWarning, ConfigWarnings,
};
pub use models::{
    BrokerConfig, BrokerKind, Config, ConfigMetadata, DatabaseConfig,
    FailurePolicyKind, ServerConfig, SubscriberConfig,
};
