pub mod config;
pub mod logging_config;

pub use config::{
    Config, ConfigError, LocalConfig, QueryConfig, RemoteConfig, RetrievalConfig, StrategyKind,
};
pub use logging_config::LoggingConfig;
