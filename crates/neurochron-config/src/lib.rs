//! KDL configuration parsing for NeuroChron.
//!
//! This crate handles parsing of:
//! - System configuration (neurochron.kdl)
//! - Variable interpolation in collaborator command lines

pub mod error;
pub mod system;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    ConverterConfig, DEFAULT_CONFIG_PATH, DatabaseConfig, DispatcherConfig, LogFormat,
    NotifierBackend, NotifierConfig, PredictorConfig, PreprocessorConfig, RetryConfig,
    ServerConfig, StageRetryConfig, StorageConfig, SystemConfig, parse_system_config,
};
pub use variables::TemplateContext;
