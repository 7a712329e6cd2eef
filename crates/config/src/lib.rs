//! Configuration management for the voice call client
//!
//! Supports loading configuration from:
//! - TOML/YAML/JSON files (`config/default`, `config/{env}`)
//! - Environment variables (VOICE_CLIENT_ prefix, `__` separator)

pub mod constants;
pub mod settings;

pub use settings::{
    load_settings, load_settings_from, AudioConfig, CredentialsConfig, ObservabilityConfig,
    ProviderConfig, ReconnectConfig, SessionConfig, Settings, TerminationConfig,
};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

impl From<ConfigError> for voice_client_core::CallError {
    fn from(err: ConfigError) -> Self {
        voice_client_core::CallError::Configuration(err.to_string())
    }
}
