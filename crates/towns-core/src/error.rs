//! Error types for the towns core

use crate::cache::CacheStatus;
use thiserror::Error;

/// Main error type for the towns core
#[derive(Error, Debug)]
pub enum TownsError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Failed to initialize the database: {0}")]
    Initialization(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("No such record: {0}")]
    Missing(String),

    #[error("Exception attempting to access unloaded {name} cache (current state: {status})")]
    CacheNotLoaded { name: String, status: CacheStatus },

    #[error("Illegal transition of the {name} cache from {from} to {to}")]
    IllegalTransition {
        name: String,
        from: CacheStatus,
        to: CacheStatus,
    },

    #[error("The database has not been initialized")]
    NotLoaded,

    #[error("{name} migration failed: {message}")]
    Migration { name: String, message: String },

    #[error("Database error: {0}")]
    Database(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TownsError {
    /// Wrap an engine or driver failure
    pub fn database(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        TownsError::Database(Box::new(err))
    }

    /// Whether a caller should show a "try again" message rather than fail
    pub fn is_cache_not_loaded(&self) -> bool {
        matches!(self, TownsError::CacheNotLoaded { .. })
    }
}

impl From<config::ConfigError> for TownsError {
    fn from(err: config::ConfigError) -> Self {
        TownsError::Configuration(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TownsError>;
