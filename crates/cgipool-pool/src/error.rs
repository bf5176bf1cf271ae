//! Pool error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while managing worker pools.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("pool already registered: {0}")]
    DuplicatePool(String),

    #[error("failed to publish upstreams to {}: {source}", path.display())]
    Publish {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] cgipool_core::ConfigError),
}

pub type PoolResult<T> = Result<T, PoolError>;
