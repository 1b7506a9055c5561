use thiserror::Error;

use crate::cache::{BackendError, CacheWarmError, PoolError};

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backing store error: {0}")]
    Store(#[from] BackendError),
    #[error("connection pool error: {0}")]
    Pool(#[from] PoolError),
    #[error("cache warmer error: {0}")]
    Warmer(#[from] CacheWarmError),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
}

impl InfraError {
    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}
