use thiserror::Error;

use crate::Extents2D;

/// Failure reported by an [`crate::ImageBackend`] when it cannot produce an image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocError {
    #[error("out of memory allocating a {0} image")]
    OutOfMemory(Extents2D),
    #[error("device lost")]
    DeviceLost,
    #[error("backend error: {0}")]
    Backend(String),
}

/// An error type for the image pool.
#[derive(Error, Debug)]
pub enum PoolError {
    /// The backend could not allocate an image, even after the pool released
    /// every reclaimable image and retried. Callers are expected to skip the
    /// work that needed the image.
    #[error("no image available for {extents} request: {source}")]
    AllocationExhausted {
        extents: Extents2D,
        #[source]
        source: AllocError,
    },
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
}

/// Configuration loading and validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("figment: {0}")]
    Figment(#[from] Box<figment::Error>),
    #[error("quantum must be at least 1")]
    InvalidQuantum,
    #[error("max area ratio must be a finite value >= 1.0, got {0}")]
    InvalidAreaRatio(f64),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// A result type that can be used to indicate errors.
pub type Result<T, E = PoolError> = std::result::Result<T, E>;
