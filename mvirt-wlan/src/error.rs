//! Crate-level error type
//!
//! Only invocation-level outcomes are errors. Per-packet failures are
//! counted and dropped inside the datapath and never surface here.

use thiserror::Error;

use crate::config::ConfigError;
use crate::datapath::desc_pool::{DescFault, PoolError};
use crate::datapath::ring::RingError;

/// Errors returned by datapath entry points
#[derive(Debug, Error)]
pub enum RxError {
    #[error("ring {ring} access failed: {source}")]
    RingAccess { ring: u8, source: RingError },

    #[error("refill ring of pool {pool} access failed: {source}")]
    RefillAccess { pool: u8, source: RingError },

    #[error("ring {ring} reported an unrecoverable error")]
    RingFault { ring: u8 },

    #[error("descriptor desynchronization: {0}")]
    Desync(#[from] DescFault),

    #[error("no pool with id {0}")]
    UnknownPool(u8),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("datapath is missing {0}")]
    Incomplete(&'static str),
}

pub type Result<T> = std::result::Result<T, RxError>;
