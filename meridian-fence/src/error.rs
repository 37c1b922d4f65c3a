//! Fence and queue errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum FenceError {
    #[error("queue io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("queue corrupt at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    /// Hook endpoints must be http(s) URLs.
    #[error("invalid hook endpoint '{0}'")]
    InvalidEndpoint(String),
}

pub type Result<T> = std::result::Result<T, FenceError>;
