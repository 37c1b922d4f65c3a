//! AOF errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AofError {
    #[error("aof io error: {0}")]
    Io(#[from] std::io::Error),

    /// A record in the log does not follow the wire grammar. Only possible
    /// through external corruption; replay stops at the previous record.
    #[error("aof corrupt at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },

    /// A shrink was requested while another one is still running.
    #[error("shrink already in progress")]
    ShrinkInProgress,
}

pub type Result<T> = std::result::Result<T, AofError>;
