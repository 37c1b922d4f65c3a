//! Server errors and their wire messages.
//!
//! Per-connection errors (parse, argument, state, resource) become error
//! replies and leave the connection open. Fatal errors (cannot open the
//! AOF, cannot bind) abort startup with a diagnostic.

use meridian_aof::AofError;
use meridian_core::CoreError;
use meridian_fence::FenceError;
use meridian_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Aof(#[from] AofError),

    #[error(transparent)]
    Fence(#[from] FenceError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key not found")]
    KeyNotFound,

    #[error("id not found")]
    IdNotFound,

    #[error("authentication required")]
    AuthRequired,

    #[error("invalid password")]
    InvalidPassword,

    #[error("no password is set")]
    NoPasswordSet,

    /// Mutating client command on a follower.
    #[error("follower is read only")]
    ReadOnly,

    /// The max-memory soft cap would be exceeded.
    #[error("out of memory")]
    OutOfMemory,

    #[error("append-only file is disabled")]
    AofDisabled,

    #[error("unsupported config parameter '{0}'")]
    UnknownConfigParam(String),

    #[error("invalid config value: {0}")]
    InvalidConfigValue(String),

    /// Commands that only make sense on the RESP transport (SYNC).
    #[error("command not supported over http")]
    NotOverHttp,
}

impl ServerError {
    /// Whether the connection should be closed after this error.
    pub fn is_framing(&self) -> bool {
        matches!(self, ServerError::Protocol(ProtocolError::Framing(_)))
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
