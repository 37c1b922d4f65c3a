//! Protocol-level errors.
//!
//! Everything here maps to a per-connection error reply; none of these take
//! the server down.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Byte stream does not follow the RESP grammar. The connection is
    /// closed after this one.
    #[error("invalid message: {0}")]
    Framing(String),

    /// Unknown command name.
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// Arity or clause mismatch for a known command.
    #[error("wrong number of arguments for '{0}' command")]
    WrongArity(&'static str),

    /// A value that does not parse or an unexpected token.
    #[error("invalid argument '{0}'")]
    InvalidArgument(String),

    /// Geometry input that failed validation.
    #[error(transparent)]
    Geometry(#[from] meridian_core::CoreError),

    /// Argument bytes that must be UTF-8 but are not.
    #[error("invalid utf-8 in argument")]
    Utf8,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
