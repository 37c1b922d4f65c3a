//! Meridian wire protocol.
//!
//! RESP framing shared by the client transport, the AOF record format, and
//! the replication stream; the validated command model; and the reply
//! encoders for the RESP and JSON dialects.

pub mod command;
pub mod error;
pub mod reply;
pub mod resp;

pub use command::{
    Command, CommandDesc, Dialect, GetFormat, HookSpec, NearbyCmd, QueryOutput, RegionSpec,
    ScanCmd, SearchCmd, SetCmd, SetHookCmd,
};
pub use error::{ProtocolError, Result};
pub use reply::{encode_json, encode_json_error, encode_resp, encode_resp_error, Reply};
pub use resp::{decode_record, encode_array, parse_request};
