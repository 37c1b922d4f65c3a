//! Meridian append-only log.
//!
//! The authoritative on-disk state: serialized mutating commands in
//! execution order. Provides the durable writer with its fsync policies,
//! startup replay, shrink (log compaction with offset preservation), and
//! the tailing reader that feeds follower replication.

mod aof;
mod error;
mod tail;

pub use aof::{Aof, FsyncPolicy, Progress, ShrinkJob};
pub use error::{AofError, Result};
pub use tail::{Tail, TailReader};
