//! Meridian fence engine.
//!
//! Geofence hooks, the detection matrix that turns committed mutations
//! into events, the durable outbound queue behind `queue.db`, and the
//! webhook delivery workers.

mod delivery;
mod detect;
mod error;
mod hook;
mod queue;

pub use delivery::DeliveryHub;
pub use detect::{spawn_engine, MutationNotice, RoamView};
pub use error::{FenceError, Result};
pub use hook::{Detect, DetectMask, FenceRegion, Hook, HookRegistry, Trigger};
pub use queue::{OutboundQueue, QueuedEvent};
