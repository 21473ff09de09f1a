//! PALF: Paxos-backed append-only log replication core.
//!
//! A `PalfEnv` owns the per-partition consensus handles of one server; a
//! `LogRequestHandler` validates inbound messages and routes them to the
//! right handle. Outbound messages are queued on an `Outbox` whose receiver
//! side is drained by the embedding network layer.

#[macro_use]
mod utils;

mod dispatch;
mod env;
mod palf;
mod storage;
mod transport;

#[cfg(test)]
mod test_utils;

pub use utils::{logger_init, PalfError, ME};

pub use dispatch::LogRequestHandler;
pub use env::{PalfEnv, PalfHandleGuard, ResourceMonitor};
pub use palf::*;
pub use storage::{LogStorage, MemLogStorage};
pub use transport::{OutboundMsg, Outbox, OutboxReceiver};
