//! The consensus core: a replicated log of client writes with a key/value
//! state machine, driven by leader election and quorum replication over an
//! unreliable datagram network.

mod log;
mod message;
mod node;
mod server;
mod state;

pub use log::{Entry, Index, Log, Term};
pub use message::{Envelope, Message, ReplicaID, BROADCAST};
pub use node::{Node, Options, Ticks};
pub use server::Server;
pub use state::KvStore;

/// The duration of a logical clock tick. All protocol timers are counted in
/// ticks of this length, derived from a single monotonic clock in the server.
pub const TICK_INTERVAL: std::time::Duration = std::time::Duration::from_millis(10);

/// The randomized election timeout range for followers and candidates, in
/// ticks. This is high enough to avoid votes commonly being split, and low
/// enough to react to a dead leader quickly.
pub const ELECTION_TIMEOUT_RANGE: std::ops::Range<Ticks> = 15..30;

/// The interval between leader heartbeats, in ticks.
pub const HEARTBEAT_INTERVAL: Ticks = 5;

/// The interval between leader put-batch flushes, in ticks. Trades client
/// write latency for fewer per-peer append messages.
pub const BATCH_INTERVAL: Ticks = 1;

/// The length of the leader's quorum watchdog window, in ticks. A leader
/// that hears from less than a quorum within a window considers itself
/// stranded in a minority partition.
pub const QUORUM_WINDOW: Ticks = 30;

/// Maximum number of buffered client puts before the batch is flushed early.
pub const MAX_BATCH_PUTS: usize = 64;

/// Maximum number of log entries to send in a single append message.
pub const MAX_APPEND_ENTRIES: usize = 128;
