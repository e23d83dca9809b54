//! Core pid/connection subsystem of a media filter framework.
//!
//! Filters are opaque processing units declaring input/output
//! capabilities; the core wires them into a running dataflow graph:
//!
//! - capability matching and weighted shortest-chain resolution over the
//!   registered filter implementations ([`caps`], graph resolution);
//! - the dynamic connection lifecycle: init, connect, reconfigure,
//!   detach, swap and disconnect of pid instances while packets are in
//!   flight;
//! - backpressure: per-pid buffer occupancy, producer blocking and
//!   end-of-stream propagation.
//!
//! The core never spawns threads. All work is expressed as [`Task`]
//! values queued on the [`Session`]; an embedding scheduler pops and
//! runs them, or uses the bundled single-threaded [`Session::run_tasks`]
//! pump.

pub mod caps;
mod error;
pub mod events;
mod filter;
pub(crate) mod flow;
mod graph;
mod link;
mod packet;
mod pid;
pub mod props;
mod registry;
mod session;
mod task;
mod template;
pub mod util;

pub use error::{Error, Result};
pub use events::Event;
pub use filter::Filter;
pub use packet::{ClockType, Packet, PacketBuilder, PacketFlags};
pub use pid::{Pid, PidInst, PidStats, SPEED_SCALER};
pub use registry::{
    ConfigureCb, FilterRegister, ProcessCb, ProcessEventCb, ReconfigureOutputCb, RegFlags,
    RegisterBuilder,
};
pub use session::{Session, SessionConfig};
pub use task::{Task, TaskKind, TaskResult, REQUEUE_DELAY_US};
pub use template::resolve_file_template;
