//! Wellspring: generic audio capture source
//!
//! A capture device is a *dual-context* object. The control half lives on the
//! server's single cooperative event loop; the realtime half runs on a
//! per-device worker that must never block on anything shared with the
//! control context. There are no locks between the two halves:
//!
//! - **Control** ([`Source`]): state machine, volume/mute/port/latency
//!   surface, listener attach/detach, suspend causes, the move-all protocol
//! - **Worker** ([`SourceWorker`]): posts captured blocks to listeners,
//!   services rewinds, and owns the synchronized snapshot ([`ThreadInfo`])
//!
//! Every control-initiated write travels over an SPSC message ring and waits
//! for the worker's acknowledgment, so the control-side copy and the
//! snapshot never observably diverge once a setter returns. Fields the
//! worker reads every cycle (gain, cork, latency requirements) are shared
//! atomics with relaxed ordering, the same pattern as a mixer channel.

pub mod listener;
pub mod msg;
pub mod source;
pub mod suspend;
pub mod volume;
pub mod worker;

pub use listener::{Listener, ListenerConfig, WorkerListener};
pub use msg::{worker_channel, ControlLink, WorkerLink, WorkerMessage, WorkerReply};
pub use source::{
    DriverOp, MoveQueue, Port, Source, SourceConfig, SourceDriver, SourceError, SourceFlags,
    SourceState, MAX_LISTENERS_PER_SOURCE,
};
pub use suspend::{SuspendCause, SuspendCauses};
pub use volume::{ChannelVolumes, LatencyRange, MAX_CHANNELS};
pub use worker::{SourceWorker, ThreadInfo};
