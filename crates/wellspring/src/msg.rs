//! The control↔worker message bridge
//!
//! A strict request/reply pair of SPSC rings: the control context pushes one
//! message, then waits for exactly one acknowledgment before it sends the
//! next. The worker services messages in order. Neither side takes a lock;
//! waiting is a yield-spin, which is fine because the worker services its
//! queue every cycle and replies are tiny.

use std::time::Duration;

use crate::listener::WorkerListener;
use crate::source::SourceState;
use crate::volume::{ChannelVolumes, LatencyRange};

use uuid::Uuid;

/// Messages the control context sends to the realtime worker
#[derive(Debug)]
pub enum WorkerMessage {
    AddListener(WorkerListener),
    /// Reply carries the worker half back out, which is what the move-all
    /// protocol relies on
    RemoveListener(Uuid),
    SetState(SourceState),
    SetSoftVolume(ChannelVolumes),
    GetVolume,
    SetSoftMute(bool),
    GetMute,
    GetLatency,
    GetRequestedLatency,
    SetLatencyRange(LatencyRange),
    GetLatencyRange,
    SetMaxRewind(usize),
    GetMaxRewind,
    /// Worker starts honoring its snapshot (driver thread is live)
    Attach,
    Detach,
}

/// Acknowledgments from the worker, one per message
#[derive(Debug)]
pub enum WorkerReply {
    Done,
    Listener(Option<WorkerListener>),
    Volume(ChannelVolumes),
    Mute(bool),
    Latency(Duration),
    RequestedLatency(Option<Duration>),
    LatencyRange(LatencyRange),
    MaxRewind(usize),
}

/// Control end of the bridge
#[derive(Debug)]
pub struct ControlLink {
    tx: rtrb::Producer<WorkerMessage>,
    rx: rtrb::Consumer<WorkerReply>,
}

/// Worker end of the bridge
#[derive(Debug)]
pub struct WorkerLink {
    rx: rtrb::Consumer<WorkerMessage>,
    tx: rtrb::Producer<WorkerReply>,
}

/// Build a bridge with room for `capacity` in-flight messages
pub fn worker_channel(capacity: usize) -> (ControlLink, WorkerLink) {
    let (msg_tx, msg_rx) = rtrb::RingBuffer::new(capacity.max(1));
    let (reply_tx, reply_rx) = rtrb::RingBuffer::new(capacity.max(1));
    (
        ControlLink {
            tx: msg_tx,
            rx: reply_rx,
        },
        WorkerLink {
            rx: msg_rx,
            tx: reply_tx,
        },
    )
}

impl ControlLink {
    /// Send one message and wait for its acknowledgment
    pub fn request(&mut self, msg: WorkerMessage) -> WorkerReply {
        let mut msg = msg;
        loop {
            match self.tx.push(msg) {
                Ok(()) => break,
                Err(rtrb::PushError::Full(m)) => {
                    msg = m;
                    std::thread::yield_now();
                }
            }
        }
        loop {
            match self.rx.pop() {
                Ok(reply) => return reply,
                Err(rtrb::PopError::Empty) => std::thread::yield_now(),
            }
        }
    }
}

impl WorkerLink {
    pub(crate) fn pop(&mut self) -> Option<WorkerMessage> {
        self.rx.pop().ok()
    }

    pub(crate) fn reply(&mut self, reply: WorkerReply) {
        let mut reply = reply;
        loop {
            match self.tx.push(reply) {
                Ok(()) => return,
                Err(rtrb::PushError::Full(r)) => {
                    reply = r;
                    std::thread::yield_now();
                }
            }
        }
    }
}
