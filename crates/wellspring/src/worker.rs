//! The realtime half of a source
//!
//! [`SourceWorker`] runs on the per-device worker thread. It owns the
//! synchronized snapshot ([`ThreadInfo`]) outright: the control context never
//! touches it directly, it only sends typed messages over the bridge and
//! waits for acknowledgment. The worker drains that queue every cycle in
//! [`SourceWorker::process_messages`], posts captured blocks with
//! [`SourceWorker::post`], and services rewinds.
//!
//! Nothing on this path allocates after construction and nothing blocks on
//! state shared with the control context.

use std::time::Duration;

use tracing::trace;

use crate::listener::WorkerListener;
use crate::msg::{WorkerLink, WorkerMessage, WorkerReply};
use crate::source::SourceState;
use crate::volume::{ChannelVolumes, LatencyRange};

/// Largest block `post` will forward in one call, in samples
const MAX_BLOCK_SAMPLES: usize = 8192;

/// The synchronized snapshot the worker reads every cycle
///
/// Mirrors the control-side fields the realtime path needs. Mutated only by
/// servicing bridge messages; read only on the worker.
#[derive(Debug)]
pub struct ThreadInfo {
    pub state: SourceState,
    listeners: Vec<WorkerListener>,
    pub soft_volume: ChannelVolumes,
    pub soft_muted: bool,
    requested_latency: Option<Duration>,
    requested_latency_valid: bool,
    pub max_rewind: usize,
    pub latency_range: LatencyRange,
    fixed_latency: Option<Duration>,
    attached: bool,
}

impl ThreadInfo {
    fn new(soft_volume: ChannelVolumes, fixed_latency: Option<Duration>) -> Self {
        Self {
            state: SourceState::Init,
            listeners: Vec::with_capacity(crate::source::MAX_LISTENERS_PER_SOURCE),
            soft_volume,
            soft_muted: false,
            requested_latency: None,
            requested_latency_valid: false,
            max_rewind: 0,
            latency_range: LatencyRange::default(),
            fixed_latency,
            attached: false,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }
}

/// The realtime worker object for one source
#[derive(Debug)]
pub struct SourceWorker {
    link: WorkerLink,
    info: ThreadInfo,
    scratch: Vec<f32>,
}

impl SourceWorker {
    pub(crate) fn new(
        link: WorkerLink,
        soft_volume: ChannelVolumes,
        fixed_latency: Option<Duration>,
    ) -> Self {
        Self {
            link,
            info: ThreadInfo::new(soft_volume, fixed_latency),
            scratch: Vec::with_capacity(MAX_BLOCK_SAMPLES),
        }
    }

    pub fn info(&self) -> &ThreadInfo {
        &self.info
    }

    /// Drain and service every queued control message, in order
    ///
    /// Returns how many messages were serviced. Call once per cycle.
    pub fn process_messages(&mut self) -> usize {
        let mut serviced = 0;
        while let Some(msg) = self.link.pop() {
            let reply = self.service(msg);
            self.link.reply(reply);
            serviced += 1;
        }
        serviced
    }

    /// Service one message; shared by the bridge path and the pre-attach
    /// inline path on the control side
    pub(crate) fn service(&mut self, msg: WorkerMessage) -> WorkerReply {
        match msg {
            WorkerMessage::AddListener(l) => {
                trace!(listener = %l.id, "worker: add listener");
                self.info.listeners.push(l);
                self.invalidate_requested_latency();
                WorkerReply::Done
            }
            WorkerMessage::RemoveListener(id) => {
                let taken = self
                    .info
                    .listeners
                    .iter()
                    .position(|l| l.id == id)
                    .map(|i| self.info.listeners.remove(i));
                self.invalidate_requested_latency();
                WorkerReply::Listener(taken)
            }
            WorkerMessage::SetState(state) => {
                self.info.state = state;
                WorkerReply::Done
            }
            WorkerMessage::SetSoftVolume(v) => {
                self.info.soft_volume = v;
                WorkerReply::Done
            }
            WorkerMessage::GetVolume => WorkerReply::Volume(self.info.soft_volume),
            WorkerMessage::SetSoftMute(m) => {
                self.info.soft_muted = m;
                WorkerReply::Done
            }
            WorkerMessage::GetMute => WorkerReply::Mute(self.info.soft_muted),
            WorkerMessage::GetLatency => WorkerReply::Latency(self.current_latency()),
            WorkerMessage::GetRequestedLatency => {
                WorkerReply::RequestedLatency(self.requested_latency())
            }
            WorkerMessage::SetLatencyRange(r) => {
                self.info.latency_range = r;
                self.invalidate_requested_latency();
                WorkerReply::Done
            }
            WorkerMessage::GetLatencyRange => WorkerReply::LatencyRange(self.info.latency_range),
            WorkerMessage::SetMaxRewind(n) => {
                self.info.max_rewind = n;
                WorkerReply::Done
            }
            WorkerMessage::GetMaxRewind => WorkerReply::MaxRewind(self.info.max_rewind),
            WorkerMessage::Attach => {
                self.info.attached = true;
                WorkerReply::Done
            }
            WorkerMessage::Detach => {
                self.info.attached = false;
                WorkerReply::Done
            }
        }
    }

    /// Post one captured block to every attached, uncorked listener
    ///
    /// Samples are interleaved frames; channel count follows the soft
    /// volume. Soft volume (or silence when soft-muted) is applied once into
    /// a preallocated scratch buffer, per-listener gain on the way into each
    /// ring. Blocks larger than the scratch capacity are forwarded in
    /// chunks; the channel phase carries across chunk boundaries.
    pub fn post(&mut self, samples: &[f32]) {
        let channels = self.info.soft_volume.len().max(1);
        let mut phase = 0;
        for block in samples.chunks(MAX_BLOCK_SAMPLES) {
            self.scratch.clear();
            if self.info.soft_muted {
                self.scratch.extend(block.iter().map(|_| 0.0));
            } else {
                self.scratch.extend(
                    block
                        .iter()
                        .enumerate()
                        .map(|(i, &s)| s * self.info.soft_volume.get((phase + i) % channels)),
                );
            }
            for listener in &mut self.info.listeners {
                if listener.is_corked() {
                    continue;
                }
                let gain = listener.gain();
                listener.push_scaled(&self.scratch, gain);
            }
            phase = (phase + block.len()) % channels;
        }
    }

    /// Propagate a rewind request to every listener, capped by max-rewind
    pub fn process_rewind(&mut self, nbytes: usize) {
        let capped = nbytes.min(self.info.max_rewind);
        if capped == 0 {
            return;
        }
        for listener in &self.info.listeners {
            listener.add_pending_rewind(capped);
        }
    }

    /// Mark the requested-latency cache stale
    ///
    /// Call whenever a listener's latency requirement changes; the next
    /// `requested_latency` recomputes. It is not recomputed on every post.
    pub fn invalidate_requested_latency(&mut self) {
        self.info.requested_latency_valid = false;
    }

    /// The latency the listeners collectively request
    ///
    /// Fixed-latency sources always answer the fixed value. Dynamic sources
    /// recompute lazily: minimum over listener requirements, clamped into
    /// the latency range; `None` when no listener cares.
    pub fn requested_latency(&mut self) -> Option<Duration> {
        if let Some(fixed) = self.info.fixed_latency {
            return Some(fixed);
        }
        if !self.info.requested_latency_valid {
            let min = self
                .info
                .listeners
                .iter()
                .filter_map(|l| l.requested_latency())
                .min();
            self.info.requested_latency = min.map(|d| self.info.latency_range.clamp(d));
            self.info.requested_latency_valid = true;
        }
        self.info.requested_latency
    }

    fn current_latency(&mut self) -> Duration {
        if let Some(fixed) = self.info.fixed_latency {
            return fixed;
        }
        self.requested_latency()
            .unwrap_or(self.info.latency_range.min)
    }
}
