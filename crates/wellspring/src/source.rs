//! The control half of a capture source
//!
//! [`Source`] is driven only from the control context. Setters either hand
//! off to a driver override (the driver claims direct responsibility) or
//! synchronize the change into the worker snapshot over the message bridge,
//! waiting for the acknowledgment before returning. Until the driver takes
//! the worker with [`Source::take_worker`], messages are serviced inline
//! through the same code path, so pre-attach and post-attach behavior match.
//!
//! State machine: `Init → {Running | Idle | Suspended} → … → Unlinked`,
//! terminal. A source is *linked* (visible to the rest of the server)
//! exactly in Running, Idle and Suspended. Every transition passes the
//! driver's veto point first; a veto leaves the state unchanged.

use std::collections::HashMap;
use std::ops::BitOr;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::listener::{Listener, ListenerConfig, WorkerListener};
use crate::msg::{worker_channel, ControlLink, WorkerMessage, WorkerReply};
use crate::suspend::{SuspendCause, SuspendCauses};
use crate::volume::{ChannelVolumes, LatencyRange};
use crate::worker::SourceWorker;

/// Hard cap on listeners attached to one source
pub const MAX_LISTENERS_PER_SOURCE: usize = 32;

/// Source lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    /// Created but not yet attached to the routing graph
    Init,
    /// At least one uncorked listener is consuming
    Running,
    /// Linked, no active consumer
    Idle,
    /// Held by one or more suspend causes
    Suspended,
    /// Detached for good; no outgoing transitions
    Unlinked,
}

impl SourceState {
    /// Linked means registered and reachable from the rest of the server
    pub fn is_linked(self) -> bool {
        matches!(
            self,
            SourceState::Running | SourceState::Idle | SourceState::Suspended
        )
    }
}

/// Source capability bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceFlags(u32);

impl SourceFlags {
    pub const NONE: SourceFlags = SourceFlags(0);
    /// Backed by real hardware
    pub const HARDWARE: SourceFlags = SourceFlags(1 << 0);
    /// Networked device
    pub const NETWORK: SourceFlags = SourceFlags(1 << 1);
    /// Driver controls volume in hardware
    pub const HW_VOLUME: SourceFlags = SourceFlags(1 << 2);
    /// Driver controls mute in hardware
    pub const HW_MUTE: SourceFlags = SourceFlags(1 << 3);
    /// Latency is negotiated, not fixed
    pub const DYNAMIC_LATENCY: SourceFlags = SourceFlags(1 << 4);

    pub fn contains(self, other: SourceFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for SourceFlags {
    type Output = SourceFlags;

    fn bitor(self, rhs: SourceFlags) -> SourceFlags {
        SourceFlags(self.0 | rhs.0)
    }
}

/// A named routing endpoint on the device (e.g. internal mic, headset jack)
#[derive(Debug, Clone)]
pub struct Port {
    pub name: String,
    pub description: String,
    pub priority: u32,
    pub available: bool,
}

/// How a driver answered an operation it was offered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverOp {
    /// Driver did it; don't fall through to the worker message
    Handled,
    /// Driver doesn't care; use the default message path
    Unhandled,
    /// Driver vetoes the operation; nothing changed
    Rejected,
}

/// Optional driver overrides, consulted before the message path
///
/// Every method defaults to `Unhandled`, matching a driver that supplies no
/// callbacks at all.
pub trait SourceDriver: Send {
    /// Veto point for state transitions
    fn set_state(&mut self, _state: SourceState) -> DriverOp {
        DriverOp::Unhandled
    }

    fn set_volume(&mut self, _volume: &ChannelVolumes) -> DriverOp {
        DriverOp::Unhandled
    }

    /// Fresh volume from hardware, if the driver owns it
    fn get_volume(&mut self) -> Option<ChannelVolumes> {
        None
    }

    fn set_mute(&mut self, _muted: bool) -> DriverOp {
        DriverOp::Unhandled
    }

    fn get_mute(&mut self) -> Option<bool> {
        None
    }

    fn set_port(&mut self, _name: &str) -> DriverOp {
        DriverOp::Unhandled
    }
}

/// Driver that supplies no overrides
struct NoopDriver;

impl SourceDriver for NoopDriver {}

/// Construction parameters for a source
#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub name: String,
    pub index: u32,
    pub volume: ChannelVolumes,
    pub muted: bool,
    pub ports: Vec<Port>,
    pub active_port: Option<String>,
    /// Fixed latency (no negotiation); dynamic-latency sources leave this
    /// unset and use the latency range instead
    pub fixed_latency: Option<Duration>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            name: "source".to_string(),
            index: 0,
            volume: ChannelVolumes::default(),
            muted: false,
            ports: Vec::new(),
            active_port: None,
            fixed_latency: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("source has been unlinked")]
    Unlinked,
    #[error("source is not linked")]
    NotLinked,
    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: SourceState,
        to: SourceState,
    },
    #[error("operation vetoed by the driver")]
    Vetoed,
    #[error("listener cap reached ({MAX_LISTENERS_PER_SOURCE})")]
    TooManyListeners,
    #[error("no such listener: {0}")]
    NoSuchListener(Uuid),
    #[error("no such port: {0}")]
    NoSuchPort(String),
}

/// Listeners atomically detached by [`Source::move_all_start`]
///
/// Holds both halves of every detached listener until the move either
/// finishes on a destination or fails back to the original source. Dropping
/// a non-empty queue loses listeners; finish or fail it.
#[derive(Debug)]
pub struct MoveQueue {
    entries: Vec<MoveEntry>,
    origin: u32,
}

#[derive(Debug)]
struct MoveEntry {
    handle: Arc<Listener>,
    worker: WorkerListener,
}

impl MoveQueue {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index of the source the listeners came from
    pub fn origin(&self) -> u32 {
        self.origin
    }
}

/// The control-context source object
pub struct Source {
    pub index: u32,
    pub name: String,
    state: SourceState,
    flags: SourceFlags,
    causes: SuspendCauses,

    volume: ChannelVolumes,
    muted: bool,
    refresh_volume: bool,
    refresh_muted: bool,
    save_volume: bool,
    save_muted: bool,
    save_port: bool,

    ports: HashMap<String, Port>,
    active_port: Option<String>,

    listeners: Vec<Arc<Listener>>,
    fixed_latency: Option<Duration>,

    driver: Box<dyn SourceDriver>,
    link: ControlLink,
    /// Present until the realtime thread takes it; messages are serviced
    /// inline while it's here
    worker: Option<SourceWorker>,
}

impl Source {
    /// Create a source with no driver overrides
    pub fn new(config: SourceConfig, flags: SourceFlags) -> Self {
        Self::with_driver(config, flags, Box::new(NoopDriver))
    }

    /// Create a source whose driver claims some operations directly
    pub fn with_driver(
        config: SourceConfig,
        flags: SourceFlags,
        driver: Box<dyn SourceDriver>,
    ) -> Self {
        let (control, worker_link) = worker_channel(16);
        let worker = SourceWorker::new(worker_link, config.volume, config.fixed_latency);

        let mut ports = HashMap::new();
        for port in config.ports {
            ports.insert(port.name.clone(), port);
        }
        let active_port = match config.active_port {
            Some(name) if ports.contains_key(&name) => Some(name),
            Some(name) => {
                warn!(source = %config.name, port = %name, "configured active port does not exist");
                None
            }
            None => None,
        };

        let mut source = Self {
            index: config.index,
            name: config.name,
            state: SourceState::Init,
            flags,
            causes: SuspendCauses::new(),
            volume: config.volume,
            muted: config.muted,
            refresh_volume: false,
            refresh_muted: false,
            save_volume: false,
            save_muted: false,
            save_port: false,
            ports,
            active_port,
            listeners: Vec::new(),
            fixed_latency: config.fixed_latency,
            driver,
            link: control,
            worker: Some(worker),
        };
        if source.muted {
            source.sync(WorkerMessage::SetSoftMute(true));
        }
        source
    }

    /// Hand the realtime half to the driver thread
    ///
    /// The snapshot is marked attached at the handoff. From this point every
    /// setter goes over the bridge and blocks until the worker acknowledges.
    /// Yields the worker once, `None` afterwards.
    pub fn take_worker(&mut self) -> Option<SourceWorker> {
        let mut worker = self.worker.take()?;
        worker.service(WorkerMessage::Attach);
        Some(worker)
    }

    /// Inspect the worker while it is still held inline (pre-attach)
    pub fn worker(&self) -> Option<&SourceWorker> {
        self.worker.as_ref()
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn flags(&self) -> SourceFlags {
        self.flags
    }

    // === lifecycle ===

    /// Attach to the routing graph; the source becomes visible
    pub fn put(&mut self) -> Result<(), SourceError> {
        if self.state != SourceState::Init {
            return Err(SourceError::InvalidTransition {
                from: self.state,
                to: SourceState::Idle,
            });
        }
        let initial = if self.used_by() > 0 {
            SourceState::Running
        } else {
            SourceState::Idle
        };
        self.update_state(initial)?;
        info!(source = %self.name, index = self.index, "source linked");
        Ok(())
    }

    /// Detach for good; exactly once per lifecycle
    ///
    /// Detaches every listener and enters the terminal state. Calling it
    /// again warns and does nothing. The driver is notified but cannot veto
    /// the terminal transition.
    pub fn unlink(&mut self) {
        if self.state == SourceState::Unlinked {
            warn!(source = %self.name, "unlink called more than once");
            return;
        }
        for handle in std::mem::take(&mut self.listeners) {
            let _ = self.sync(WorkerMessage::RemoveListener(handle.id));
        }
        if self.driver.set_state(SourceState::Unlinked) == DriverOp::Rejected {
            warn!(source = %self.name, "driver cannot veto unlink");
        }
        self.sync(WorkerMessage::Detach);
        self.sync(WorkerMessage::SetState(SourceState::Unlinked));
        self.state = SourceState::Unlinked;
        info!(source = %self.name, index = self.index, "source unlinked");
    }

    fn update_state(&mut self, new: SourceState) -> Result<(), SourceError> {
        if self.state == new {
            return Ok(());
        }
        if self.state == SourceState::Unlinked {
            return Err(SourceError::Unlinked);
        }
        if self.driver.set_state(new) == DriverOp::Rejected {
            debug!(source = %self.name, ?new, "state change vetoed");
            return Err(SourceError::Vetoed);
        }
        self.sync(WorkerMessage::SetState(new));
        debug!(source = %self.name, from = ?self.state, to = ?new, "state change");
        self.state = new;
        Ok(())
    }

    /// Flip between Idle and Running to match the active listener count
    fn update_status(&mut self) {
        if !self.state.is_linked() || self.state == SourceState::Suspended {
            return;
        }
        let wanted = if self.used_by() > 0 {
            SourceState::Running
        } else {
            SourceState::Idle
        };
        if let Err(e) = self.update_state(wanted) {
            warn!(source = %self.name, error = %e, "status update rejected");
        }
    }

    // === suspend causes ===

    /// Hold the source suspended for `cause`
    ///
    /// Causes are counted independently; the same subsystem suspending twice
    /// must resume twice. A driver veto rolls the count back.
    pub fn suspend(&mut self, cause: SuspendCause) -> Result<(), SourceError> {
        if !self.state.is_linked() {
            return Err(SourceError::NotLinked);
        }
        self.causes.set(cause);
        if self.state != SourceState::Suspended {
            if let Err(e) = self.update_state(SourceState::Suspended) {
                self.causes.clear(cause);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Release one hold for `cause`; resumes only when nothing else holds
    pub fn resume(&mut self, cause: SuspendCause) -> Result<(), SourceError> {
        if !self.state.is_linked() {
            return Err(SourceError::NotLinked);
        }
        self.causes.clear(cause);
        if self.causes.any() || self.state != SourceState::Suspended {
            return Ok(());
        }
        let next = if self.used_by() > 0 {
            SourceState::Running
        } else {
            SourceState::Idle
        };
        match self.update_state(next) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.causes.set(cause);
                Err(e)
            }
        }
    }

    /// Whether `cause` currently holds the source
    pub fn suspended_by(&self, cause: SuspendCause) -> bool {
        self.causes.holds(cause)
    }

    // === volume / mute ===

    /// Set the volume; `save` hints that the change is worth persisting
    pub fn set_volume(
        &mut self,
        volume: ChannelVolumes,
        save: bool,
    ) -> Result<(), SourceError> {
        if self.state == SourceState::Unlinked {
            return Err(SourceError::Unlinked);
        }
        match self.driver.set_volume(&volume) {
            DriverOp::Rejected => return Err(SourceError::Vetoed),
            DriverOp::Handled => {}
            DriverOp::Unhandled => {
                self.sync(WorkerMessage::SetSoftVolume(volume));
            }
        }
        self.volume = volume;
        self.save_volume = save;
        Ok(())
    }

    /// Current volume, re-read from the device when the refresh marker is
    /// set or `force_refresh` is passed
    pub fn get_volume(&mut self, force_refresh: bool) -> ChannelVolumes {
        if force_refresh || self.refresh_volume {
            if let Some(v) = self.driver.get_volume() {
                self.volume = v;
            } else if let WorkerReply::Volume(v) = self.sync(WorkerMessage::GetVolume) {
                self.volume = v;
            }
            self.refresh_volume = false;
        }
        self.volume
    }

    /// Mark the cached volume stale (hardware may have changed underneath)
    pub fn request_volume_refresh(&mut self) {
        self.refresh_volume = true;
    }

    pub fn set_mute(&mut self, muted: bool, save: bool) -> Result<(), SourceError> {
        if self.state == SourceState::Unlinked {
            return Err(SourceError::Unlinked);
        }
        match self.driver.set_mute(muted) {
            DriverOp::Rejected => return Err(SourceError::Vetoed),
            DriverOp::Handled => {}
            DriverOp::Unhandled => {
                self.sync(WorkerMessage::SetSoftMute(muted));
            }
        }
        self.muted = muted;
        self.save_muted = save;
        Ok(())
    }

    pub fn get_mute(&mut self, force_refresh: bool) -> bool {
        if force_refresh || self.refresh_muted {
            if let Some(m) = self.driver.get_mute() {
                self.muted = m;
            } else if let WorkerReply::Mute(m) = self.sync(WorkerMessage::GetMute) {
                self.muted = m;
            }
            self.refresh_muted = false;
        }
        self.muted
    }

    pub fn request_mute_refresh(&mut self) {
        self.refresh_muted = true;
    }

    pub fn volume_saved(&self) -> bool {
        self.save_volume
    }

    pub fn mute_saved(&self) -> bool {
        self.save_muted
    }

    // === ports ===

    pub fn set_port(&mut self, name: &str, save: bool) -> Result<(), SourceError> {
        if self.state == SourceState::Unlinked {
            return Err(SourceError::Unlinked);
        }
        if !self.ports.contains_key(name) {
            return Err(SourceError::NoSuchPort(name.to_string()));
        }
        if self.driver.set_port(name) == DriverOp::Rejected {
            return Err(SourceError::Vetoed);
        }
        self.active_port = Some(name.to_string());
        self.save_port = save;
        Ok(())
    }

    pub fn active_port(&self) -> Option<&Port> {
        self.active_port.as_deref().and_then(|n| self.ports.get(n))
    }

    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.values()
    }

    // === latency ===

    pub fn set_latency_range(&mut self, min: Duration, max: Duration) {
        self.sync(WorkerMessage::SetLatencyRange(LatencyRange::new(min, max)));
    }

    pub fn latency_range(&mut self) -> LatencyRange {
        match self.sync(WorkerMessage::GetLatencyRange) {
            WorkerReply::LatencyRange(r) => r,
            _ => LatencyRange::default(),
        }
    }

    pub fn set_max_rewind(&mut self, nbytes: usize) {
        self.sync(WorkerMessage::SetMaxRewind(nbytes));
    }

    pub fn max_rewind(&mut self) -> usize {
        match self.sync(WorkerMessage::GetMaxRewind) {
            WorkerReply::MaxRewind(n) => n,
            _ => 0,
        }
    }

    /// Current device latency (fixed value, or the negotiated one)
    pub fn latency(&mut self) -> Duration {
        match self.sync(WorkerMessage::GetLatency) {
            WorkerReply::Latency(d) => d,
            _ => Duration::ZERO,
        }
    }

    /// Latency the attached listeners collectively request
    pub fn requested_latency(&mut self) -> Option<Duration> {
        match self.sync(WorkerMessage::GetRequestedLatency) {
            WorkerReply::RequestedLatency(d) => d,
            _ => None,
        }
    }

    pub fn fixed_latency(&self) -> Option<Duration> {
        self.fixed_latency
    }

    // === listeners ===

    /// Attach a listener, up to the fixed cap
    pub fn attach_listener(
        &mut self,
        config: ListenerConfig,
    ) -> Result<Arc<Listener>, SourceError> {
        if self.state == SourceState::Unlinked {
            return Err(SourceError::Unlinked);
        }
        if self.listeners.len() >= MAX_LISTENERS_PER_SOURCE {
            return Err(SourceError::TooManyListeners);
        }
        let (handle, worker_half) = Listener::pair(config);
        self.sync(WorkerMessage::AddListener(worker_half));
        self.listeners.push(Arc::clone(&handle));
        debug!(source = %self.name, listener = %handle.id, "listener attached");
        self.update_status();
        Ok(handle)
    }

    /// Detach one listener; its sample ring is closed
    pub fn detach_listener(&mut self, id: Uuid) -> Result<Arc<Listener>, SourceError> {
        let pos = self
            .listeners
            .iter()
            .position(|l| l.id == id)
            .ok_or(SourceError::NoSuchListener(id))?;
        let _ = self.sync(WorkerMessage::RemoveListener(id));
        let handle = self.listeners.remove(pos);
        debug!(source = %self.name, listener = %id, "listener detached");
        self.update_status();
        Ok(handle)
    }

    /// Attached listeners
    pub fn linked_by(&self) -> usize {
        self.listeners.len()
    }

    /// Attached listeners that are actually consuming (not corked)
    pub fn used_by(&self) -> usize {
        self.listeners.iter().filter(|l| !l.is_corked()).count()
    }

    /// Attached listeners that forbid suspension
    pub fn suspend_blockers(&self) -> usize {
        self.listeners.iter().filter(|l| !l.allow_suspend()).count()
    }

    // === move-all protocol ===

    /// Atomically detach every listener into a transfer queue
    ///
    /// The source stays valid and linked; finish the move on a destination
    /// or fail it back here.
    pub fn move_all_start(&mut self) -> Result<MoveQueue, SourceError> {
        if !self.state.is_linked() {
            return Err(SourceError::NotLinked);
        }
        let mut queue = MoveQueue {
            entries: Vec::new(),
            origin: self.index,
        };
        for handle in std::mem::take(&mut self.listeners) {
            match self.sync(WorkerMessage::RemoveListener(handle.id)) {
                WorkerReply::Listener(Some(worker)) => {
                    queue.entries.push(MoveEntry { handle, worker });
                }
                _ => warn!(source = %self.name, listener = %handle.id,
                           "listener missing from worker during move"),
            }
        }
        debug!(source = %self.name, moved = queue.len(), "move-all started");
        self.update_status();
        Ok(queue)
    }

    /// Reattach a transfer queue here; `save` marks the new routing as
    /// worth persisting
    ///
    /// Fails without consuming the queue if this source can't take every
    /// listener, so the caller can still `move_all_fail` it.
    pub fn move_all_finish(
        &mut self,
        queue: &mut MoveQueue,
        save: bool,
    ) -> Result<(), SourceError> {
        if self.state == SourceState::Unlinked {
            return Err(SourceError::Unlinked);
        }
        if self.listeners.len() + queue.len() > MAX_LISTENERS_PER_SOURCE {
            return Err(SourceError::TooManyListeners);
        }
        for entry in queue.entries.drain(..) {
            self.sync(WorkerMessage::AddListener(entry.worker));
            if save {
                entry.handle.mark_routing_saved();
            }
            self.listeners.push(entry.handle);
        }
        self.update_status();
        Ok(())
    }

    /// Return every transferred listener to this (original) source
    ///
    /// Never loses or duplicates a listener.
    pub fn move_all_fail(&mut self, queue: &mut MoveQueue) {
        debug_assert_eq!(queue.origin, self.index);
        for entry in queue.entries.drain(..) {
            self.sync(WorkerMessage::AddListener(entry.worker));
            self.listeners.push(entry.handle);
        }
        self.update_status();
    }

    fn sync(&mut self, msg: WorkerMessage) -> WorkerReply {
        match self.worker.as_mut() {
            Some(w) => w.service(msg),
            None => self.link.request(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linked_source() -> Source {
        let mut s = Source::new(SourceConfig::default(), SourceFlags::NONE);
        s.put().unwrap();
        s
    }

    /// Driver that vetoes every state change
    struct VetoDriver;

    impl SourceDriver for VetoDriver {
        fn set_state(&mut self, _state: SourceState) -> DriverOp {
            DriverOp::Rejected
        }
    }

    #[test]
    fn take_worker_marks_attached() {
        let mut s = linked_source();
        assert!(!s.worker().unwrap().info().is_attached());
        let w = s.take_worker().unwrap();
        assert!(w.info().is_attached());
        assert!(s.take_worker().is_none());
    }

    #[test]
    fn listener_accounting() {
        let mut s = linked_source();
        let a = s.attach_listener(ListenerConfig::default()).unwrap();
        let b = s.attach_listener(ListenerConfig::default()).unwrap();
        assert_eq!(s.linked_by(), 2);
        assert_eq!(s.worker().unwrap().info().listener_count(), 2);

        s.detach_listener(a.id).unwrap();
        assert_eq!(s.linked_by(), 1);
        s.detach_listener(b.id).unwrap();
        assert_eq!(s.linked_by(), 0);
        assert_eq!(s.worker().unwrap().info().listener_count(), 0);
    }

    #[test]
    fn listener_cap_enforced() {
        let mut s = linked_source();
        for _ in 0..MAX_LISTENERS_PER_SOURCE {
            s.attach_listener(ListenerConfig::default()).unwrap();
        }
        assert!(matches!(
            s.attach_listener(ListenerConfig::default()),
            Err(SourceError::TooManyListeners)
        ));
        assert_eq!(s.linked_by(), MAX_LISTENERS_PER_SOURCE);
    }

    #[test]
    fn detach_unknown_listener_fails() {
        let mut s = linked_source();
        assert!(matches!(
            s.detach_listener(Uuid::new_v4()),
            Err(SourceError::NoSuchListener(_))
        ));
    }

    #[test]
    fn used_by_counts_uncorked_only() {
        let mut s = linked_source();
        let a = s.attach_listener(ListenerConfig::default()).unwrap();
        let _b = s
            .attach_listener(ListenerConfig {
                corked: true,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(s.linked_by(), 2);
        assert_eq!(s.used_by(), 1);
        assert_eq!(s.state(), SourceState::Running);

        a.cork(true);
        s.detach_listener(a.id).unwrap();
        assert_eq!(s.used_by(), 0);
        assert_eq!(s.state(), SourceState::Idle);
    }

    #[test]
    fn suspend_blockers_counted() {
        let mut s = linked_source();
        s.attach_listener(ListenerConfig::default()).unwrap();
        s.attach_listener(ListenerConfig {
            allow_suspend: false,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(s.suspend_blockers(), 1);
    }

    #[test]
    fn suspend_double_set_single_clear() {
        let mut s = linked_source();
        s.suspend(SuspendCause::Idle).unwrap();
        s.suspend(SuspendCause::Idle).unwrap();
        assert_eq!(s.state(), SourceState::Suspended);

        s.resume(SuspendCause::Idle).unwrap();
        assert_eq!(s.state(), SourceState::Suspended);

        s.resume(SuspendCause::Idle).unwrap();
        assert_eq!(s.state(), SourceState::Idle);
    }

    #[test]
    fn resume_waits_for_all_causes() {
        let mut s = linked_source();
        s.suspend(SuspendCause::User).unwrap();
        s.suspend(SuspendCause::Session).unwrap();
        s.resume(SuspendCause::User).unwrap();
        assert_eq!(s.state(), SourceState::Suspended);
        s.resume(SuspendCause::Session).unwrap();
        assert_eq!(s.state(), SourceState::Idle);
    }

    #[test]
    fn resume_unheld_cause_is_noop() {
        let mut s = linked_source();
        s.suspend(SuspendCause::User).unwrap();
        s.resume(SuspendCause::Idle).unwrap();
        assert_eq!(s.state(), SourceState::Suspended);
    }

    #[test]
    fn driver_veto_leaves_state_and_cause_unchanged() {
        let mut s =
            Source::with_driver(SourceConfig::default(), SourceFlags::NONE, Box::new(VetoDriver));
        assert!(matches!(s.put(), Err(SourceError::Vetoed)));
        assert_eq!(s.state(), SourceState::Init);
    }

    #[test]
    fn suspend_veto_rolls_back_cause() {
        struct VetoSuspend;
        impl SourceDriver for VetoSuspend {
            fn set_state(&mut self, state: SourceState) -> DriverOp {
                if state == SourceState::Suspended {
                    DriverOp::Rejected
                } else {
                    DriverOp::Unhandled
                }
            }
        }
        let mut s = Source::with_driver(
            SourceConfig::default(),
            SourceFlags::NONE,
            Box::new(VetoSuspend),
        );
        s.put().unwrap();
        assert!(matches!(
            s.suspend(SuspendCause::User),
            Err(SourceError::Vetoed)
        ));
        assert_eq!(s.state(), SourceState::Idle);
        assert!(!s.suspended_by(SuspendCause::User));
    }

    #[test]
    fn move_all_fail_restores_everything() {
        let mut s = linked_source();
        let a = s.attach_listener(ListenerConfig::default()).unwrap();
        let b = s.attach_listener(ListenerConfig::default()).unwrap();

        let mut q = s.move_all_start().unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(s.linked_by(), 0);
        assert!(s.state().is_linked());

        s.move_all_fail(&mut q);
        assert!(q.is_empty());
        assert_eq!(s.linked_by(), 2);
        assert_eq!(s.worker().unwrap().info().listener_count(), 2);
        // same listeners, none duplicated
        let ids: Vec<Uuid> = vec![a.id, b.id];
        for l in [&a, &b] {
            assert_eq!(ids.iter().filter(|id| **id == l.id).count(), 1);
        }
    }

    #[test]
    fn move_all_finish_rehomes_listeners() {
        let mut from = linked_source();
        let mut to = Source::new(
            SourceConfig {
                index: 1,
                name: "dest".to_string(),
                ..Default::default()
            },
            SourceFlags::NONE,
        );
        to.put().unwrap();

        from.attach_listener(ListenerConfig::default()).unwrap();
        from.attach_listener(ListenerConfig::default()).unwrap();

        let mut q = from.move_all_start().unwrap();
        to.move_all_finish(&mut q, true).unwrap();
        assert!(q.is_empty());
        assert_eq!(from.linked_by(), 0);
        assert_eq!(to.linked_by(), 2);
        assert_eq!(to.worker().unwrap().info().listener_count(), 2);
    }

    #[test]
    fn move_all_finish_respects_cap() {
        let mut from = linked_source();
        let mut to = Source::new(
            SourceConfig {
                index: 1,
                ..Default::default()
            },
            SourceFlags::NONE,
        );
        to.put().unwrap();
        for _ in 0..MAX_LISTENERS_PER_SOURCE {
            to.attach_listener(ListenerConfig::default()).unwrap();
        }
        from.attach_listener(ListenerConfig::default()).unwrap();

        let mut q = from.move_all_start().unwrap();
        assert!(matches!(
            to.move_all_finish(&mut q, false),
            Err(SourceError::TooManyListeners)
        ));
        // queue intact: fail back without loss
        assert_eq!(q.len(), 1);
        from.move_all_fail(&mut q);
        assert_eq!(from.linked_by(), 1);
    }

    #[test]
    fn finish_with_save_marks_routing() {
        let mut from = linked_source();
        let mut to = Source::new(
            SourceConfig {
                index: 1,
                ..Default::default()
            },
            SourceFlags::NONE,
        );
        to.put().unwrap();
        let l = from.attach_listener(ListenerConfig::default()).unwrap();
        assert!(!l.routing_saved());

        let mut q = from.move_all_start().unwrap();
        to.move_all_finish(&mut q, true).unwrap();
        assert!(l.routing_saved());
    }

    #[test]
    fn volume_syncs_to_snapshot() {
        let mut s = linked_source();
        s.set_volume(ChannelVolumes::uniform(2, 0.5), true).unwrap();
        assert!(s.volume_saved());
        let snap = s.worker().unwrap().info().soft_volume;
        assert!((snap.get(0) - 0.5).abs() < 0.001);
        assert!((s.get_volume(false).get(0) - 0.5).abs() < 0.001);
    }

    #[test]
    fn mute_syncs_to_snapshot() {
        let mut s = linked_source();
        s.set_mute(true, false).unwrap();
        assert!(s.worker().unwrap().info().soft_muted);
        assert!(s.get_mute(true));
    }

    #[test]
    fn hw_volume_driver_claims_setter() {
        struct HwVolume {
            set: bool,
        }
        impl SourceDriver for HwVolume {
            fn set_volume(&mut self, _v: &ChannelVolumes) -> DriverOp {
                self.set = true;
                DriverOp::Handled
            }
        }
        let mut s = Source::with_driver(
            SourceConfig::default(),
            SourceFlags::HARDWARE | SourceFlags::HW_VOLUME,
            Box::new(HwVolume { set: false }),
        );
        s.put().unwrap();
        s.set_volume(ChannelVolumes::uniform(2, 0.3), false).unwrap();
        // soft volume untouched: the driver owns it
        let snap = s.worker().unwrap().info().soft_volume;
        assert!((snap.get(0) - 1.0).abs() < 0.001);
    }

    #[test]
    fn port_selection() {
        let mut s = Source::new(
            SourceConfig {
                ports: vec![
                    Port {
                        name: "mic-internal".to_string(),
                        description: "Internal Microphone".to_string(),
                        priority: 100,
                        available: true,
                    },
                    Port {
                        name: "mic-headset".to_string(),
                        description: "Headset Microphone".to_string(),
                        priority: 200,
                        available: false,
                    },
                ],
                active_port: Some("mic-internal".to_string()),
                ..Default::default()
            },
            SourceFlags::NONE,
        );
        s.put().unwrap();
        assert_eq!(s.active_port().unwrap().name, "mic-internal");
        s.set_port("mic-headset", true).unwrap();
        assert_eq!(s.active_port().unwrap().name, "mic-headset");
        assert!(matches!(
            s.set_port("mic-usb", false),
            Err(SourceError::NoSuchPort(_))
        ));
    }

    #[test]
    fn unlink_is_terminal() {
        let mut s = linked_source();
        s.attach_listener(ListenerConfig::default()).unwrap();
        s.unlink();
        assert_eq!(s.state(), SourceState::Unlinked);
        assert_eq!(s.linked_by(), 0);

        // second unlink warns but must not panic or change anything
        s.unlink();
        assert_eq!(s.state(), SourceState::Unlinked);

        assert!(matches!(
            s.attach_listener(ListenerConfig::default()),
            Err(SourceError::Unlinked)
        ));
        assert!(matches!(
            s.suspend(SuspendCause::User),
            Err(SourceError::NotLinked)
        ));
        assert!(matches!(
            s.set_volume(ChannelVolumes::default(), false),
            Err(SourceError::Unlinked)
        ));
    }

    #[test]
    fn latency_range_roundtrip() {
        let mut s = Source::new(SourceConfig::default(), SourceFlags::DYNAMIC_LATENCY);
        s.set_latency_range(Duration::from_millis(5), Duration::from_millis(50));
        let r = s.latency_range();
        assert_eq!(r.min, Duration::from_millis(5));
        assert_eq!(r.max, Duration::from_millis(50));
    }

    #[test]
    fn max_rewind_roundtrip() {
        let mut s = linked_source();
        s.set_max_rewind(4096);
        assert_eq!(s.max_rewind(), 4096);
    }
}
