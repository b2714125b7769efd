//! Listeners: the receiving end of a capture source
//!
//! A listener is created as a pair: a control-side [`Listener`] handle and a
//! worker-owned [`WorkerListener`] half. The worker half owns the sample
//! ring producer and is handed to the realtime worker through the message
//! ring; the control handle keeps the ring consumer for whoever drains the
//! audio. Shared knobs (gain, cork, requested latency) are atomics so the
//! worker can read them every cycle without locking.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portable_atomic::AtomicF32;
use uuid::Uuid;

/// Configuration for attaching a listener
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub name: String,
    /// Linear gain applied on top of the source's soft volume
    pub gain: f32,
    /// Attached but not consuming (corked listeners receive no data)
    pub corked: bool,
    /// Whether the source may be suspended while this listener is attached
    pub allow_suspend: bool,
    /// Capacity of the per-listener sample ring, in samples
    pub ring_capacity: usize,
    /// Latency this listener requires, if it cares
    pub requested_latency: Option<Duration>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            name: "listener".to_string(),
            gain: 1.0,
            corked: false,
            allow_suspend: true,
            ring_capacity: 8192,
            requested_latency: None,
        }
    }
}

/// Control-side listener handle
#[derive(Debug)]
pub struct Listener {
    pub id: Uuid,
    pub name: String,
    allow_suspend: bool,
    gain: Arc<AtomicF32>,
    corked: Arc<AtomicBool>,
    /// Microseconds; 0 means "no requirement"
    requested_latency_us: Arc<AtomicU64>,
    /// Bytes the worker asked this listener to rewind; drained by the consumer
    rewind_pending: Arc<AtomicUsize>,
    /// Routing change was marked worth persisting by a finished move
    save_routing: AtomicBool,
    consumer: Mutex<Option<rtrb::Consumer<f32>>>,
}

/// Worker-owned half of a listener
///
/// Travels into the realtime worker inside an AddListener message and comes
/// back out of a RemoveListener reply, which is what lets the move-all
/// protocol re-home listeners without losing the sample ring.
#[derive(Debug)]
pub struct WorkerListener {
    pub id: Uuid,
    gain: Arc<AtomicF32>,
    corked: Arc<AtomicBool>,
    requested_latency_us: Arc<AtomicU64>,
    rewind_pending: Arc<AtomicUsize>,
    producer: rtrb::Producer<f32>,
}

impl Listener {
    /// Build a listener pair from a config
    pub fn pair(config: ListenerConfig) -> (Arc<Listener>, WorkerListener) {
        let (producer, consumer) = rtrb::RingBuffer::new(config.ring_capacity.max(1));
        let id = Uuid::new_v4();
        let gain = Arc::new(AtomicF32::new(config.gain));
        let corked = Arc::new(AtomicBool::new(config.corked));
        let requested_latency_us = Arc::new(AtomicU64::new(
            config
                .requested_latency
                .map(|d| d.as_micros() as u64)
                .unwrap_or(0),
        ));
        let rewind_pending = Arc::new(AtomicUsize::new(0));

        let handle = Arc::new(Listener {
            id,
            name: config.name,
            allow_suspend: config.allow_suspend,
            gain: Arc::clone(&gain),
            corked: Arc::clone(&corked),
            requested_latency_us: Arc::clone(&requested_latency_us),
            rewind_pending: Arc::clone(&rewind_pending),
            save_routing: AtomicBool::new(false),
            consumer: Mutex::new(Some(consumer)),
        });
        let worker = WorkerListener {
            id,
            gain,
            corked,
            requested_latency_us,
            rewind_pending,
            producer,
        };
        (handle, worker)
    }

    /// Take the sample ring consumer; yields once, `None` afterwards
    pub fn take_consumer(&self) -> Option<rtrb::Consumer<f32>> {
        self.consumer.lock().ok().and_then(|mut c| c.take())
    }

    pub fn gain(&self) -> f32 {
        self.gain.load(Ordering::Relaxed)
    }

    pub fn set_gain(&self, gain: f32) {
        self.gain.store(gain.max(0.0), Ordering::Relaxed);
    }

    pub fn is_corked(&self) -> bool {
        self.corked.load(Ordering::Relaxed)
    }

    pub fn cork(&self, corked: bool) {
        self.corked.store(corked, Ordering::Relaxed);
    }

    pub fn allow_suspend(&self) -> bool {
        self.allow_suspend
    }

    pub fn requested_latency(&self) -> Option<Duration> {
        match self.requested_latency_us.load(Ordering::Relaxed) {
            0 => None,
            us => Some(Duration::from_micros(us)),
        }
    }

    /// Update this listener's latency requirement
    ///
    /// The worker recomputes the source's requested latency lazily; callers
    /// on the worker path should invalidate it after changing this.
    pub fn set_requested_latency(&self, latency: Option<Duration>) {
        let us = latency.map(|d| d.as_micros() as u64).unwrap_or(0);
        self.requested_latency_us.store(us, Ordering::Relaxed);
    }

    /// Drain the pending rewind counter (bytes), resetting it to zero
    pub fn take_pending_rewind(&self) -> usize {
        self.rewind_pending.swap(0, Ordering::Relaxed)
    }

    pub fn routing_saved(&self) -> bool {
        self.save_routing.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_routing_saved(&self) {
        self.save_routing.store(true, Ordering::Relaxed);
    }
}

impl WorkerListener {
    pub(crate) fn is_corked(&self) -> bool {
        self.corked.load(Ordering::Relaxed)
    }

    pub(crate) fn gain(&self) -> f32 {
        self.gain.load(Ordering::Relaxed)
    }

    pub(crate) fn requested_latency(&self) -> Option<Duration> {
        match self.requested_latency_us.load(Ordering::Relaxed) {
            0 => None,
            us => Some(Duration::from_micros(us)),
        }
    }

    /// Push as many samples as the ring has room for; excess is dropped
    ///
    /// The ring capacity is the only backpressure on the fan-out path.
    pub(crate) fn push_scaled(&mut self, samples: &[f32], gain: f32) {
        for &s in samples {
            if self.producer.push(s * gain).is_err() {
                break;
            }
        }
    }

    pub(crate) fn add_pending_rewind(&self, nbytes: usize) {
        self.rewind_pending.fetch_add(nbytes, Ordering::Relaxed);
    }
}
