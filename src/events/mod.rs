//! Per-tunnel event queue and sink table.
//!
//! Engine tasks `post` into a bounded queue and never wait on the host. The
//! host drains the queue on its own thread with `pump`, which delivers events
//! in post order under a per-tunnel delivery lock, so one tunnel never sees
//! two callbacks running at once while different tunnels stay independent.
//!
//! `post` runs under the tunnel's status lock and therefore never logs; queue
//! overflow is reported by the next `pump` instead.

use crate::error::{BridgeError, Result};
use crate::forwarding::ForwardingType;
use crate::logger::{self, BreadcrumbFlags, ErrorCategory};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use parking_lot::{Mutex, ReentrantMutex};
use rustc_hash::FxHashMap;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Established,
    TunnelFailed,
    ForwardingChanged,
    AdditionalForwardingSucceeded,
    AdditionalForwardingFailed,
    Disconnected,
    TunnelError,
    WillReconnect,
    ReconnectionCompleted,
    ReconnectionFailed,
    UsageUpdate,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TunnelEvent {
    Established {
        urls: Vec<String>,
    },
    TunnelFailed {
        message: String,
    },
    ForwardingChanged {
        url_map: String,
    },
    AdditionalForwardingSucceeded {
        binding_url: String,
        forward_to: String,
        forwarding_type: ForwardingType,
    },
    AdditionalForwardingFailed {
        binding_url: String,
        forward_to: String,
        forwarding_type: ForwardingType,
        error: String,
    },
    Disconnected {
        error: String,
        messages: Vec<String>,
    },
    TunnelError {
        error_no: u32,
        message: String,
        recoverable: bool,
    },
    WillReconnect {
        error: String,
        messages: Vec<String>,
    },
    ReconnectionCompleted {
        urls: Vec<String>,
    },
    ReconnectionFailed {
        retry_count: u32,
    },
    UsageUpdate {
        usage: String,
    },
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::Established,
        EventKind::TunnelFailed,
        EventKind::ForwardingChanged,
        EventKind::AdditionalForwardingSucceeded,
        EventKind::AdditionalForwardingFailed,
        EventKind::Disconnected,
        EventKind::TunnelError,
        EventKind::WillReconnect,
        EventKind::ReconnectionCompleted,
        EventKind::ReconnectionFailed,
        EventKind::UsageUpdate,
    ];
}

impl TunnelEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TunnelEvent::Established { .. } => EventKind::Established,
            TunnelEvent::TunnelFailed { .. } => EventKind::TunnelFailed,
            TunnelEvent::ForwardingChanged { .. } => EventKind::ForwardingChanged,
            TunnelEvent::AdditionalForwardingSucceeded { .. } => {
                EventKind::AdditionalForwardingSucceeded
            }
            TunnelEvent::AdditionalForwardingFailed { .. } => EventKind::AdditionalForwardingFailed,
            TunnelEvent::Disconnected { .. } => EventKind::Disconnected,
            TunnelEvent::TunnelError { .. } => EventKind::TunnelError,
            TunnelEvent::WillReconnect { .. } => EventKind::WillReconnect,
            TunnelEvent::ReconnectionCompleted { .. } => EventKind::ReconnectionCompleted,
            TunnelEvent::ReconnectionFailed { .. } => EventKind::ReconnectionFailed,
            TunnelEvent::UsageUpdate { .. } => EventKind::UsageUpdate,
        }
    }
}

/// Receives events for one kind on one tunnel. Implementations run on the
/// thread that pumps the tunnel's queue.
pub trait EventSink: Send + Sync {
    fn deliver(&self, tunnel: u32, event: &TunnelEvent);
}

impl<F> EventSink for F
where
    F: Fn(u32, &TunnelEvent) + Send + Sync,
{
    fn deliver(&self, tunnel: u32, event: &TunnelEvent) {
        self(tunnel, event)
    }
}

/// How long `pump` may park the caller waiting for the first event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    Forever,
    Poll,
    For(Duration),
}

impl Wait {
    /// `-1` (any negative) blocks, `0` polls, `n` waits up to `n` milliseconds.
    pub fn from_millis(timeout: i64) -> Self {
        match timeout {
            t if t < 0 => Wait::Forever,
            0 => Wait::Poll,
            t => Wait::For(Duration::from_millis(t as u64)),
        }
    }
}

enum Envelope {
    Event(TunnelEvent),
    Wake,
}

struct DeliveryFlag<'a>(&'a Cell<bool>);

impl Drop for DeliveryFlag<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

pub struct EventDispatcher {
    tunnel: u32,
    sinks: Mutex<FxHashMap<EventKind, Arc<dyn EventSink>>>,
    tx: Sender<Envelope>,
    rx: Receiver<Envelope>,
    delivery: ReentrantMutex<Cell<bool>>,
    dropped: AtomicU64,
    reported_drops: AtomicU64,
    closed: AtomicBool,
}

impl EventDispatcher {
    pub fn new(tunnel: u32) -> Self {
        Self::with_capacity(tunnel, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(tunnel: u32, capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        Self {
            tunnel,
            sinks: Mutex::new(FxHashMap::default()),
            tx,
            rx,
            delivery: ReentrantMutex::new(Cell::new(false)),
            dropped: AtomicU64::new(0),
            reported_drops: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Installs (or with `None`, removes) the sink for `kind`. The previous
    /// sink is dropped once any delivery currently using it returns.
    pub fn register(&self, kind: EventKind, sink: Option<Arc<dyn EventSink>>) -> bool {
        let previous = {
            let mut sinks = self.sinks.lock();
            match sink {
                Some(sink) => sinks.insert(kind, sink),
                None => sinks.remove(&kind),
            }
        };
        logger::breadcrumb(
            BreadcrumbFlags::EVENTS,
            format!(
                "tunnel {} sink for {:?} {}",
                self.tunnel,
                kind,
                if previous.is_some() { "replaced" } else { "installed" }
            ),
        );
        previous.is_some()
    }

    /// Drops every sink; used at tunnel teardown.
    pub fn clear_sinks(&self) {
        let drained: Vec<Arc<dyn EventSink>> = self.sinks.lock().drain().map(|(_, s)| s).collect();
        drop(drained);
    }

    /// Queues an event without blocking. When the queue is full the oldest
    /// entry is evicted and counted.
    pub fn post(&self, event: TunnelEvent) {
        match self.tx.try_send(Envelope::Event(event)) {
            Ok(()) => {}
            Err(TrySendError::Full(envelope)) => {
                let _ = self.rx.try_recv();
                self.dropped.fetch_add(1, Ordering::Relaxed);
                let _ = self.tx.try_send(envelope);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Stops pumps from parking: a pump blocked in a wait is unparked, and
    /// later pumps only drain what is queued. Used once the tunnel is
    /// terminal.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _ = self.tx.try_send(Envelope::Wake);
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Waits per `wait` for the first envelope, then delivers everything that
    /// was queued at that point. Returns the number of events delivered.
    ///
    /// `wait` bounds the whole call, including the time spent waiting for
    /// another thread that is already pumping this tunnel.
    pub fn pump(&self, wait: Wait) -> Result<usize> {
        let deadline = match wait {
            Wait::For(timeout) => Instant::now().checked_add(timeout),
            _ => None,
        };
        let guard = match (wait, deadline) {
            (Wait::Forever, _) | (Wait::For(_), None) => Some(self.delivery.lock()),
            (Wait::Poll, _) => self.delivery.try_lock(),
            (Wait::For(_), Some(deadline)) => self.delivery.try_lock_until(deadline),
        };
        let Some(guard) = guard else {
            return Ok(0);
        };
        if guard.get() {
            return Err(BridgeError::invalid_state(format!(
                "tunnel {} is already delivering events on this thread",
                self.tunnel
            )));
        }
        guard.set(true);
        let _flag = DeliveryFlag(&*guard);

        self.report_drops();

        let first = if self.closed.load(Ordering::Acquire) {
            self.rx.try_recv().ok()
        } else {
            match (wait, deadline) {
                (Wait::Forever, _) | (Wait::For(_), None) => self.rx.recv().ok(),
                (Wait::Poll, _) => self.rx.try_recv().ok(),
                (Wait::For(_), Some(deadline)) => self.rx.recv_deadline(deadline).ok(),
            }
        };
        let Some(first) = first else {
            return Ok(0);
        };

        let mut delivered = usize::from(self.deliver(first));
        let backlog = self.rx.len();
        for _ in 0..backlog {
            match self.rx.try_recv() {
                Ok(envelope) => delivered += usize::from(self.deliver(envelope)),
                Err(_) => break,
            }
        }
        Ok(delivered)
    }

    fn report_drops(&self) {
        let dropped = self.dropped();
        let reported = self.reported_drops.swap(dropped, Ordering::Relaxed);
        if dropped > reported {
            logger::rate_limited_error(
                ErrorCategory::EventQueueOverflow,
                format!(
                    "tunnel {} event queue full, evicted {} oldest event(s) (dropped={dropped})",
                    self.tunnel,
                    dropped - reported
                ),
            );
        }
    }

    fn deliver(&self, envelope: Envelope) -> bool {
        let Envelope::Event(event) = envelope else {
            return false;
        };
        let kind = event.kind();
        logger::breadcrumb(
            BreadcrumbFlags::EVENTS,
            format!("tunnel {} delivering {:?}", self.tunnel, kind),
        );
        let sink = self.sinks.lock().get(&kind).cloned();
        let Some(sink) = sink else {
            logger::breadcrumb(
                BreadcrumbFlags::EVENTS,
                format!("tunnel {} dropped {:?}: no sink", self.tunnel, kind),
            );
            return false;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| sink.deliver(self.tunnel, &event)));
        if outcome.is_err() {
            logger::rate_limited_error(
                ErrorCategory::CallbackFailure,
                format!("tunnel {} sink for {:?} panicked", self.tunnel, kind),
            );
        }
        true
    }
}
