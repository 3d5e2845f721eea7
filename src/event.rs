//! Lifecycle events for diagnostics and tests. Emitting an event never
//! changes what an execution does.
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    PipelineStarted,
    Admitted,
    ConnectionAcquired,
    HeadersWritten,
    BodyWritten,
    ResponseHeadersReceived,
    RedirectFollowed,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
    WsUpgradePipeline,
    WsOpened,
    WsCloseFrameSent,
    WsCloseFrameReceived,
    WsClosed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::PipelineStarted => "pipeline started",
            EventKind::Admitted => "admitted",
            EventKind::ConnectionAcquired => "connection acquired",
            EventKind::HeadersWritten => "headers written",
            EventKind::BodyWritten => "body written",
            EventKind::ResponseHeadersReceived => "response headers received",
            EventKind::RedirectFollowed => "redirect followed",
            EventKind::Completed => "completed",
            EventKind::Failed => "failed",
            EventKind::TimedOut => "timed out",
            EventKind::Cancelled => "cancelled",
            EventKind::WsUpgradePipeline => "websocket upgrade pipeline",
            EventKind::WsOpened => "websocket opened",
            EventKind::WsCloseFrameSent => "websocket close frame sent",
            EventKind::WsCloseFrameReceived => "websocket close frame received",
            EventKind::WsClosed => "websocket closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct Event {
    /// Execution or session identity.
    pub id: u64,
    pub kind: EventKind,
    /// Client-wide, strictly increasing.
    pub sequence: u64,
    pub at: Instant,
}

pub trait EventBus: Send + Sync + 'static {
    fn trigger(&self, event: &Event);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEventBus;

impl EventBus for NoopEventBus {
    #[inline]
    fn trigger(&self, _event: &Event) {}
}

/// Writes every event to `tracing` at trace level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingEventBus;

impl EventBus for LoggingEventBus {
    #[inline]
    fn trigger(&self, _event: &Event) {
        #[cfg(feature = "logging")]
        tracing::trace!(
            id = _event.id,
            sequence = _event.sequence,
            "{}",
            _event.kind
        );
    }
}

/// Keeps every event, optionally forwarding to another bus.
#[derive(Default)]
pub struct RecordingEventBus {
    events: Mutex<Vec<Event>>,
    delegate: Option<Arc<dyn EventBus>>,
}

impl RecordingEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delegate(delegate: Arc<dyn EventBus>) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            delegate: Some(delegate),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn has_triggered(&self, kind: EventKind) -> bool {
        self.events.lock().iter().any(|e| e.kind == kind)
    }

    /// Kinds emitted for one execution or session, in sequence order.
    pub fn kinds_for(&self, id: u64) -> Vec<EventKind> {
        let mut events: Vec<Event> = self
            .events
            .lock()
            .iter()
            .filter(|e| e.id == id)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.sequence);
        events.into_iter().map(|e| e.kind).collect()
    }
}

impl EventBus for RecordingEventBus {
    fn trigger(&self, event: &Event) {
        self.events.lock().push(event.clone());
        if let Some(delegate) = &self.delegate {
            delegate.trigger(event);
        }
    }
}

impl fmt::Debug for RecordingEventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingEventBus")
            .field("events", &self.events.lock().len())
            .finish()
    }
}

/// Stamps events for one execution with the client-wide sequence.
#[derive(Clone)]
pub(crate) struct EventEmitter {
    bus: Arc<dyn EventBus>,
    sequence: Arc<AtomicU64>,
    id: u64,
}

impl EventEmitter {
    pub(crate) fn new(bus: Arc<dyn EventBus>, sequence: Arc<AtomicU64>, id: u64) -> Self {
        Self { bus, sequence, id }
    }

    #[inline]
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn emit(&self, kind: EventKind) {
        let event = Event {
            id: self.id,
            kind,
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
            at: Instant::now(),
        };
        self.bus.trigger(&event);
    }
}
