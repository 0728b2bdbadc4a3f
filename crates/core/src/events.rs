//! Typed publish/subscribe for session events.
//!
//! Emitters push onto a queue and a single dispatcher task delivers each event to a
//! snapshot of the subscribers registered for its kind. Delivery order is emission order,
//! and handlers run outside every orchestrator lock, so they may call back into the session.

use crate::error::SessionError;
use crate::lock;
use crate::transcript::TranscriptEntry;
use crate::types::{Role, VoiceProfile};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

/// Closed set of event kinds a subscriber can register for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    CallStart,
    CallEnd,
    Message,
    SpeechStart,
    SpeechEnd,
    Error,
    VoiceSettingsUpdated,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::CallStart,
        EventKind::CallEnd,
        EventKind::Message,
        EventKind::SpeechStart,
        EventKind::SpeechEnd,
        EventKind::Error,
        EventKind::VoiceSettingsUpdated,
    ];
}

/// Which engine a `speech-start`/`speech-end` pair belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeechSource {
    Capture,
    Playback,
}

/// Only finalized transcripts are ever published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptType {
    Final,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptMessage {
    pub role: Role,
    pub transcript: String,
    pub transcript_type: TranscriptType,
    pub timestamp: DateTime<Utc>,
}

impl From<&TranscriptEntry> for TranscriptMessage {
    fn from(entry: &TranscriptEntry) -> Self {
        Self {
            role: entry.role,
            transcript: entry.content.clone(),
            transcript_type: TranscriptType::Final,
            timestamp: entry.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    CallStart,
    CallEnd,
    Message(TranscriptMessage),
    SpeechStart(SpeechSource),
    SpeechEnd(SpeechSource),
    Error(SessionError),
    VoiceSettingsUpdated(VoiceProfile),
}

impl SessionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::CallStart => EventKind::CallStart,
            SessionEvent::CallEnd => EventKind::CallEnd,
            SessionEvent::Message(_) => EventKind::Message,
            SessionEvent::SpeechStart(_) => EventKind::SpeechStart,
            SessionEvent::SpeechEnd(_) => EventKind::SpeechEnd,
            SessionEvent::Error(_) => EventKind::Error,
            SessionEvent::VoiceSettingsUpdated(_) => EventKind::VoiceSettingsUpdated,
        }
    }
}

/// Token returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId {
    kind: EventKind,
    id: u64,
}

impl SubscriptionId {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

type Handler = Arc<dyn Fn(&SessionEvent) + Send + Sync>;
// Keyed by a monotonic id, so iteration order is subscription order.
type Subscribers = Arc<Mutex<HashMap<EventKind, BTreeMap<u64, Handler>>>>;

enum Dispatch {
    Event(SessionEvent),
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct EventBus {
    subscribers: Subscribers,
    next_id: Arc<AtomicU64>,
    queue: mpsc::UnboundedSender<Dispatch>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<EventKind, usize> = lock(&self.subscribers)
            .iter()
            .map(|(kind, handlers)| (*kind, handlers.len()))
            .collect();
        f.debug_struct("EventBus")
            .field("subscribers", &counts)
            .finish()
    }
}

impl EventBus {
    /// Creates the bus and spawns its dispatcher. Must be called within a Tokio runtime.
    pub fn new() -> Self {
        let subscribers: Subscribers = Arc::new(Mutex::new(HashMap::new()));
        let (queue, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(subscribers.clone(), rx));
        Self {
            subscribers,
            next_id: Arc::new(AtomicU64::new(1)),
            queue,
        }
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.insert(kind, Arc::new(handler))
    }

    /// Registers one handler for every event kind.
    pub fn subscribe_all<F>(&self, handler: F) -> Vec<SubscriptionId>
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let handler: Handler = Arc::new(handler);
        EventKind::ALL
            .iter()
            .map(|kind| self.insert(*kind, handler.clone()))
            .collect()
    }

    fn insert(&self, kind: EventKind, handler: Handler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscribers)
            .entry(kind)
            .or_default()
            .insert(id, handler);
        SubscriptionId { kind, id }
    }

    /// Returns `false` if the subscription was already removed.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        lock(&self.subscribers)
            .get_mut(&subscription.kind)
            .is_some_and(|handlers| handlers.remove(&subscription.id).is_some())
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        lock(&self.subscribers)
            .get(&kind)
            .map_or(0, |handlers| handlers.len())
    }

    pub fn emit(&self, event: SessionEvent) {
        tracing::trace!(kind = ?event.kind(), "emitting session event");
        if self.queue.send(Dispatch::Event(event)).is_err() {
            tracing::warn!("Event dispatcher has stopped; dropping event.");
        }
    }

    /// Resolves once every event emitted before this call has reached its handlers.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.queue.send(Dispatch::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn dispatch(subscribers: Subscribers, mut rx: mpsc::UnboundedReceiver<Dispatch>) {
    while let Some(item) = rx.recv().await {
        match item {
            Dispatch::Event(event) => {
                let handlers: Vec<Handler> = lock(&subscribers)
                    .get(&event.kind())
                    .map(|handlers| handlers.values().cloned().collect())
                    .unwrap_or_default();
                for handler in handlers {
                    if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                        tracing::error!(kind = ?event.kind(), "Session event handler panicked.");
                    }
                }
            }
            Dispatch::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("Event dispatcher stopped.");
}
