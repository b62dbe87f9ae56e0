//! Typed event bus the core reports through.
//!
//! Session, connection, and push-message events all flow through one
//! [`EventBus`]; UI-facing code subscribes and filters by [`EventKind`].

pub mod streams;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, trace};

use crate::auth::token::{Identity, SessionEndReason};
use crate::connection::protocol::{InboundMessage, MessageKind, Topic};
use crate::connection::state::ConnectionSnapshot;
use crate::error::{CoreError, CoreResult};

pub use streams::{EventStream, Subscriber};

/// Body of a crawl task update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    /// Task the update is about, when the server named one
    pub task_id: Option<u64>,
    pub data: Value,
}

impl From<&InboundMessage> for TaskUpdate {
    fn from(message: &InboundMessage) -> Self {
        Self {
            task_id: message.correlation_id,
            data: message.payload.clone(),
        }
    }
}

/// Everything the core announces to the rest of the application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum CoreEvent {
    // Session lifecycle
    SessionStarted { identity: Option<Identity> },
    CredentialRenewed { expires_at: Option<DateTime<Utc>> },
    SessionEnded { reason: SessionEndReason },

    // Push channel
    ConnectionStateChanged(ConnectionSnapshot),
    ChannelError { error: CoreError, fatal: bool },

    /// Every inbound message, including kinds this client does not know
    Message(InboundMessage),

    TaskCreated(TaskUpdate),
    TaskStarted(TaskUpdate),
    TaskProgress(TaskUpdate),
    TaskCompleted(TaskUpdate),
    TaskFailed(TaskUpdate),
    TaskStopped(TaskUpdate),
    TaskDeleted(TaskUpdate),
    HeartbeatAck,
    Subscribed { topic: Option<Topic> },
    Unsubscribed { topic: Option<Topic> },
    ServerError { message: String },
}

/// Discriminant of [`CoreEvent`], used for filtering and statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStarted,
    CredentialRenewed,
    SessionEnded,
    ConnectionStateChanged,
    ChannelError,
    Message,
    TaskCreated,
    TaskStarted,
    TaskProgress,
    TaskCompleted,
    TaskFailed,
    TaskStopped,
    TaskDeleted,
    HeartbeatAck,
    Subscribed,
    Unsubscribed,
    ServerError,
}

impl CoreEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CoreEvent::SessionStarted { .. } => EventKind::SessionStarted,
            CoreEvent::CredentialRenewed { .. } => EventKind::CredentialRenewed,
            CoreEvent::SessionEnded { .. } => EventKind::SessionEnded,
            CoreEvent::ConnectionStateChanged(_) => EventKind::ConnectionStateChanged,
            CoreEvent::ChannelError { .. } => EventKind::ChannelError,
            CoreEvent::Message(_) => EventKind::Message,
            CoreEvent::TaskCreated(_) => EventKind::TaskCreated,
            CoreEvent::TaskStarted(_) => EventKind::TaskStarted,
            CoreEvent::TaskProgress(_) => EventKind::TaskProgress,
            CoreEvent::TaskCompleted(_) => EventKind::TaskCompleted,
            CoreEvent::TaskFailed(_) => EventKind::TaskFailed,
            CoreEvent::TaskStopped(_) => EventKind::TaskStopped,
            CoreEvent::TaskDeleted(_) => EventKind::TaskDeleted,
            CoreEvent::HeartbeatAck => EventKind::HeartbeatAck,
            CoreEvent::Subscribed { .. } => EventKind::Subscribed,
            CoreEvent::Unsubscribed { .. } => EventKind::Unsubscribed,
            CoreEvent::ServerError { .. } => EventKind::ServerError,
        }
    }

    /// The kind-specific event for an inbound message, `None` for unknown kinds
    pub fn from_message(message: &InboundMessage) -> Option<Self> {
        let event = match &message.kind {
            MessageKind::TaskCreated => CoreEvent::TaskCreated(message.into()),
            MessageKind::TaskStarted => CoreEvent::TaskStarted(message.into()),
            MessageKind::TaskProgress => CoreEvent::TaskProgress(message.into()),
            MessageKind::TaskCompleted => CoreEvent::TaskCompleted(message.into()),
            MessageKind::TaskFailed => CoreEvent::TaskFailed(message.into()),
            MessageKind::TaskStopped => CoreEvent::TaskStopped(message.into()),
            MessageKind::TaskDeleted => CoreEvent::TaskDeleted(message.into()),
            MessageKind::Heartbeat => CoreEvent::HeartbeatAck,
            MessageKind::Subscribed => CoreEvent::Subscribed {
                topic: message.topic(),
            },
            MessageKind::Unsubscribed => CoreEvent::Unsubscribed {
                topic: message.topic(),
            },
            MessageKind::Error => CoreEvent::ServerError {
                message: message
                    .payload
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| message.payload.to_string()),
            },
            MessageKind::Other(_) => return None,
        };
        Some(event)
    }
}

/// Statistics about event bus activity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventBusStats {
    /// Number of events delivered to at least one subscriber
    pub events_published: u64,
    /// Number of events nobody was listening for
    pub events_dropped: u64,
    /// Count of events by kind
    pub kind_counts: HashMap<EventKind, u64>,
}

/// Central bus distributing [`CoreEvent`]s to subscribers
#[derive(Clone)]
pub struct EventBus {
    stream: EventStream<CoreEvent>,
    stats: Arc<RwLock<EventBusStats>>,
}

impl EventBus {
    /// Create a bus with the given channel capacity and replay buffer size
    pub fn new(capacity: usize, buffer_size: usize) -> Self {
        info!(capacity, buffer_size, "Creating new event bus");
        Self {
            stream: EventStream::new(capacity, buffer_size),
            stats: Arc::new(RwLock::new(EventBusStats::default())),
        }
    }

    pub fn subscribe(&self) -> EventSubscriber {
        trace!("New subscriber registered to event bus");
        EventSubscriber {
            inner: self.stream.subscribe(),
        }
    }

    /// Publish an event; returns the number of subscribers that received it.
    ///
    /// Publishing with no subscribers is counted as dropped and returns `Ok(0)`.
    pub async fn publish(&self, event: CoreEvent) -> CoreResult<usize> {
        let kind = event.kind();
        trace!(?kind, "Publishing event to bus");

        let receivers = self.stream.publish(event).await;

        // Stats are updated before returning so callers can assert on them
        let mut stats = self.stats.write().await;
        if receivers == 0 {
            stats.events_dropped += 1;
            debug!(?kind, "Event published with no receivers");
        } else {
            stats.events_published += 1;
        }
        *stats.kind_counts.entry(kind).or_insert(0) += 1;

        Ok(receivers)
    }

    pub async fn get_stats(&self) -> EventBusStats {
        self.stats.read().await.clone()
    }

    pub async fn reset_stats(&self) {
        *self.stats.write().await = EventBusStats::default();
        debug!("Event bus statistics reset");
    }

    pub fn subscriber_count(&self) -> usize {
        self.stream.receiver_count()
    }

    /// Size of the replay buffer
    pub fn buffer_size(&self) -> usize {
        self.stream.history_limit()
    }
}

/// Receiving end of the [`EventBus`]
pub struct EventSubscriber {
    inner: Subscriber<CoreEvent>,
}

impl EventSubscriber {
    pub async fn recv(&mut self) -> Result<CoreEvent, broadcast::error::RecvError> {
        self.inner.recv().await
    }

    /// Next event of one of the given kinds; `None` once the bus is gone
    pub async fn recv_kind(&mut self, kinds: &[EventKind]) -> Option<CoreEvent> {
        self.inner
            .recv_matching(|event| kinds.contains(&event.kind()))
            .await
    }

    /// Next event that is not a raw [`CoreEvent::Message`]
    pub async fn recv_typed(&mut self) -> Option<CoreEvent> {
        self.inner
            .recv_matching(|event| event.kind() != EventKind::Message)
            .await
    }

    pub fn try_recv(&mut self) -> Option<CoreEvent> {
        self.inner.try_recv()
    }

    /// Recent events, oldest first
    pub async fn replay(&self) -> Vec<CoreEvent> {
        self.inner.history().await
    }
}
