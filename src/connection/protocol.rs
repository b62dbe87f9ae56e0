//! Wire format of the push channel.
//!
//! Both directions use the same envelope: `{"type": ..., "data"?: {...}, "task_id"?: n}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{malformed_message, CoreError, CoreResult};

const TASK_TOPIC_PREFIX: &str = "crawl_task:";
const ALL_TASKS_TOPIC: &str = "crawl_tasks:all";

/// A named stream of push updates
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum Topic {
    /// Updates for a single crawl task
    Task(u64),
    /// Broadcast updates for every task
    AllTasks,
    /// Any other topic the server understands
    Custom(String),
}

impl Topic {
    pub fn task(id: u64) -> Self {
        Topic::Task(id)
    }

    pub fn all_tasks() -> Self {
        Topic::AllTasks
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Task(id) => write!(f, "{}{}", TASK_TOPIC_PREFIX, id),
            Topic::AllTasks => f.write_str(ALL_TASKS_TOPIC),
            Topic::Custom(name) => f.write_str(name),
        }
    }
}

impl FromStr for Topic {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        if s.is_empty() {
            return Err(malformed_message("empty topic"));
        }
        if s == ALL_TASKS_TOPIC {
            return Ok(Topic::AllTasks);
        }
        if let Some(id) = s.strip_prefix(TASK_TOPIC_PREFIX) {
            return id
                .parse::<u64>()
                .map(Topic::Task)
                .map_err(|_| malformed_message(format!("invalid task topic '{}'", s)));
        }
        Ok(Topic::Custom(s.to_string()))
    }
}

impl From<Topic> for String {
    fn from(topic: Topic) -> Self {
        topic.to_string()
    }
}

impl TryFrom<String> for Topic {
    type Error = CoreError;

    fn try_from(value: String) -> CoreResult<Self> {
        value.parse()
    }
}

/// Raw envelope shared by inbound and outbound frames
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<u64>,
}

/// Recognized inbound message kinds
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TaskCreated,
    TaskStarted,
    TaskProgress,
    TaskCompleted,
    TaskFailed,
    TaskStopped,
    TaskDeleted,
    /// Echo of our heartbeat probe
    Heartbeat,
    Subscribed,
    Unsubscribed,
    /// Server-side error notice; the channel stays open
    Error,
    /// A type string this client does not know
    Other(String),
}

impl MessageKind {
    pub fn from_wire(value: &str) -> Self {
        match value {
            "task_created" => MessageKind::TaskCreated,
            "task_started" => MessageKind::TaskStarted,
            "task_progress" => MessageKind::TaskProgress,
            "task_completed" => MessageKind::TaskCompleted,
            "task_failed" => MessageKind::TaskFailed,
            "task_stopped" => MessageKind::TaskStopped,
            "task_deleted" => MessageKind::TaskDeleted,
            "heartbeat" | "pong" => MessageKind::Heartbeat,
            "subscribed" => MessageKind::Subscribed,
            "unsubscribed" => MessageKind::Unsubscribed,
            "error" => MessageKind::Error,
            other => MessageKind::Other(other.to_string()),
        }
    }

    pub fn as_wire(&self) -> &str {
        match self {
            MessageKind::TaskCreated => "task_created",
            MessageKind::TaskStarted => "task_started",
            MessageKind::TaskProgress => "task_progress",
            MessageKind::TaskCompleted => "task_completed",
            MessageKind::TaskFailed => "task_failed",
            MessageKind::TaskStopped => "task_stopped",
            MessageKind::TaskDeleted => "task_deleted",
            MessageKind::Heartbeat => "heartbeat",
            MessageKind::Subscribed => "subscribed",
            MessageKind::Unsubscribed => "unsubscribed",
            MessageKind::Error => "error",
            MessageKind::Other(other) => other,
        }
    }

    /// Whether the kind reports on the lifecycle of a crawl task
    pub fn is_task_update(&self) -> bool {
        matches!(
            self,
            MessageKind::TaskCreated
                | MessageKind::TaskStarted
                | MessageKind::TaskProgress
                | MessageKind::TaskCompleted
                | MessageKind::TaskFailed
                | MessageKind::TaskStopped
                | MessageKind::TaskDeleted
        )
    }
}

/// A parsed push message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub kind: MessageKind,
    /// Message body, `Value::Null` when the envelope carried none
    pub payload: Value,
    /// Task the message concerns; absent for broadcasts
    pub correlation_id: Option<u64>,
}

impl InboundMessage {
    /// Parse a text frame
    pub fn parse(text: &str) -> CoreResult<Self> {
        let envelope: Envelope = serde_json::from_str(text).map_err(malformed_message)?;
        if envelope.message_type.trim().is_empty() {
            return Err(malformed_message("envelope has an empty 'type'"));
        }

        // Some servers only put the task id inside data
        let correlation_id = envelope.task_id.or_else(|| {
            envelope
                .data
                .as_ref()
                .and_then(|d| d.get("task_id"))
                .and_then(Value::as_u64)
        });

        Ok(Self {
            kind: MessageKind::from_wire(&envelope.message_type),
            payload: envelope.data.unwrap_or(Value::Null),
            correlation_id,
        })
    }

    /// Topic string carried by subscribe acknowledgements
    pub fn topic(&self) -> Option<Topic> {
        self.payload
            .get("topic")
            .and_then(Value::as_str)
            .and_then(|t| t.parse().ok())
    }
}

/// Outbound control messages
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Subscribe(Topic),
    Unsubscribe(Topic),
    Heartbeat,
}

impl ControlMessage {
    pub fn to_envelope(&self) -> Envelope {
        match self {
            ControlMessage::Subscribe(topic) => Envelope {
                message_type: "subscribe".to_string(),
                data: Some(json!({ "topic": topic.to_string() })),
                task_id: None,
            },
            ControlMessage::Unsubscribe(topic) => Envelope {
                message_type: "unsubscribe".to_string(),
                data: Some(json!({ "topic": topic.to_string() })),
                task_id: None,
            },
            ControlMessage::Heartbeat => Envelope {
                message_type: "heartbeat".to_string(),
                data: Some(json!({ "timestamp": chrono::Utc::now().timestamp_millis() })),
                task_id: None,
            },
        }
    }

    /// Serialize for the wire
    pub fn to_text(&self) -> CoreResult<String> {
        Ok(serde_json::to_string(&self.to_envelope())?)
    }
}
