//! Messages exchanged between agents over the in-process bus.

use crate::agent::AgentId;
use crate::trace::TraceId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    /// Create a new random MessageId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Default priority for messages that don't set one.
pub const DEFAULT_PRIORITY: i32 = 1;

/// A message between agents. `recipient_id` is `None` for broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique ID.
    pub id: MessageId,
    /// Sending agent.
    pub sender_id: AgentId,
    /// Receiving agent, absent for broadcast.
    pub recipient_id: Option<AgentId>,
    /// Type tag, e.g. "task_request" or "status_update".
    pub message_type: String,
    /// Opaque payload.
    pub content: HashMap<String, serde_json::Value>,
    /// When the sender created the message.
    pub created_at: DateTime<Utc>,
    /// Higher is more urgent.
    pub priority: i32,
    /// Whether the sender expects a response.
    pub response_required: bool,
    /// Correlation to an active trace, if any.
    pub trace_id: Option<TraceId>,
}

impl Message {
    /// Create a point-to-point message.
    pub fn new(
        sender_id: AgentId,
        recipient_id: AgentId,
        message_type: impl Into<String>,
        content: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            sender_id,
            recipient_id: Some(recipient_id),
            message_type: message_type.into(),
            content,
            created_at: Utc::now(),
            priority: DEFAULT_PRIORITY,
            response_required: false,
            trace_id: None,
        }
    }

    /// Create a broadcast message (no recipient).
    pub fn broadcast(
        sender_id: AgentId,
        message_type: impl Into<String>,
        content: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            recipient_id: None,
            ..Self::new(sender_id.clone(), sender_id, message_type, content)
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Mark the message as expecting a response.
    pub fn expecting_response(mut self) -> Self {
        self.response_required = true;
        self
    }

    /// Attach a trace correlation ID.
    pub fn with_trace(mut self, trace_id: Option<TraceId>) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Build a reply addressed back to this message's sender.
    pub fn reply(
        &self,
        from: AgentId,
        content: HashMap<String, serde_json::Value>,
    ) -> Self {
        Self::new(
            from,
            self.sender_id.clone(),
            format!("{}_response", self.message_type),
            content,
        )
        .with_trace(self.trace_id)
    }

    /// True if this message has no specific recipient.
    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_none()
    }
}
