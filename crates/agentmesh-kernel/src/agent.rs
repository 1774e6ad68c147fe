//! Enhanced agent: an agent wired into the bus, tracer, memory and
//! self-improvement services.

use crate::agent_memory::{AgentMemorySystem, Experience};
use crate::message_bus::{HandlerResult, MessageBus, MessageHandler};
use crate::self_improvement::SelfImprovementSystem;
use crate::tracer::{current_context, Tracer};
use agentmesh_types::agent::AgentId;
use agentmesh_types::error::MeshResult;
use agentmesh_types::improvement::TaskFeedback;
use agentmesh_types::message::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// The four shared services, constructed once and handed to every agent.
#[derive(Clone)]
pub struct AgentServices {
    pub bus: Arc<MessageBus>,
    pub tracer: Arc<Tracer>,
    pub memory: Arc<AgentMemorySystem>,
    pub improvement: Arc<SelfImprovementSystem>,
}

/// A unit of work handed to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub task_type: String,
    pub description: String,
    pub payload: HashMap<String, Value>,
}

impl Task {
    pub fn new(task_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_type: task_type.into(),
            description: description.into(),
            payload: HashMap::new(),
        }
    }

    pub fn with_payload(mut self, payload: HashMap<String, Value>) -> Self {
        self.payload = payload;
        self
    }
}

/// What a successful task produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub result: Value,
    /// Self-assessed quality (0.0 - 1.0).
    pub quality_score: f64,
}

impl TaskOutput {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            quality_score: 1.0,
        }
    }

    pub fn with_quality(mut self, quality_score: f64) -> Self {
        self.quality_score = quality_score;
        self
    }
}

/// Agent-specific logic plugged into an [`EnhancedAgent`].
#[async_trait]
pub trait AgentBehavior: Send + Sync {
    /// Do the work. An `Err` is recorded as a failure and returned to the caller.
    async fn execute_task(&self, task: &Task) -> MeshResult<TaskOutput>;

    /// React to an inbound message. The default ignores it.
    async fn handle_message(&self, _message: &Message) -> HandlerResult {
        Ok(None)
    }
}

/// Bus handler for one agent: records the message, then defers to the behavior.
struct AgentInbox {
    agent_id: AgentId,
    behavior: Arc<dyn AgentBehavior>,
    memory: Arc<AgentMemorySystem>,
}

#[async_trait]
impl MessageHandler for AgentInbox {
    async fn handle(&self, message: Message) -> HandlerResult {
        let mut context = HashMap::new();
        context.insert("sender_id".to_string(), Value::from(message.sender_id.as_str()));
        context.insert("message_type".to_string(), Value::from(message.message_type.as_str()));
        context.insert("message_id".to_string(), Value::from(message.id.to_string()));
        let experience = Experience::new(
            "message_received",
            format!("Received '{}' from {}", message.message_type, message.sender_id),
        )
        .with_context(context)
        .with_importance(0.5);
        if let Err(e) = self.memory.remember_experience(&self.agent_id, experience).await {
            warn!(agent = %self.agent_id, error = %e, "Failed to record inbound message");
        }

        self.behavior.handle_message(&message).await
    }
}

/// An agent composed with the shared services.
pub struct EnhancedAgent {
    id: AgentId,
    behavior: Arc<dyn AgentBehavior>,
    services: AgentServices,
}

impl EnhancedAgent {
    /// Build the agent, reload its persisted memories and register it on the bus.
    ///
    /// A failed reload is logged; the agent starts with whatever is in memory.
    pub async fn new(
        id: AgentId,
        behavior: Arc<dyn AgentBehavior>,
        services: AgentServices,
    ) -> Self {
        match services.memory.load_agent(&id).await {
            Ok(0) => {}
            Ok(restored) => info!(agent = %id, restored, "Restored agent memories"),
            Err(e) => warn!(agent = %id, error = %e, "Failed to restore agent memories"),
        }
        let inbox = AgentInbox {
            agent_id: id.clone(),
            behavior: Arc::clone(&behavior),
            memory: Arc::clone(&services.memory),
        };
        services.bus.register_agent(id.clone(), Arc::new(inbox));
        info!(agent = %id, "Agent registered");
        Self {
            id,
            behavior,
            services,
        }
    }

    pub fn id(&self) -> &AgentId {
        &self.id
    }

    pub fn services(&self) -> &AgentServices {
        &self.services
    }

    /// Run a task inside a span and record the outcome to memory and feedback.
    ///
    /// The behavior's error, if any, is returned unchanged after recording.
    pub async fn execute_task(&self, task: &Task) -> MeshResult<TaskOutput> {
        let mut tags = HashMap::new();
        tags.insert("agent_id".to_string(), self.id.to_string());
        tags.insert("task_type".to_string(), task.task_type.clone());
        tags.insert("task_id".to_string(), task.id.to_string());
        let operation = format!("{}.execute_task", self.id);

        self.services
            .tracer
            .trace_operation(&operation, tags, Some(self.id.clone()), || async {
                let started = Instant::now();
                let result = self.behavior.execute_task(task).await;
                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                self.record_outcome(task, &result, elapsed_ms).await;
                result
            })
            .await
    }

    async fn record_outcome(&self, task: &Task, result: &MeshResult<TaskOutput>, elapsed_ms: f64) {
        let mut context = HashMap::new();
        context.insert("task_id".to_string(), Value::from(task.id.to_string()));
        context.insert("task_type".to_string(), Value::from(task.task_type.as_str()));
        context.insert("execution_time_ms".to_string(), Value::from(elapsed_ms));

        let (experience, feedback) = match result {
            Ok(output) => (
                Experience::new("task_success", format!("Completed {}", task.task_type))
                    .with_context(context)
                    .with_importance(0.8)
                    .with_valence(0.5)
                    .with_outcome("success"),
                TaskFeedback::new(
                    self.id.clone(),
                    task.task_type.as_str(),
                    true,
                    elapsed_ms,
                    output.quality_score.clamp(0.0, 1.0),
                ),
            ),
            Err(e) => {
                let error = e.to_string();
                context.insert("error".to_string(), Value::from(error.as_str()));
                (
                    Experience::new("task_failure", format!("Failed {}: {error}", task.task_type))
                        .with_context(context)
                        .with_importance(0.9)
                        .with_valence(-0.5)
                        .with_outcome("failure"),
                    TaskFeedback::new(
                        self.id.clone(),
                        task.task_type.as_str(),
                        false,
                        elapsed_ms,
                        0.0,
                    )
                    .with_error(error),
                )
            }
        };

        if let Err(e) = self.services.memory.remember_experience(&self.id, experience).await {
            warn!(agent = %self.id, error = %e, "Failed to record task experience");
        }
        if let Err(e) = self.services.improvement.record_feedback(feedback).await {
            warn!(agent = %self.id, error = %e, "Failed to record task feedback");
        }
    }

    /// Send a message through the bus and remember having sent it.
    pub async fn send_message(
        &self,
        recipient_id: AgentId,
        message_type: impl Into<String>,
        content: HashMap<String, Value>,
    ) -> bool {
        let message = Message::new(self.id.clone(), recipient_id, message_type, content)
            .with_trace(current_context().map(|ctx| ctx.trace_id));
        let recipient = message.recipient_id.clone();
        let message_type = message.message_type.clone();
        let delivered = self.services.bus.send_message(message).await;

        let mut context = HashMap::new();
        if let Some(recipient) = &recipient {
            context.insert("recipient_id".to_string(), Value::from(recipient.as_str()));
        }
        context.insert("message_type".to_string(), Value::from(message_type.as_str()));
        context.insert("delivered".to_string(), Value::from(delivered));
        self.remember_send(
            Experience::new("message_sent", format!("Sent '{message_type}'")).with_context(context),
        )
        .await;
        delivered
    }

    /// Send a message and wait for the recipient's reply.
    pub async fn request(
        &self,
        recipient_id: AgentId,
        message_type: impl Into<String>,
        content: HashMap<String, Value>,
    ) -> Option<Message> {
        let message = Message::new(self.id.clone(), recipient_id, message_type, content)
            .expecting_response()
            .with_trace(current_context().map(|ctx| ctx.trace_id));
        self.services.bus.request(message).await
    }

    /// Broadcast to every other agent. Returns the number of recipients.
    pub async fn broadcast_message(
        &self,
        message_type: impl Into<String>,
        content: HashMap<String, Value>,
    ) -> usize {
        let message = Message::broadcast(self.id.clone(), message_type, content)
            .with_trace(current_context().map(|ctx| ctx.trace_id));
        let message_type = message.message_type.clone();
        let recipients = self.services.bus.broadcast(message).await;

        let mut context = HashMap::new();
        context.insert("message_type".to_string(), Value::from(message_type.as_str()));
        context.insert("recipients".to_string(), Value::from(recipients));
        self.remember_send(
            Experience::new("message_broadcast", format!("Broadcast '{message_type}'"))
                .with_context(context),
        )
        .await;
        recipients
    }

    async fn remember_send(&self, experience: Experience) {
        let experience = experience.with_importance(0.3);
        if let Err(e) = self.services.memory.remember_experience(&self.id, experience).await {
            warn!(agent = %self.id, error = %e, "Failed to record outbound message");
        }
    }

    /// Unregister from the bus. The agent can no longer receive messages.
    pub fn shutdown(&self) {
        if self.services.bus.unregister_agent(&self.id) {
            info!(agent = %self.id, "Agent unregistered");
        } else {
            debug!(agent = %self.id, "Agent was not registered");
        }
    }
}
