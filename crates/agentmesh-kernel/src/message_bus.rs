//! Message bus: point-to-point and broadcast delivery between named agents.
//!
//! `send_message` hands the message straight to the recipient's handler and
//! suspends the caller until that handler finishes, so a single sender's
//! messages to one recipient are processed in send order. Broadcast fans out
//! to every recipient concurrently. There is no retry: delivery is
//! at-most-once per call.

use agentmesh_types::agent::AgentId;
use agentmesh_types::error::{MeshError, MeshResult};
use agentmesh_types::message::Message;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Default number of messages retained in the history ring buffer.
pub const DEFAULT_HISTORY_SIZE: usize = 1000;

/// What a handler returns: an optional reply, or an application error.
pub type HandlerResult = MeshResult<Option<Message>>;

/// Receives messages addressed to one registered agent.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> HandlerResult;
}

/// Adapter that turns an async closure into a [`MessageHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, message: Message) -> HandlerResult {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Delivery counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusStats {
    /// Messages accepted for routing (one per recipient for broadcasts).
    pub total_sent: u64,
    /// Messages whose handler was invoked, whether or not it succeeded.
    pub total_delivered: u64,
    /// Messages that could not be routed.
    pub total_failed: u64,
    /// Mean time from send to handler completion.
    pub average_latency_ms: f64,
}

#[derive(Default)]
struct LatencyTotals {
    total_ms: f64,
    count: u64,
}

/// The in-process bus shared by every agent.
pub struct MessageBus {
    handlers: DashMap<AgentId, Arc<dyn MessageHandler>>,
    running: AtomicBool,
    total_sent: AtomicU64,
    total_delivered: AtomicU64,
    total_failed: AtomicU64,
    latency: Mutex<LatencyTotals>,
    history: RwLock<VecDeque<Message>>,
    history_size: usize,
}

impl MessageBus {
    /// Create a stopped bus. Call [`start`](Self::start) before sending.
    pub fn new() -> Self {
        Self::with_history_size(DEFAULT_HISTORY_SIZE)
    }

    pub fn with_history_size(history_size: usize) -> Self {
        Self {
            handlers: DashMap::new(),
            running: AtomicBool::new(false),
            total_sent: AtomicU64::new(0),
            total_delivered: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            latency: Mutex::new(LatencyTotals::default()),
            history: RwLock::new(VecDeque::with_capacity(history_size.min(1024))),
            history_size,
        }
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
        info!(agents = self.handlers.len(), "Message bus started");
    }

    /// Stop accepting messages. In-flight deliveries finish normally.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("Message bus stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register (or replace) the handler for `agent_id`.
    pub fn register_agent(&self, agent_id: AgentId, handler: Arc<dyn MessageHandler>) {
        if self.handlers.insert(agent_id.clone(), handler).is_some() {
            debug!(agent = %agent_id, "Replaced existing message handler");
        } else {
            debug!(agent = %agent_id, "Registered agent on message bus");
        }
    }

    /// Remove an agent's handler. Returns whether one was registered.
    pub fn unregister_agent(&self, agent_id: &AgentId) -> bool {
        self.handlers.remove(agent_id).is_some()
    }

    pub fn is_registered(&self, agent_id: &AgentId) -> bool {
        self.handlers.contains_key(agent_id)
    }

    /// IDs of every registered agent, sorted.
    pub fn registered_agents(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.handlers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Deliver `message` to its recipient and wait for the handler to finish.
    ///
    /// Returns `false` without raising when the bus is stopped, the message
    /// has no recipient, or the recipient isn't registered. A handler that
    /// errors or panics still counts as delivered.
    pub async fn send_message(&self, message: Message) -> bool {
        self.try_send(message).await.is_ok()
    }

    /// Like [`send_message`](Self::send_message) but returns the handler's reply.
    pub async fn request(&self, message: Message) -> Option<Message> {
        self.try_send(message).await.ok().flatten()
    }

    /// Build and broadcast a message from `sender_id`. Returns recipients attempted.
    pub async fn broadcast_message(
        &self,
        sender_id: AgentId,
        message_type: impl Into<String>,
        content: HashMap<String, serde_json::Value>,
    ) -> usize {
        self.broadcast(Message::broadcast(sender_id, message_type, content))
            .await
    }

    /// Deliver `message` to every registered agent except its sender, concurrently.
    pub async fn broadcast(&self, message: Message) -> usize {
        let started = Instant::now();
        if !self.is_running() {
            self.total_failed.fetch_add(1, Ordering::Relaxed);
            debug!(sender = %message.sender_id, "Broadcast rejected: bus stopped");
            return 0;
        }

        let targets: Vec<(AgentId, Arc<dyn MessageHandler>)> = self
            .handlers
            .iter()
            .filter(|e| e.key() != &message.sender_id)
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        let count = targets.len();
        self.total_sent.fetch_add(count as u64, Ordering::Relaxed);
        self.record_history(&message).await;

        debug!(
            message_id = %message.id,
            sender = %message.sender_id,
            message_type = %message.message_type,
            recipients = count,
            "Broadcasting message"
        );

        let deliveries = targets
            .into_iter()
            .map(|(recipient, handler)| self.invoke(recipient, handler, message.clone(), started));
        futures::future::join_all(deliveries).await;
        count
    }

    /// Current counters.
    pub fn get_stats(&self) -> BusStats {
        let average_latency_ms = match self.latency.lock() {
            Ok(l) if l.count > 0 => l.total_ms / l.count as f64,
            _ => 0.0,
        };
        BusStats {
            total_sent: self.total_sent.load(Ordering::Relaxed),
            total_delivered: self.total_delivered.load(Ordering::Relaxed),
            total_failed: self.total_failed.load(Ordering::Relaxed),
            average_latency_ms,
        }
    }

    /// Recent messages, newest first.
    pub async fn history(&self, limit: usize) -> Vec<Message> {
        let history = self.history.read().await;
        history.iter().rev().take(limit).cloned().collect()
    }

    /// Route a point-to-point message, reporting why it couldn't be routed.
    ///
    /// On success returns the handler's reply, if any.
    pub async fn try_send(&self, message: Message) -> MeshResult<Option<Message>> {
        let started = Instant::now();
        if !self.is_running() {
            self.total_failed.fetch_add(1, Ordering::Relaxed);
            debug!(message_id = %message.id, "Send rejected: bus stopped");
            return Err(MeshError::BusStopped);
        }

        let Some(recipient) = message.recipient_id.clone() else {
            self.total_failed.fetch_add(1, Ordering::Relaxed);
            warn!(message_id = %message.id, "Message has no recipient; use broadcast");
            return Err(MeshError::InvalidInput(
                "point-to-point message without recipient".to_string(),
            ));
        };

        // Clone the handler out so no map guard is held across the await.
        let handler = match self.handlers.get(&recipient) {
            Some(entry) => Arc::clone(entry.value()),
            None => {
                self.total_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    message_id = %message.id,
                    sender = %message.sender_id,
                    recipient = %recipient,
                    "Recipient not registered"
                );
                return Err(MeshError::AgentNotRegistered(recipient.to_string()));
            }
        };

        self.total_sent.fetch_add(1, Ordering::Relaxed);
        self.record_history(&message).await;
        Ok(self.invoke(recipient, handler, message, started).await)
    }

    async fn invoke(
        &self,
        recipient: AgentId,
        handler: Arc<dyn MessageHandler>,
        message: Message,
        started: Instant,
    ) -> Option<Message> {
        let message_id = message.id;
        let outcome = AssertUnwindSafe(handler.handle(message))
            .catch_unwind()
            .await;
        let reply = match outcome {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!(%message_id, recipient = %recipient, error = %e, "Message handler failed");
                None
            }
            Err(_) => {
                error!(%message_id, recipient = %recipient, "Message handler panicked");
                None
            }
        };

        self.total_delivered.fetch_add(1, Ordering::Relaxed);
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        if let Ok(mut l) = self.latency.lock() {
            l.total_ms += elapsed_ms;
            l.count += 1;
        }
        reply
    }

    async fn record_history(&self, message: &Message) {
        if self.history_size == 0 {
            return;
        }
        let mut history = self.history.write().await;
        if history.len() >= self.history_size {
            history.pop_front();
        }
        history.push_back(message.clone());
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}
