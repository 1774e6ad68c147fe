//! Shared error types for the AgentMesh substrate.

use thiserror::Error;

/// Top-level error type for the AgentMesh system.
#[derive(Error, Debug)]
pub enum MeshError {
    /// No handler is registered for the requested agent.
    #[error("Agent not registered: {0}")]
    AgentNotRegistered(String),

    /// The message bus is not running.
    #[error("Message bus is stopped")]
    BusStopped,

    /// The trace ID does not name an active trace.
    #[error("Trace not found: {0}")]
    TraceNotFound(String),

    /// The span ID does not name an active span.
    #[error("Span not found: {0}")]
    SpanNotFound(String),

    /// A persistence backend error occurred.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// An agent's task logic failed.
    #[error("Task failed: {0}")]
    TaskFailed(String),

    /// An external collaborator (e.g. the iteration engine) rejected a request.
    #[error("Collaborator error: {0}")]
    Collaborator(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Invalid caller input.
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        MeshError::Serialization(e.to_string())
    }
}

/// Alias for Result with MeshError.
pub type MeshResult<T> = Result<T, MeshError>;
