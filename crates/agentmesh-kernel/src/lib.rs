//! Core of the agentmesh substrate: message bus, tracer, agent memory,
//! self-improvement loop and the enhanced agent that composes them.

pub mod agent;
pub mod agent_memory;
pub mod background;
pub mod config;
pub mod error;
pub mod logging;
pub mod mesh;
pub mod message_bus;
pub mod self_improvement;
pub mod tracer;
mod trace_writer;

pub use agent::{AgentBehavior, AgentServices, EnhancedAgent, Task, TaskOutput};
pub use error::{KernelError, KernelResult};
pub use mesh::AgentMesh;
pub use message_bus::MessageBus;
pub use tracer::Tracer;
