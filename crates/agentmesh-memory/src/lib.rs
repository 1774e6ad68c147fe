//! Persistence substrate for the AgentMesh agent platform.
//!
//! All durable state lives in one SQLite database reached through a single
//! mutex-guarded connection, so writes from concurrent agents are serialized:
//! - **Memory tiers**: episodic, semantic and procedural stores plus the
//!   consolidation log, exposed to the kernel through [`SqliteMemoryBackend`]
//! - **Trace store**: completed spans, traces, alerts and metrics snapshots
//! - **Feedback store**: task feedback, learned insights, suggested actions
//!   and queued improvement opportunities

pub mod backend;
pub mod consolidation;
pub mod episodic;
pub mod feedback;
pub mod migration;
pub mod procedural;
pub mod semantic;
pub mod trace_store;

mod codec;
mod substrate;
pub use backend::SqliteMemoryBackend;
pub use substrate::MeshStore;
