//! Relational [`MemoryBackend`] over the SQLite tier stores.
//!
//! SQLite calls are blocking, so each operation hops onto the blocking pool.

use crate::substrate::MeshStore;
use agentmesh_types::agent::AgentId;
use agentmesh_types::error::{MeshError, MeshResult};
use agentmesh_types::memory::{
    ConsolidationReport, EpisodicMemory, MemoryBackend, ProceduralMemory, SemanticMemory,
};
use async_trait::async_trait;

/// SQLite-backed memory backend.
#[derive(Clone)]
pub struct SqliteMemoryBackend {
    store: MeshStore,
}

impl SqliteMemoryBackend {
    pub fn new(store: MeshStore) -> Self {
        Self { store }
    }
}

async fn blocking<T, F>(f: F) -> MeshResult<T>
where
    F: FnOnce() -> MeshResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MeshError::Internal(format!("storage task failed: {e}")))?
}

#[async_trait]
impl MemoryBackend for SqliteMemoryBackend {
    async fn store_episodic(&self, memory: &EpisodicMemory) -> MeshResult<()> {
        let store = self.store.episodic();
        let memory = memory.clone();
        blocking(move || store.save(&memory)).await
    }

    async fn retrieve_episodic(&self, agent_id: &AgentId) -> MeshResult<Vec<EpisodicMemory>> {
        let store = self.store.episodic();
        let agent_id = agent_id.clone();
        blocking(move || store.load(&agent_id)).await
    }

    async fn store_semantic(&self, memory: &SemanticMemory) -> MeshResult<()> {
        let store = self.store.semantic();
        let memory = memory.clone();
        blocking(move || store.save(&memory)).await
    }

    async fn retrieve_semantic(&self, agent_id: &AgentId) -> MeshResult<Vec<SemanticMemory>> {
        let store = self.store.semantic();
        let agent_id = agent_id.clone();
        blocking(move || store.load(&agent_id)).await
    }

    async fn store_procedural(&self, memory: &ProceduralMemory) -> MeshResult<()> {
        let store = self.store.procedural();
        let memory = memory.clone();
        blocking(move || store.save(&memory)).await
    }

    async fn retrieve_procedural(&self, agent_id: &AgentId) -> MeshResult<Vec<ProceduralMemory>> {
        let store = self.store.procedural();
        let agent_id = agent_id.clone();
        blocking(move || store.load(&agent_id)).await
    }

    async fn record_consolidation(&self, report: &ConsolidationReport) -> MeshResult<()> {
        let log = self.store.consolidation();
        let report = report.clone();
        blocking(move || log.record(&report)).await
    }
}
