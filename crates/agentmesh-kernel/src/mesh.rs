//! Mesh assembly: opens the store and builds the shared agent services.

use crate::agent::AgentServices;
use crate::agent_memory::AgentMemorySystem;
use crate::background::{BackgroundRuntime, LoopIntervals};
use crate::error::{KernelError, KernelResult};
use crate::message_bus::MessageBus;
use crate::self_improvement::SelfImprovementSystem;
use crate::tracer::Tracer;
use agentmesh_memory::MeshStore;
use agentmesh_types::config::MeshConfig;
use agentmesh_types::improvement::{IterationEngine, NoopIterationEngine};
use agentmesh_types::memory::MemoryBackend;
use std::sync::Arc;
use tracing::{info, warn};

/// A fully wired mesh: store, services and configuration.
pub struct AgentMesh {
    config: MeshConfig,
    store: MeshStore,
    services: AgentServices,
}

impl AgentMesh {
    /// Open the database named by `config`, build the services and start the bus.
    pub async fn boot(config: MeshConfig) -> KernelResult<Self> {
        Self::boot_with_engine(config, Arc::new(NoopIterationEngine)).await
    }

    /// Like [`boot`](Self::boot) with an iteration engine for opportunities.
    pub async fn boot_with_engine(
        config: MeshConfig,
        engine: Arc<dyn IterationEngine>,
    ) -> KernelResult<Self> {
        let db_path = config.resolved_db_path();
        let store = MeshStore::open(&db_path)
            .map_err(|e| KernelError::BootFailed(format!("{}: {e}", db_path.display())))?;
        info!(path = %db_path.display(), "Opened mesh store");
        Self::assemble(config, store, engine).await
    }

    /// A mesh backed by an in-memory database.
    pub async fn in_memory(config: MeshConfig) -> KernelResult<Self> {
        let store = MeshStore::open_in_memory()?;
        Self::assemble(config, store, Arc::new(NoopIterationEngine)).await
    }

    async fn assemble(
        config: MeshConfig,
        store: MeshStore,
        engine: Arc<dyn IterationEngine>,
    ) -> KernelResult<Self> {
        let bus = Arc::new(MessageBus::with_history_size(config.bus.history_size));
        let tracer = Arc::new(Tracer::new(config.tracing.clone(), store.traces()));
        let backend: Arc<dyn MemoryBackend> = Arc::new(store.memory_backend());
        let memory = Arc::new(AgentMemorySystem::new(backend, config.memory.clone()));
        let improvement = Arc::new(SelfImprovementSystem::new(
            config.improvement.clone(),
            Some(store.feedback()),
            engine,
        ));

        if let Err(e) = improvement
            .load_recent(config.improvement.analysis_window_days)
            .await
        {
            warn!(error = %e, "Failed to load recent feedback; starting empty");
        }
        bus.start();

        Ok(Self {
            config,
            store,
            services: AgentServices {
                bus,
                tracer,
                memory,
                improvement,
            },
        })
    }

    /// Shared services to hand to each agent.
    pub fn services(&self) -> AgentServices {
        self.services.clone()
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn store(&self) -> &MeshStore {
        &self.store
    }

    /// Start the maintenance loops with the configured intervals.
    pub fn spawn_background(&self) -> BackgroundRuntime {
        BackgroundRuntime::spawn(
            Arc::clone(&self.services.tracer),
            Arc::clone(&self.services.improvement),
            LoopIntervals::from_config(&self.config),
        )
    }

    /// Stop the bus, take a final metrics snapshot and wait for pending
    /// trace writes.
    pub async fn shutdown(&self) {
        self.services.bus.stop();
        self.services.tracer.snapshot_metrics();
        self.services.tracer.flush().await;
        info!("Agent mesh shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_mesh_starts_bus() {
        let mesh = AgentMesh::in_memory(MeshConfig::default()).await.unwrap();
        let services = mesh.services();
        assert!(services.bus.is_running());
        assert!(services.bus.registered_agents().is_empty());

        mesh.shutdown().await;
        assert!(!services.bus.is_running());
        assert!(mesh.store().traces().latest_snapshot().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_boot_creates_database_under_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = MeshConfig {
            data_dir: dir.path().join("nested"),
            ..MeshConfig::default()
        };
        let mesh = AgentMesh::boot(config).await.unwrap();
        assert!(dir.path().join("nested").join("agentmesh.db").exists());
        assert!(mesh.services().bus.is_running());
    }

    #[tokio::test]
    async fn test_background_runtime_stops_on_shutdown() {
        let mesh = AgentMesh::in_memory(MeshConfig::default()).await.unwrap();
        let runtime = mesh.spawn_background();
        assert_eq!(runtime.running_loops().len(), 4);
        runtime.shutdown().await;
    }
}
