//! The shared SQLite handle and accessors for each store.

use crate::backend::SqliteMemoryBackend;
use crate::consolidation::ConsolidationLog;
use crate::episodic::EpisodicStore;
use crate::feedback::FeedbackStore;
use crate::migration::run_migrations;
use crate::procedural::ProceduralStore;
use crate::semantic::SemanticStore;
use crate::trace_store::TraceStore;
use agentmesh_types::error::{MeshError, MeshResult};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::info;

/// Owner of the database connection. Cloning shares the same connection.
#[derive(Clone)]
pub struct MeshStore {
    conn: Arc<Mutex<Connection>>,
}

impl MeshStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: &Path) -> MeshResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path).map_err(|e| MeshError::Storage(e.to_string()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")
            .map_err(|e| MeshError::Storage(e.to_string()))?;
        run_migrations(&conn).map_err(|e| MeshError::Storage(e.to_string()))?;
        info!(path = %path.display(), "Opened agentmesh database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open a private in-memory database (tests, ephemeral runs).
    pub fn open_in_memory() -> MeshResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| MeshError::Storage(e.to_string()))?;
        run_migrations(&conn).map_err(|e| MeshError::Storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn episodic(&self) -> EpisodicStore {
        EpisodicStore::new(Arc::clone(&self.conn))
    }

    pub fn semantic(&self) -> SemanticStore {
        SemanticStore::new(Arc::clone(&self.conn))
    }

    pub fn procedural(&self) -> ProceduralStore {
        ProceduralStore::new(Arc::clone(&self.conn))
    }

    pub fn consolidation(&self) -> ConsolidationLog {
        ConsolidationLog::new(Arc::clone(&self.conn))
    }

    pub fn traces(&self) -> TraceStore {
        TraceStore::new(Arc::clone(&self.conn))
    }

    pub fn feedback(&self) -> FeedbackStore {
        FeedbackStore::new(Arc::clone(&self.conn))
    }

    /// The relational [`MemoryBackend`](agentmesh_types::memory::MemoryBackend).
    pub fn memory_backend(&self) -> SqliteMemoryBackend {
        SqliteMemoryBackend::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_file_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mesh.db");
        let store = MeshStore::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.feedback().count_all().unwrap(), 0);
    }
}
