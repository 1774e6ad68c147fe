//! SQLite store for semantic (knowledge) memories.

use crate::codec::{fmt_time, from_json_or_default, lock_err, parse_time, storage_err, to_json};
use agentmesh_types::agent::AgentId;
use agentmesh_types::error::MeshResult;
use agentmesh_types::memory::{MemoryId, SemanticMemory};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};

/// Semantic store backed by SQLite.
#[derive(Clone)]
pub struct SemanticStore {
    conn: Arc<Mutex<Connection>>,
}

impl SemanticStore {
    /// Create a new semantic store wrapping the given connection.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Insert a knowledge record, or update the mutable fields of an existing one.
    pub fn save(&self, memory: &SemanticMemory) -> MeshResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let knowledge = to_json(&memory.knowledge)?;
        conn.execute(
            "INSERT INTO semantic_memory (id, agent_id, category, concept, knowledge, confidence, source, timestamp, last_accessed, access_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(agent_id, id) DO UPDATE SET
                knowledge = ?5, confidence = ?6, last_accessed = ?9, access_count = ?10",
            rusqlite::params![
                memory.id.as_str(),
                memory.agent_id.as_str(),
                memory.category,
                memory.concept,
                knowledge,
                memory.confidence,
                memory.source,
                fmt_time(&memory.timestamp),
                fmt_time(&memory.last_accessed),
                memory.access_count as i64,
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Load all knowledge for an agent, by confidence then access count.
    pub fn load(&self, agent_id: &AgentId) -> MeshResult<Vec<SemanticMemory>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, category, concept, knowledge, confidence, source, timestamp, last_accessed, access_count
                 FROM semantic_memory WHERE agent_id = ?1
                 ORDER BY confidence DESC, access_count DESC",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(rusqlite::params![agent_id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, i64>(8)?,
                ))
            })
            .map_err(storage_err)?;

        let mut memories = Vec::new();
        for row in rows {
            let (id, category, concept, knowledge, confidence, source, ts, accessed, count) =
                row.map_err(storage_err)?;
            memories.push(SemanticMemory {
                id: MemoryId(id),
                agent_id: agent_id.clone(),
                category,
                concept,
                knowledge: from_json_or_default("knowledge", &knowledge),
                confidence,
                source,
                timestamp: parse_time(&ts),
                last_accessed: parse_time(&accessed),
                access_count: count.max(0) as u64,
            });
        }
        Ok(memories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::run_migrations;
    use chrono::Utc;
    use std::collections::HashMap;

    fn setup() -> SemanticStore {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        SemanticStore::new(Arc::new(Mutex::new(conn)))
    }

    fn fact(concept: &str, confidence: f64, access_count: u64) -> SemanticMemory {
        let agent_id = AgentId::from("sales");
        let now = Utc::now();
        let mut knowledge = HashMap::new();
        knowledge.insert("detail".to_string(), serde_json::json!(concept));
        SemanticMemory {
            id: MemoryId::derive(&agent_id, now, &["semantic", concept]),
            agent_id,
            category: "customers".to_string(),
            concept: concept.to_string(),
            knowledge,
            confidence,
            source: "crm".to_string(),
            timestamp: now,
            last_accessed: now,
            access_count,
        }
    }

    #[test]
    fn test_save_and_load_ordering() {
        let store = setup();
        store.save(&fact("low", 0.4, 9)).unwrap();
        store.save(&fact("high-rare", 0.9, 1)).unwrap();
        store.save(&fact("high-popular", 0.9, 5)).unwrap();
        let loaded = store.load(&AgentId::from("sales")).unwrap();
        let concepts: Vec<_> = loaded.iter().map(|m| m.concept.as_str()).collect();
        assert_eq!(concepts, vec!["high-popular", "high-rare", "low"]);
    }

    #[test]
    fn test_upsert_updates_access_fields() {
        let store = setup();
        let mut mem = fact("pricing", 0.7, 0);
        store.save(&mem).unwrap();
        mem.access_count = 3;
        mem.last_accessed = Utc::now();
        store.save(&mem).unwrap();
        let loaded = store.load(&AgentId::from("sales")).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0], mem);
    }
}
