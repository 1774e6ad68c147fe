//! SQLite store for episodic (experience) memories.

use crate::codec::{fmt_time, from_json_or_default, lock_err, parse_time, storage_err, to_json};
use agentmesh_types::agent::AgentId;
use agentmesh_types::error::MeshResult;
use agentmesh_types::memory::{EpisodicMemory, MemoryId};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};

/// Episodic store backed by SQLite.
#[derive(Clone)]
pub struct EpisodicStore {
    conn: Arc<Mutex<Connection>>,
}

impl EpisodicStore {
    /// Create a new episodic store wrapping the given connection.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Insert an experience, or refresh it if the ID already exists.
    pub fn save(&self, memory: &EpisodicMemory) -> MeshResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let context = to_json(&memory.context)?;
        conn.execute(
            "INSERT INTO episodic_memory (id, agent_id, event_type, description, context, timestamp, importance, emotional_valence, outcome, learned_from)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(agent_id, id) DO UPDATE SET learned_from = ?10",
            rusqlite::params![
                memory.id.as_str(),
                memory.agent_id.as_str(),
                memory.event_type,
                memory.description,
                context,
                fmt_time(&memory.timestamp),
                memory.importance,
                memory.emotional_valence,
                memory.outcome,
                memory.learned_from,
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Load all experiences for an agent, most recent first.
    pub fn load(&self, agent_id: &AgentId) -> MeshResult<Vec<EpisodicMemory>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, event_type, description, context, timestamp, importance, emotional_valence, outcome, learned_from
                 FROM episodic_memory WHERE agent_id = ?1 ORDER BY timestamp DESC",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(rusqlite::params![agent_id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, f64>(6)?,
                    row.get::<_, Option<String>>(7)?,
                    row.get::<_, bool>(8)?,
                ))
            })
            .map_err(storage_err)?;

        let mut memories = Vec::new();
        for row in rows {
            let (id, event_type, description, context, ts, importance, valence, outcome, learned) =
                row.map_err(storage_err)?;
            memories.push(EpisodicMemory {
                id: MemoryId(id),
                agent_id: agent_id.clone(),
                event_type,
                description,
                context: from_json_or_default("context", &context),
                timestamp: parse_time(&ts),
                importance,
                emotional_valence: valence,
                outcome,
                learned_from: learned,
            });
        }
        Ok(memories)
    }

    /// Number of stored experiences for an agent.
    pub fn count(&self, agent_id: &AgentId) -> MeshResult<usize> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM episodic_memory WHERE agent_id = ?1",
                rusqlite::params![agent_id.as_str()],
                |row| row.get(0),
            )
            .map_err(storage_err)?;
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::run_migrations;
    use chrono::Utc;
    use std::collections::HashMap;

    fn setup() -> EpisodicStore {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        EpisodicStore::new(Arc::new(Mutex::new(conn)))
    }

    fn experience(agent: &str, event_type: &str, secs_ago: i64) -> EpisodicMemory {
        let agent_id = AgentId::from(agent);
        let timestamp = Utc::now() - chrono::Duration::seconds(secs_ago);
        let mut context = HashMap::new();
        context.insert("task".to_string(), serde_json::json!("reconcile"));
        EpisodicMemory {
            id: MemoryId::derive(&agent_id, timestamp, &["episodic", event_type]),
            agent_id,
            event_type: event_type.to_string(),
            description: format!("{event_type} happened"),
            context,
            timestamp,
            importance: 0.8,
            emotional_valence: 0.5,
            outcome: Some("ok".to_string()),
            learned_from: false,
        }
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let store = setup();
        let mem = experience("finance", "task_success", 0);
        store.save(&mem).unwrap();
        let loaded = store.load(&AgentId::from("finance")).unwrap();
        assert_eq!(loaded, vec![mem]);
    }

    #[test]
    fn test_load_orders_most_recent_first_and_scopes_agent() {
        let store = setup();
        store.save(&experience("finance", "old", 60)).unwrap();
        store.save(&experience("finance", "new", 1)).unwrap();
        store.save(&experience("hr", "other", 0)).unwrap();
        let loaded = store.load(&AgentId::from("finance")).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].event_type, "new");
        assert_eq!(store.count(&AgentId::from("hr")).unwrap(), 1);
    }

    #[test]
    fn test_resave_only_updates_learned_flag() {
        let store = setup();
        let mut mem = experience("finance", "task_failure", 0);
        store.save(&mem).unwrap();
        mem.learned_from = true;
        mem.description = "rewritten".to_string();
        store.save(&mem).unwrap();
        let loaded = store.load(&AgentId::from("finance")).unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].learned_from);
        assert_eq!(loaded[0].description, "task_failure happened");
    }
}
