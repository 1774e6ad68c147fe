//! SQLite store for procedural (skill) memories.

use crate::codec::{
    fmt_time, from_json_or_default, lock_err, parse_opt_time, parse_time, storage_err, to_json,
};
use agentmesh_types::agent::AgentId;
use agentmesh_types::error::MeshResult;
use agentmesh_types::memory::{MemoryId, ProceduralMemory};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};

/// Procedural store backed by SQLite.
#[derive(Clone)]
pub struct ProceduralStore {
    conn: Arc<Mutex<Connection>>,
}

impl ProceduralStore {
    /// Create a new procedural store wrapping the given connection.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Insert a skill, or update its usage statistics.
    pub fn save(&self, memory: &ProceduralMemory) -> MeshResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let steps = to_json(&memory.procedure_steps)?;
        conn.execute(
            "INSERT INTO procedural_memory (id, agent_id, skill_name, procedure_steps, success_rate, average_duration, timestamp, last_used, use_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(agent_id, id) DO UPDATE SET
                procedure_steps = ?4, success_rate = ?5, average_duration = ?6, last_used = ?8, use_count = ?9",
            rusqlite::params![
                memory.id.as_str(),
                memory.agent_id.as_str(),
                memory.skill_name,
                steps,
                memory.success_rate,
                memory.average_duration,
                fmt_time(&memory.timestamp),
                memory.last_used.as_ref().map(fmt_time),
                memory.use_count as i64,
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Load all skills for an agent, by success rate then use count.
    pub fn load(&self, agent_id: &AgentId) -> MeshResult<Vec<ProceduralMemory>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, skill_name, procedure_steps, success_rate, average_duration, timestamp, last_used, use_count
                 FROM procedural_memory WHERE agent_id = ?1
                 ORDER BY success_rate DESC, use_count DESC",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(rusqlite::params![agent_id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, f64>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, i64>(7)?,
                ))
            })
            .map_err(storage_err)?;

        let mut skills = Vec::new();
        for row in rows {
            let (id, skill_name, steps, success_rate, avg, ts, last_used, uses) =
                row.map_err(storage_err)?;
            skills.push(ProceduralMemory {
                id: MemoryId(id),
                agent_id: agent_id.clone(),
                skill_name,
                procedure_steps: from_json_or_default("procedure_steps", &steps),
                success_rate,
                average_duration: avg,
                timestamp: parse_time(&ts),
                last_used: parse_opt_time(last_used),
                use_count: uses.max(0) as u64,
            });
        }
        Ok(skills)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::run_migrations;
    use chrono::Utc;

    fn setup() -> ProceduralStore {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        ProceduralStore::new(Arc::new(Mutex::new(conn)))
    }

    #[test]
    fn test_skill_roundtrip_and_update() {
        let store = setup();
        let agent_id = AgentId::from("ops");
        let now = Utc::now();
        let mut skill = ProceduralMemory {
            id: MemoryId::derive(&agent_id, now, &["procedural", "restart_service"]),
            agent_id: agent_id.clone(),
            skill_name: "restart_service".to_string(),
            procedure_steps: vec![
                serde_json::json!({"action": "drain"}),
                serde_json::json!({"action": "restart"}),
            ],
            success_rate: 0.9,
            average_duration: 1200.0,
            timestamp: now,
            last_used: None,
            use_count: 0,
        };
        store.save(&skill).unwrap();
        assert_eq!(store.load(&agent_id).unwrap(), vec![skill.clone()]);

        skill.use_count = 4;
        skill.last_used = Some(Utc::now());
        store.save(&skill).unwrap();
        let loaded = store.load(&agent_id).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].use_count, 4);
        assert_eq!(loaded[0].last_used, skill.last_used);
        assert_eq!(loaded[0].procedure_steps.len(), 2);
    }
}
