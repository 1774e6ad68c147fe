//! Log of memory consolidation passes.
//!
//! Each pass that distills repeated experiences into knowledge leaves one row
//! in `memory_consolidation`.

use crate::codec::{fmt_time, from_json_or_default, lock_err, parse_time, storage_err, to_json};
use agentmesh_types::agent::AgentId;
use agentmesh_types::error::MeshResult;
use agentmesh_types::memory::{ConsolidationReport, MemoryId};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};

/// Consolidation history backed by SQLite.
#[derive(Clone)]
pub struct ConsolidationLog {
    conn: Arc<Mutex<Connection>>,
}

impl ConsolidationLog {
    /// Create a new consolidation log wrapping the given connection.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Append a report.
    pub fn record(&self, report: &ConsolidationReport) -> MeshResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let ids = to_json(&report.knowledge_ids)?;
        conn.execute(
            "INSERT OR REPLACE INTO memory_consolidation (id, agent_id, episodes_reviewed, patterns_found, knowledge_ids, timestamp, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                report.id.as_str(),
                report.agent_id.as_str(),
                report.episodes_reviewed as i64,
                report.patterns_found as i64,
                ids,
                fmt_time(&report.timestamp),
                report.duration_ms as i64,
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Reports for an agent, newest first.
    pub fn history(&self, agent_id: &AgentId, limit: usize) -> MeshResult<Vec<ConsolidationReport>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, episodes_reviewed, patterns_found, knowledge_ids, timestamp, duration_ms
                 FROM memory_consolidation WHERE agent_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(rusqlite::params![agent_id.as_str(), limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })
            .map_err(storage_err)?;

        let mut reports = Vec::new();
        for row in rows {
            let (id, reviewed, found, ids, ts, duration) = row.map_err(storage_err)?;
            reports.push(ConsolidationReport {
                id: MemoryId(id),
                agent_id: agent_id.clone(),
                episodes_reviewed: reviewed.max(0) as u64,
                patterns_found: found.max(0) as u64,
                knowledge_ids: from_json_or_default("knowledge_ids", &ids),
                timestamp: parse_time(&ts),
                duration_ms: duration.max(0) as u64,
            });
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::run_migrations;
    use chrono::Utc;

    fn setup() -> ConsolidationLog {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        ConsolidationLog::new(Arc::new(Mutex::new(conn)))
    }

    #[test]
    fn test_history_empty() {
        let log = setup();
        assert!(log.history(&AgentId::from("a"), 10).unwrap().is_empty());
    }

    #[test]
    fn test_record_and_history() {
        let log = setup();
        let agent_id = AgentId::from("support");
        let now = Utc::now();
        let report = ConsolidationReport {
            id: MemoryId::derive(&agent_id, now, &["consolidation"]),
            agent_id: agent_id.clone(),
            episodes_reviewed: 12,
            patterns_found: 2,
            knowledge_ids: vec![MemoryId("k1".into()), MemoryId("k2".into())],
            timestamp: now,
            duration_ms: 3,
        };
        log.record(&report).unwrap();
        assert_eq!(log.history(&agent_id, 10).unwrap(), vec![report]);
    }
}
