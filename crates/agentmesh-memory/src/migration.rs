//! SQLite schema creation and migration.
//!
//! Creates every table used by the tracer, the agent memory system and the
//! self-improvement loop on first boot.

use rusqlite::Connection;

/// Current schema version.
const SCHEMA_VERSION: u32 = 2;

/// Run all migrations to bring the database up to date.
pub fn run_migrations(conn: &Connection) -> Result<(), rusqlite::Error> {
    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    if current_version < 2 {
        migrate_v2(conn)?;
    }

    set_schema_version(conn, SCHEMA_VERSION)?;
    Ok(())
}

/// Get the current schema version from the database.
fn get_schema_version(conn: &Connection) -> u32 {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0)
}

/// Check if a column exists in a table (SQLite has no ADD COLUMN IF NOT EXISTS).
fn column_exists(conn: &Connection, table: &str, column: &str) -> bool {
    let sql = format!("PRAGMA table_info({})", table);
    let Ok(mut stmt) = conn.prepare(&sql) else {
        return false;
    };
    let Ok(rows) = stmt.query_map([], |row| row.get::<_, String>(1)) else {
        return false;
    };
    let names: Vec<String> = rows.filter_map(|r| r.ok()).collect();
    names.iter().any(|n| n == column)
}

/// Set the schema version in the database.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), rusqlite::Error> {
    conn.pragma_update(None, "user_version", version)
}

/// Version 1: tracing, memory and feedback tables.
fn migrate_v1(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        -- Completed spans
        CREATE TABLE IF NOT EXISTS spans (
            id TEXT PRIMARY KEY,
            trace_id TEXT NOT NULL,
            parent_span_id TEXT,
            operation_name TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT,
            duration_ms REAL,
            status TEXT NOT NULL,
            tags TEXT NOT NULL DEFAULT '{}',
            logs TEXT NOT NULL DEFAULT '[]',
            agent_id TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_spans_trace ON spans(trace_id);
        CREATE INDEX IF NOT EXISTS idx_spans_agent ON spans(agent_id);

        -- Completed traces
        CREATE TABLE IF NOT EXISTS traces (
            id TEXT PRIMARY KEY,
            root_span_id TEXT NOT NULL,
            operation_name TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT,
            total_duration_ms REAL,
            status TEXT NOT NULL,
            tags TEXT NOT NULL DEFAULT '{}'
        );

        -- Periodic tracer metrics
        CREATE TABLE IF NOT EXISTS metrics_snapshots (
            id TEXT PRIMARY KEY,
            timestamp TEXT NOT NULL,
            metrics TEXT NOT NULL
        );

        -- Slow/failed span alerts
        CREATE TABLE IF NOT EXISTS performance_alerts (
            id TEXT PRIMARY KEY,
            alert_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            span_id TEXT NOT NULL,
            trace_id TEXT NOT NULL,
            operation_name TEXT NOT NULL,
            agent_id TEXT,
            message TEXT NOT NULL,
            duration_ms REAL NOT NULL,
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_alerts_timestamp ON performance_alerts(timestamp);

        -- Agent memory tiers
        CREATE TABLE IF NOT EXISTS episodic_memory (
            id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            description TEXT NOT NULL,
            context TEXT NOT NULL DEFAULT '{}',
            timestamp TEXT NOT NULL,
            importance REAL NOT NULL,
            emotional_valence REAL NOT NULL,
            outcome TEXT,
            learned_from INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (agent_id, id)
        );
        CREATE INDEX IF NOT EXISTS idx_episodic_agent_ts ON episodic_memory(agent_id, timestamp);

        CREATE TABLE IF NOT EXISTS semantic_memory (
            id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            category TEXT NOT NULL,
            concept TEXT NOT NULL,
            knowledge TEXT NOT NULL DEFAULT '{}',
            confidence REAL NOT NULL,
            source TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            last_accessed TEXT NOT NULL,
            access_count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (agent_id, id)
        );
        CREATE INDEX IF NOT EXISTS idx_semantic_agent_category ON semantic_memory(agent_id, category);

        CREATE TABLE IF NOT EXISTS procedural_memory (
            id TEXT NOT NULL,
            agent_id TEXT NOT NULL,
            skill_name TEXT NOT NULL,
            procedure_steps TEXT NOT NULL DEFAULT '[]',
            success_rate REAL NOT NULL,
            average_duration REAL NOT NULL,
            timestamp TEXT NOT NULL,
            last_used TEXT,
            use_count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (agent_id, id)
        );

        CREATE TABLE IF NOT EXISTS memory_consolidation (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            episodes_reviewed INTEGER NOT NULL,
            patterns_found INTEGER NOT NULL,
            knowledge_ids TEXT NOT NULL DEFAULT '[]',
            timestamp TEXT NOT NULL,
            duration_ms INTEGER NOT NULL
        );

        -- Self-improvement
        CREATE TABLE IF NOT EXISTS performance_feedback (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            task_type TEXT NOT NULL,
            success INTEGER NOT NULL,
            execution_time_ms REAL NOT NULL,
            quality_score REAL NOT NULL,
            user_satisfaction REAL,
            error_details TEXT,
            context TEXT NOT NULL DEFAULT '{}',
            timestamp TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_feedback_agent_ts ON performance_feedback(agent_id, timestamp);

        CREATE TABLE IF NOT EXISTS learning_insights (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            category TEXT NOT NULL,
            pattern TEXT NOT NULL,
            confidence REAL NOT NULL,
            evidence_count INTEGER NOT NULL,
            learned_from TEXT NOT NULL DEFAULT '[]',
            timestamp TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS improvement_actions (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            improvement_type TEXT NOT NULL,
            description TEXT NOT NULL,
            expected_impact REAL NOT NULL,
            implemented INTEGER NOT NULL DEFAULT 0,
            validation_results TEXT,
            timestamp TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

/// Version 2: per-task-type insights and the local opportunity queue.
fn migrate_v2(conn: &Connection) -> Result<(), rusqlite::Error> {
    if !column_exists(conn, "learning_insights", "task_type") {
        conn.execute(
            "ALTER TABLE learning_insights ADD COLUMN task_type TEXT NOT NULL DEFAULT ''",
            [],
        )?;
    }
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS improvement_opportunities (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            iteration_type TEXT NOT NULL,
            impact_score REAL NOT NULL,
            status TEXT NOT NULL,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();

        for expected in [
            "spans",
            "traces",
            "metrics_snapshots",
            "performance_alerts",
            "episodic_memory",
            "semantic_memory",
            "procedural_memory",
            "memory_consolidation",
            "performance_feedback",
            "learning_insights",
            "improvement_actions",
            "improvement_opportunities",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn test_migration_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn), SCHEMA_VERSION);
        assert!(column_exists(&conn, "learning_insights", "task_type"));
    }
}
