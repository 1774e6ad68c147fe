//! SQLite store for completed spans and traces, alerts and metrics snapshots.

use crate::codec::{
    fmt_time, from_json_or_default, lock_err, parse_opt_time, parse_time, storage_err, to_json,
};
use agentmesh_types::agent::AgentId;
use agentmesh_types::error::{MeshError, MeshResult};
use agentmesh_types::trace::{
    AlertKind, AlertSeverity, MetricsSnapshot, PerformanceAlert, Span, SpanId, SpanStatus, Trace,
    TraceId, TracingMetrics,
};
use rusqlite::Connection;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Trace store backed by SQLite.
#[derive(Clone)]
pub struct TraceStore {
    conn: Arc<Mutex<Connection>>,
}

fn parse_uuid(column: &str, s: &str) -> MeshResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| MeshError::Storage(format!("bad {column} '{s}': {e}")))
}

impl TraceStore {
    /// Create a new trace store wrapping the given connection.
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    /// Persist a completed span.
    pub fn save_span(&self, span: &Span) -> MeshResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let tags = to_json(&span.tags)?;
        let logs = to_json(&span.logs)?;
        conn.execute(
            "INSERT OR REPLACE INTO spans (id, trace_id, parent_span_id, operation_name, start_time, end_time, duration_ms, status, tags, logs, agent_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                span.id.0.to_string(),
                span.trace_id.0.to_string(),
                span.parent_span_id.map(|p| p.0.to_string()),
                span.operation_name,
                fmt_time(&span.start_time),
                span.end_time.as_ref().map(fmt_time),
                span.duration_ms,
                span.status.as_str(),
                tags,
                logs,
                span.agent_id.as_ref().map(|a| a.as_str().to_string()),
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Persist a completed trace header. Spans are stored separately.
    pub fn save_trace(&self, trace: &Trace) -> MeshResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let tags = to_json(&trace.tags)?;
        conn.execute(
            "INSERT OR REPLACE INTO traces (id, root_span_id, operation_name, start_time, end_time, total_duration_ms, status, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                trace.id.0.to_string(),
                trace.root_span_id.0.to_string(),
                trace.operation_name,
                fmt_time(&trace.start_time),
                trace.end_time.as_ref().map(fmt_time),
                trace.total_duration_ms,
                trace.status.as_str(),
                tags,
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Spans stored for a trace, in start order.
    pub fn load_spans(&self, trace_id: TraceId) -> MeshResult<Vec<Span>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, parent_span_id, operation_name, start_time, end_time, duration_ms, status, tags, logs, agent_id
                 FROM spans WHERE trace_id = ?1 ORDER BY start_time ASC",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(rusqlite::params![trace_id.0.to_string()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<f64>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, Option<String>>(9)?,
                ))
            })
            .map_err(storage_err)?;

        let mut spans = Vec::new();
        for row in rows {
            let (id, parent, op, start, end, duration, status, tags, logs, agent) =
                row.map_err(storage_err)?;
            let parent_span_id = match parent {
                Some(p) => Some(SpanId(parse_uuid("parent_span_id", &p)?)),
                None => None,
            };
            spans.push(Span {
                id: SpanId(parse_uuid("span id", &id)?),
                trace_id,
                parent_span_id,
                operation_name: op,
                start_time: parse_time(&start),
                end_time: parse_opt_time(end),
                duration_ms: duration,
                status: SpanStatus::parse(&status),
                tags: from_json_or_default("tags", &tags),
                logs: from_json_or_default("logs", &logs),
                agent_id: agent.map(AgentId),
            });
        }
        Ok(spans)
    }

    /// Load a persisted trace together with its spans.
    pub fn load_trace(&self, trace_id: TraceId) -> MeshResult<Option<Trace>> {
        let header = {
            let conn = self.conn.lock().map_err(lock_err)?;
            let result = conn.query_row(
                "SELECT root_span_id, operation_name, start_time, end_time, total_duration_ms, status, tags
                 FROM traces WHERE id = ?1",
                rusqlite::params![trace_id.0.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<f64>>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            );
            match result {
                Ok(h) => h,
                Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
                Err(e) => return Err(storage_err(e)),
            }
        };

        let (root, op, start, end, total, status, tags) = header;
        let spans = self.load_spans(trace_id)?;
        Ok(Some(Trace {
            id: trace_id,
            root_span_id: SpanId(parse_uuid("root_span_id", &root)?),
            operation_name: op,
            start_time: parse_time(&start),
            end_time: parse_opt_time(end),
            total_duration_ms: total,
            status: SpanStatus::parse(&status),
            tags: from_json_or_default("tags", &tags),
            spans,
        }))
    }

    /// Number of persisted spans.
    pub fn count_spans(&self) -> MeshResult<usize> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM spans", [], |row| row.get(0))
            .map_err(storage_err)?;
        Ok(n as usize)
    }

    /// Persist an alert.
    pub fn save_alert(&self, alert: &PerformanceAlert) -> MeshResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        conn.execute(
            "INSERT OR REPLACE INTO performance_alerts (id, alert_type, severity, span_id, trace_id, operation_name, agent_id, message, duration_ms, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                alert.id.to_string(),
                alert.kind.as_str(),
                alert.severity.as_str(),
                alert.span_id.0.to_string(),
                alert.trace_id.0.to_string(),
                alert.operation_name,
                alert.agent_id.as_ref().map(|a| a.as_str().to_string()),
                alert.message,
                alert.duration_ms,
                fmt_time(&alert.timestamp),
            ],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// Most recent persisted alerts, newest first.
    pub fn load_alerts(&self, limit: usize) -> MeshResult<Vec<PerformanceAlert>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, alert_type, severity, span_id, trace_id, operation_name, agent_id, message, duration_ms, timestamp
                 FROM performance_alerts ORDER BY timestamp DESC LIMIT ?1",
            )
            .map_err(storage_err)?;
        let rows = stmt
            .query_map(rusqlite::params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, f64>(8)?,
                    row.get::<_, String>(9)?,
                ))
            })
            .map_err(storage_err)?;

        let mut alerts = Vec::new();
        for row in rows {
            let (id, kind, severity, span, trace, op, agent, message, duration, ts) =
                row.map_err(storage_err)?;
            let kind = match kind.as_str() {
                "slow_operation" => AlertKind::SlowOperation,
                "very_slow_operation" => AlertKind::VerySlowOperation,
                _ => AlertKind::OperationError,
            };
            let severity = match severity.as_str() {
                "warning" => AlertSeverity::Warning,
                "critical" => AlertSeverity::Critical,
                _ => AlertSeverity::Error,
            };
            alerts.push(PerformanceAlert {
                id: parse_uuid("alert id", &id)?,
                kind,
                severity,
                span_id: SpanId(parse_uuid("span_id", &span)?),
                trace_id: TraceId(parse_uuid("trace_id", &trace)?),
                operation_name: op,
                agent_id: agent.map(AgentId),
                message,
                duration_ms: duration,
                timestamp: parse_time(&ts),
            });
        }
        Ok(alerts)
    }

    /// Persist a metrics snapshot.
    pub fn save_snapshot(&self, snapshot: &MetricsSnapshot) -> MeshResult<()> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let metrics = to_json(&snapshot.metrics)?;
        conn.execute(
            "INSERT INTO metrics_snapshots (id, timestamp, metrics) VALUES (?1, ?2, ?3)",
            rusqlite::params![snapshot.id.to_string(), fmt_time(&snapshot.timestamp), metrics],
        )
        .map_err(storage_err)?;
        Ok(())
    }

    /// The most recent metrics snapshot, if any.
    pub fn latest_snapshot(&self) -> MeshResult<Option<MetricsSnapshot>> {
        let conn = self.conn.lock().map_err(lock_err)?;
        let result = conn.query_row(
            "SELECT id, timestamp, metrics FROM metrics_snapshots ORDER BY timestamp DESC LIMIT 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        );
        match result {
            Ok((id, ts, metrics)) => Ok(Some(MetricsSnapshot {
                id: parse_uuid("snapshot id", &id)?,
                timestamp: parse_time(&ts),
                metrics: from_json_or_default::<TracingMetrics>("metrics", &metrics),
            })),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(storage_err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::run_migrations;
    use agentmesh_types::trace::{LogLevel, SpanLog};
    use chrono::Utc;
    use std::collections::HashMap;

    fn setup() -> TraceStore {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        TraceStore::new(Arc::new(Mutex::new(conn)))
    }

    fn finished_span(trace_id: TraceId, parent: Option<SpanId>, status: SpanStatus) -> Span {
        let mut tags = HashMap::new();
        tags.insert("task_type".to_string(), "render".to_string());
        let mut span = Span::start(
            trace_id,
            "render_report",
            parent,
            tags,
            Some(AgentId::from("reports")),
        );
        span.logs.push(SpanLog {
            timestamp: Utc::now(),
            level: LogLevel::Info,
            message: "fetched data".to_string(),
            data: HashMap::new(),
        });
        let end = span.start_time + chrono::Duration::milliseconds(42);
        span.finish(status, end);
        span
    }

    #[test]
    fn test_trace_roundtrip() {
        let store = setup();
        let trace_id = TraceId::new();
        let root = finished_span(trace_id, None, SpanStatus::Success);
        let child = finished_span(trace_id, Some(root.id), SpanStatus::Error);
        store.save_span(&root).unwrap();
        store.save_span(&child).unwrap();
        let trace = Trace {
            id: trace_id,
            root_span_id: root.id,
            operation_name: "render_report".to_string(),
            start_time: root.start_time,
            end_time: root.end_time,
            total_duration_ms: root.duration_ms,
            status: SpanStatus::Error,
            tags: HashMap::new(),
            spans: vec![root.clone(), child.clone()],
        };
        store.save_trace(&trace).unwrap();

        let loaded = store.load_trace(trace_id).unwrap().unwrap();
        assert_eq!(loaded.spans.len(), 2);
        assert!(loaded.spans.contains(&root));
        assert!(loaded.spans.contains(&child));
        assert_eq!(loaded.status, SpanStatus::Error);
        assert_eq!(loaded.root_span_id, root.id);
        assert_eq!(store.count_spans().unwrap(), 2);
    }

    #[test]
    fn test_load_missing_trace() {
        let store = setup();
        assert!(store.load_trace(TraceId::new()).unwrap().is_none());
    }

    #[test]
    fn test_alert_and_snapshot_roundtrip() {
        let store = setup();
        let alert = PerformanceAlert {
            id: Uuid::new_v4(),
            kind: AlertKind::VerySlowOperation,
            severity: AlertSeverity::Critical,
            span_id: SpanId::new(),
            trace_id: TraceId::new(),
            operation_name: "export".to_string(),
            agent_id: None,
            message: "took forever".to_string(),
            duration_ms: 31_000.0,
            timestamp: Utc::now(),
        };
        store.save_alert(&alert).unwrap();
        assert_eq!(store.load_alerts(10).unwrap(), vec![alert]);

        assert!(store.latest_snapshot().unwrap().is_none());
        let snapshot = MetricsSnapshot {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            metrics: TracingMetrics {
                total_spans: 3,
                average_duration_ms: 12.5,
                ..Default::default()
            },
        };
        store.save_snapshot(&snapshot).unwrap();
        assert_eq!(store.latest_snapshot().unwrap(), Some(snapshot));
    }
}
