//! Distributed tracing types: spans, traces, alerts and latency metrics.

use crate::agent::AgentId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(pub Uuid);

impl TraceId {
    /// Create a new random TraceId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanId(pub Uuid);

impl SpanId {
    /// Create a new random SpanId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SpanId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SpanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a span. `Success` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Running,
    Success,
    Error,
}

impl SpanStatus {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanStatus::Running => "running",
            SpanStatus::Success => "success",
            SpanStatus::Error => "error",
        }
    }

    /// Parse the storage form. Unknown values map to `Error`.
    pub fn parse(s: &str) -> Self {
        match s {
            "running" => SpanStatus::Running,
            "success" => SpanStatus::Success,
            _ => SpanStatus::Error,
        }
    }

    /// Whether the span has finished.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SpanStatus::Running)
    }
}

impl std::fmt::Display for SpanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity of a span log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// A timestamped log line attached to a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanLog {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

/// A timed unit of work within a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Unique ID.
    pub id: SpanId,
    /// The trace this span belongs to.
    pub trace_id: TraceId,
    /// Parent span; `None` only for the trace's root.
    pub parent_span_id: Option<SpanId>,
    /// What the span measures.
    pub operation_name: String,
    /// When the span was opened.
    pub start_time: DateTime<Utc>,
    /// When the span was closed (`None` while running).
    pub end_time: Option<DateTime<Utc>>,
    /// `(end_time - start_time)` in milliseconds, set on end.
    pub duration_ms: Option<f64>,
    /// Current state.
    pub status: SpanStatus,
    /// Free-form tags. Errors are recorded under `"error"`.
    pub tags: HashMap<String, String>,
    /// Ordered log lines.
    pub logs: Vec<SpanLog>,
    /// Agent that owns the span, if any.
    pub agent_id: Option<AgentId>,
}

impl Span {
    /// Open a new running span.
    pub fn start(
        trace_id: TraceId,
        operation_name: impl Into<String>,
        parent_span_id: Option<SpanId>,
        tags: HashMap<String, String>,
        agent_id: Option<AgentId>,
    ) -> Self {
        Self {
            id: SpanId::new(),
            trace_id,
            parent_span_id,
            operation_name: operation_name.into(),
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
            status: SpanStatus::Running,
            tags,
            logs: Vec::new(),
            agent_id,
        }
    }

    /// Close the span at `end_time` with a terminal status.
    pub fn finish(&mut self, status: SpanStatus, end_time: DateTime<Utc>) {
        self.end_time = Some(end_time);
        self.duration_ms = Some(millis_between(self.start_time, end_time));
        self.status = status;
    }
}

/// Milliseconds between two instants, with sub-millisecond precision.
pub fn millis_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let delta = end - start;
    match delta.num_microseconds() {
        Some(us) => us as f64 / 1000.0,
        None => delta.num_milliseconds() as f64,
    }
}

/// All spans produced by one logical operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub id: TraceId,
    pub root_span_id: SpanId,
    pub operation_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_duration_ms: Option<f64>,
    /// `Error` iff any collected span errored; `Running` until the trace ends.
    pub status: SpanStatus,
    pub tags: HashMap<String, String>,
    /// Spans collected as they end.
    pub spans: Vec<Span>,
}

impl Trace {
    /// Derive the overall status from the collected spans.
    pub fn derived_status(&self) -> SpanStatus {
        if self.spans.iter().any(|s| s.status == SpanStatus::Error) {
            SpanStatus::Error
        } else {
            SpanStatus::Success
        }
    }
}

/// What an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SlowOperation,
    VerySlowOperation,
    OperationError,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::SlowOperation => "slow_operation",
            AlertKind::VerySlowOperation => "very_slow_operation",
            AlertKind::OperationError => "operation_error",
        }
    }
}

/// How urgent an alert is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Error,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Warning => "warning",
            AlertSeverity::Error => "error",
            AlertSeverity::Critical => "critical",
        }
    }
}

/// An alert raised when a span ends slow or in error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceAlert {
    pub id: Uuid,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub span_id: SpanId,
    pub trace_id: TraceId,
    pub operation_name: String,
    pub agent_id: Option<AgentId>,
    pub message: String,
    pub duration_ms: f64,
    pub timestamp: DateTime<Utc>,
}

/// Aggregate latency and outcome counters for the tracer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TracingMetrics {
    pub total_spans: u64,
    pub successful_spans: u64,
    pub failed_spans: u64,
    pub total_traces: u64,
    /// Running mean of span duration.
    pub average_duration_ms: f64,
    /// Approximate percentile, resolved to the histogram bucket width.
    pub p95_latency_ms: f64,
    /// Approximate percentile, resolved to the histogram bucket width.
    pub p99_latency_ms: f64,
    pub active_spans: u64,
    pub active_traces: u64,
}

/// A persisted point-in-time copy of [`TracingMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub metrics: TracingMetrics,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_finish_computes_duration() {
        let mut span = Span::start(TraceId::new(), "op", None, HashMap::new(), None);
        let end = span.start_time + chrono::Duration::milliseconds(1250);
        span.finish(SpanStatus::Success, end);
        assert_eq!(span.duration_ms, Some(1250.0));
        assert!(span.status.is_terminal());
    }

    #[test]
    fn test_status_roundtrip() {
        for s in [SpanStatus::Running, SpanStatus::Success, SpanStatus::Error] {
            assert_eq!(SpanStatus::parse(s.as_str()), s);
        }
    }

    #[test]
    fn test_trace_status_error_if_any_span_errors() {
        let trace_id = TraceId::new();
        let mut ok = Span::start(trace_id, "a", None, HashMap::new(), None);
        ok.finish(SpanStatus::Success, Utc::now());
        let mut bad = Span::start(trace_id, "b", Some(ok.id), HashMap::new(), None);
        bad.finish(SpanStatus::Error, Utc::now());
        let mut trace = Trace {
            id: trace_id,
            root_span_id: ok.id,
            operation_name: "a".into(),
            start_time: Utc::now(),
            end_time: None,
            total_duration_ms: None,
            status: SpanStatus::Running,
            tags: HashMap::new(),
            spans: vec![ok],
        };
        assert_eq!(trace.derived_status(), SpanStatus::Success);
        trace.spans.push(bad);
        assert_eq!(trace.derived_status(), SpanStatus::Error);
    }
}
