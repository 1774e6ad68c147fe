//! Distributed tracing: spans grouped into traces, latency metrics, and
//! performance alerts.
//!
//! The "current span" travels with the task through a `tokio::task_local!`
//! scope set up by [`Tracer::trace_operation`]. Nested awaited calls see the
//! enclosing span; concurrently running tasks each see their own. Work handed
//! to `tokio::spawn` must be wrapped in [`with_current_context`] to inherit it.

use crate::trace_writer::TraceWriter;
use agentmesh_memory::trace_store::TraceStore;
use agentmesh_types::agent::AgentId;
use agentmesh_types::config::TracingConfig;
use agentmesh_types::error::{MeshError, MeshResult};
use agentmesh_types::trace::{
    millis_between, AlertKind, AlertSeverity, LogLevel, MetricsSnapshot, PerformanceAlert, Span,
    SpanId, SpanLog, SpanStatus, Trace, TraceId, TracingMetrics,
};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt::Display;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

tokio::task_local! {
    static TRACE_CONTEXT: TraceContext;
}

/// The span a task is currently running inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

/// The context of the calling task, if it runs inside a traced operation.
pub fn current_context() -> Option<TraceContext> {
    TRACE_CONTEXT.try_with(|ctx| *ctx).ok()
}

/// Carry the caller's trace context into a future that will run elsewhere.
pub async fn with_current_context<F: Future>(fut: F) -> F::Output {
    match current_context() {
        Some(ctx) => TRACE_CONTEXT.scope(ctx, fut).await,
        None => fut.await,
    }
}

#[derive(Default)]
struct SpanStats {
    total_spans: u64,
    successful_spans: u64,
    failed_spans: u64,
    total_traces: u64,
    average_duration_ms: f64,
    /// Bucket index -> count. Bucket `i` covers `[i * width, (i + 1) * width)`.
    histogram: BTreeMap<u64, u64>,
}

impl SpanStats {
    fn record(&mut self, duration_ms: f64, status: SpanStatus, bucket_ms: f64) {
        self.total_spans += 1;
        match status {
            SpanStatus::Error => self.failed_spans += 1,
            _ => self.successful_spans += 1,
        }
        let n = self.total_spans as f64;
        self.average_duration_ms += (duration_ms - self.average_duration_ms) / n;

        let bucket = (duration_ms.max(0.0) / bucket_ms).floor() as u64;
        *self.histogram.entry(bucket).or_insert(0) += 1;
    }

    /// Lower edge of the first bucket where the cumulative count reaches `p`.
    fn percentile(&self, p: f64, bucket_ms: f64) -> f64 {
        let total: u64 = self.histogram.values().sum();
        if total == 0 {
            return 0.0;
        }
        let threshold = p * total as f64;
        let mut cumulative = 0u64;
        for (bucket, count) in &self.histogram {
            cumulative += count;
            if cumulative as f64 >= threshold {
                return *bucket as f64 * bucket_ms;
            }
        }
        self.histogram
            .keys()
            .next_back()
            .map(|b| *b as f64 * bucket_ms)
            .unwrap_or(0.0)
    }
}

/// Records spans and traces for every agent in the mesh.
pub struct Tracer {
    config: TracingConfig,
    store: Option<TraceStore>,
    writer: Option<TraceWriter>,
    active_spans: DashMap<SpanId, Span>,
    active_traces: DashMap<TraceId, Trace>,
    stats: Mutex<SpanStats>,
    alerts: Mutex<VecDeque<PerformanceAlert>>,
}

impl Tracer {
    /// A tracer that persists completed spans, traces and alerts.
    pub fn new(config: TracingConfig, store: TraceStore) -> Self {
        Self::build(config, Some(store))
    }

    /// A tracer that keeps everything in memory.
    pub fn in_memory(config: TracingConfig) -> Self {
        Self::build(config, None)
    }

    fn build(config: TracingConfig, store: Option<TraceStore>) -> Self {
        Self {
            config,
            writer: store.clone().map(TraceWriter::spawn),
            store,
            active_spans: DashMap::new(),
            active_traces: DashMap::new(),
            stats: Mutex::new(SpanStats::default()),
            alerts: Mutex::new(VecDeque::new()),
        }
    }

    /// Begin a new trace with its root span. Returns the trace ID.
    pub fn start_trace(&self, operation_name: &str, tags: HashMap<String, String>) -> TraceId {
        self.open_trace(operation_name, tags, None).trace_id
    }

    /// Root span of an active trace.
    pub fn root_span_id(&self, trace_id: TraceId) -> Option<SpanId> {
        self.active_traces.get(&trace_id).map(|t| t.root_span_id)
    }

    fn open_trace(
        &self,
        operation_name: &str,
        tags: HashMap<String, String>,
        agent_id: Option<AgentId>,
    ) -> TraceContext {
        let trace_id = TraceId::new();
        let root = Span::start(trace_id, operation_name, None, tags.clone(), agent_id);
        let trace = Trace {
            id: trace_id,
            root_span_id: root.id,
            operation_name: operation_name.to_string(),
            start_time: root.start_time,
            end_time: None,
            total_duration_ms: None,
            status: SpanStatus::Running,
            tags,
            spans: Vec::new(),
        };
        let ctx = TraceContext {
            trace_id,
            span_id: root.id,
        };

        if let Some(writer) = &self.writer {
            writer.save_trace(trace.clone());
        }
        debug!(trace_id = %trace_id, operation = operation_name, "Trace started");
        self.active_spans.insert(root.id, root);
        self.active_traces.insert(trace_id, trace);
        ctx
    }

    /// Open a span inside an active trace.
    ///
    /// Without an explicit parent the span nests under the task's current span
    /// when that belongs to the same trace, else under the trace's root.
    pub fn start_span(
        &self,
        trace_id: TraceId,
        operation_name: &str,
        parent_span_id: Option<SpanId>,
        tags: HashMap<String, String>,
        agent_id: Option<AgentId>,
    ) -> MeshResult<SpanId> {
        let root_span_id = self
            .root_span_id(trace_id)
            .ok_or_else(|| MeshError::TraceNotFound(trace_id.to_string()))?;
        let parent = parent_span_id
            .or_else(|| {
                current_context()
                    .filter(|ctx| ctx.trace_id == trace_id)
                    .map(|ctx| ctx.span_id)
            })
            .unwrap_or(root_span_id);

        let span = Span::start(trace_id, operation_name, Some(parent), tags, agent_id);
        let span_id = span.id;
        self.active_spans.insert(span_id, span);
        Ok(span_id)
    }

    /// Finish a span. Ending an unknown or already-ended span is a logged no-op.
    pub fn end_span(&self, span_id: SpanId, status: SpanStatus, error: Option<&str>) {
        let Some((_, mut span)) = self.active_spans.remove(&span_id) else {
            warn!(span_id = %span_id, "end_span called for a span that is not active");
            return;
        };

        let status = if status.is_terminal() {
            status
        } else {
            warn!(span_id = %span_id, "end_span called with a running status; recording success");
            SpanStatus::Success
        };
        span.finish(status, Utc::now());
        if let Some(text) = error {
            span.tags.insert("error".to_string(), text.to_string());
        }
        let duration_ms = span.duration_ms.unwrap_or(0.0);

        if let Ok(mut stats) = self.stats.lock() {
            stats.record(duration_ms, status, self.bucket_ms());
        }
        for alert in self.evaluate_alerts(&span, duration_ms) {
            self.raise_alert(alert);
        }

        if let Some(writer) = &self.writer {
            writer.save_span(span.clone());
        }

        match self.active_traces.get_mut(&span.trace_id) {
            Some(mut trace) => trace.spans.push(span),
            None => debug!(
                span_id = %span_id,
                trace_id = %span.trace_id,
                "Span ended after its trace closed"
            ),
        }
    }

    /// Close a trace.
    ///
    /// Child spans still running are ended as errors tagged `abandoned=true`,
    /// so the trace's status accounts for them; a still-running root span is
    /// then ended as a success. Returns the completed trace, or `None` if it
    /// wasn't active.
    pub fn end_trace(&self, trace_id: TraceId) -> Option<Trace> {
        if let Some(root) = self.root_span_id(trace_id) {
            let lingering: Vec<SpanId> = self
                .active_spans
                .iter()
                .filter(|s| s.trace_id == trace_id && s.id != root)
                .map(|s| *s.key())
                .collect();
            for span_id in lingering {
                self.abandon_span(span_id, "abandoned: trace ended before span");
            }
            if self.active_spans.contains_key(&root) {
                self.end_span(root, SpanStatus::Success, None);
            }
        }

        let Some((_, mut trace)) = self.active_traces.remove(&trace_id) else {
            warn!(trace_id = %trace_id, "end_trace called for a trace that is not active");
            return None;
        };

        let end = Utc::now();
        trace.end_time = Some(end);
        trace.total_duration_ms = Some(millis_between(trace.start_time, end));
        trace.status = trace.derived_status();

        if let Ok(mut stats) = self.stats.lock() {
            stats.total_traces += 1;
        }
        if let Some(writer) = &self.writer {
            writer.save_trace(trace.clone());
        }
        debug!(
            trace_id = %trace_id,
            status = trace.status.as_str(),
            spans = trace.spans.len(),
            "Trace ended"
        );
        Some(trace)
    }

    /// Run `f` inside a span.
    ///
    /// Starts a new trace when the caller has no active context, otherwise
    /// nests under the caller's span. The span is ended on every exit path:
    /// `Ok` records success, `Err` records the error text and is returned
    /// unchanged, and a panic or cancellation records an error.
    pub async fn trace_operation<F, Fut, T, E>(
        &self,
        operation_name: &str,
        tags: HashMap<String, String>,
        agent_id: Option<AgentId>,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let (ctx, owns_trace) = match current_context() {
            Some(parent) if self.active_traces.contains_key(&parent.trace_id) => {
                match self.start_span(
                    parent.trace_id,
                    operation_name,
                    Some(parent.span_id),
                    tags.clone(),
                    agent_id.clone(),
                ) {
                    Ok(span_id) => (
                        TraceContext {
                            trace_id: parent.trace_id,
                            span_id,
                        },
                        false,
                    ),
                    Err(_) => (self.open_trace(operation_name, tags, agent_id), true),
                }
            }
            _ => (self.open_trace(operation_name, tags, agent_id), true),
        };

        let mut guard = SpanGuard {
            tracer: self,
            ctx,
            owns_trace,
            armed: true,
        };
        let result = TRACE_CONTEXT.scope(ctx, async move { f().await }).await;
        guard.armed = false;

        match &result {
            Ok(_) => self.end_span(ctx.span_id, SpanStatus::Success, None),
            Err(e) => {
                let text = e.to_string();
                self.end_span(ctx.span_id, SpanStatus::Error, Some(&text));
            }
        }
        if owns_trace {
            self.end_trace(ctx.trace_id);
        }
        result
    }

    /// Attach a log entry to an active span.
    pub fn log_span(
        &self,
        span_id: SpanId,
        level: LogLevel,
        message: impl Into<String>,
        data: HashMap<String, serde_json::Value>,
    ) -> MeshResult<()> {
        let mut span = self
            .active_spans
            .get_mut(&span_id)
            .ok_or_else(|| MeshError::SpanNotFound(span_id.to_string()))?;
        span.logs.push(SpanLog {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            data,
        });
        Ok(())
    }

    /// Log to the calling task's current span. A no-op outside any span.
    pub fn log_current(
        &self,
        level: LogLevel,
        message: impl Into<String>,
        data: HashMap<String, serde_json::Value>,
    ) {
        if let Some(ctx) = current_context() {
            if let Err(e) = self.log_span(ctx.span_id, level, message, data) {
                debug!(error = %e, "Dropped span log");
            }
        }
    }

    pub fn current_span_id(&self) -> Option<SpanId> {
        current_context().map(|ctx| ctx.span_id)
    }

    pub fn current_trace_id(&self) -> Option<TraceId> {
        current_context().map(|ctx| ctx.trace_id)
    }

    /// A running span by ID.
    pub fn active_span(&self, span_id: SpanId) -> Option<Span> {
        self.active_spans.get(&span_id).map(|s| s.clone())
    }

    /// Aggregate metrics across every span ended so far.
    pub fn get_metrics(&self) -> TracingMetrics {
        let bucket_ms = self.bucket_ms();
        let mut metrics = match self.stats.lock() {
            Ok(stats) => TracingMetrics {
                total_spans: stats.total_spans,
                successful_spans: stats.successful_spans,
                failed_spans: stats.failed_spans,
                total_traces: stats.total_traces,
                average_duration_ms: stats.average_duration_ms,
                p95_latency_ms: stats.percentile(0.95, bucket_ms),
                p99_latency_ms: stats.percentile(0.99, bucket_ms),
                ..Default::default()
            },
            Err(_) => TracingMetrics::default(),
        };
        metrics.active_spans = self.active_spans.len() as u64;
        metrics.active_traces = self.active_traces.len() as u64;
        metrics
    }

    /// Capture and persist the current metrics.
    pub fn snapshot_metrics(&self) -> MetricsSnapshot {
        let snapshot = MetricsSnapshot {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            metrics: self.get_metrics(),
        };
        if let Some(writer) = &self.writer {
            writer.save_snapshot(snapshot.clone());
        }
        snapshot
    }

    /// Most recent alerts, newest first.
    pub fn recent_alerts(&self, limit: usize) -> Vec<PerformanceAlert> {
        match self.alerts.lock() {
            Ok(alerts) => alerts.iter().rev().take(limit).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Read a completed (or in-progress) trace back from storage, after
    /// every queued write has landed.
    pub async fn load_trace(&self, trace_id: TraceId) -> MeshResult<Option<Trace>> {
        let Some(store) = self.store.clone() else {
            return Ok(None);
        };
        self.flush().await;
        tokio::task::spawn_blocking(move || store.load_trace(trace_id))
            .await
            .map_err(|e| MeshError::Internal(format!("trace load task failed: {e}")))?
    }

    /// Wait until every span, trace, alert and snapshot recorded so far has
    /// been persisted.
    pub async fn flush(&self) {
        if let Some(writer) = &self.writer {
            writer.flush().await;
        }
    }

    /// End every span that has been running longer than `max_age` as an
    /// error tagged `abandoned=true`, then close traces of the same age.
    ///
    /// Returns the number of spans reaped.
    pub fn reap_abandoned(&self, max_age: Duration) -> usize {
        let max_age = match chrono::Duration::from_std(max_age) {
            Ok(d) => d,
            Err(_) => return 0,
        };
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            return 0;
        };

        let stale: Vec<SpanId> = self
            .active_spans
            .iter()
            .filter(|s| s.start_time < cutoff)
            .map(|s| *s.key())
            .collect();
        for span_id in &stale {
            self.abandon_span(*span_id, "abandoned: span never ended");
        }

        let stale_traces: Vec<TraceId> = self
            .active_traces
            .iter()
            .filter(|t| t.start_time < cutoff)
            .map(|t| *t.key())
            .collect();
        for trace_id in stale_traces {
            self.end_trace(trace_id);
        }

        if !stale.is_empty() {
            info!(reaped = stale.len(), "Reaped abandoned spans");
        }
        stale.len()
    }

    /// Reap using the configured age.
    pub fn reap_expired(&self) -> usize {
        self.reap_abandoned(Duration::from_secs(self.config.abandon_after_secs))
    }

    fn abandon_span(&self, span_id: SpanId, reason: &str) {
        if let Some(mut span) = self.active_spans.get_mut(&span_id) {
            span.tags.insert("abandoned".to_string(), "true".to_string());
        }
        self.end_span(span_id, SpanStatus::Error, Some(reason));
    }

    fn bucket_ms(&self) -> f64 {
        (self.config.histogram_bucket_ms as f64).max(1.0)
    }

    fn evaluate_alerts(&self, span: &Span, duration_ms: f64) -> Vec<PerformanceAlert> {
        let mut alerts = Vec::new();
        let very_slow = self.config.very_slow_operation_ms as f64;
        let slow = self.config.slow_operation_ms as f64;

        let duration_alert = if duration_ms > very_slow {
            Some((
                AlertKind::VerySlowOperation,
                AlertSeverity::Critical,
                format!(
                    "'{}' took {:.0}ms (limit {:.0}ms)",
                    span.operation_name, duration_ms, very_slow
                ),
            ))
        } else if duration_ms > slow {
            Some((
                AlertKind::SlowOperation,
                AlertSeverity::Warning,
                format!(
                    "'{}' took {:.0}ms (limit {:.0}ms)",
                    span.operation_name, duration_ms, slow
                ),
            ))
        } else {
            None
        };
        if let Some((kind, severity, message)) = duration_alert {
            alerts.push(self.alert_for(span, kind, severity, message, duration_ms));
        }

        if span.status == SpanStatus::Error {
            let detail = span
                .tags
                .get("error")
                .map(String::as_str)
                .unwrap_or("unknown error");
            alerts.push(self.alert_for(
                span,
                AlertKind::OperationError,
                AlertSeverity::Error,
                format!("'{}' failed: {}", span.operation_name, detail),
                duration_ms,
            ));
        }
        alerts
    }

    fn alert_for(
        &self,
        span: &Span,
        kind: AlertKind,
        severity: AlertSeverity,
        message: String,
        duration_ms: f64,
    ) -> PerformanceAlert {
        PerformanceAlert {
            id: Uuid::new_v4(),
            kind,
            severity,
            span_id: span.id,
            trace_id: span.trace_id,
            operation_name: span.operation_name.clone(),
            agent_id: span.agent_id.clone(),
            message,
            duration_ms,
            timestamp: Utc::now(),
        }
    }

    fn raise_alert(&self, alert: PerformanceAlert) {
        match alert.severity {
            AlertSeverity::Critical => error!(
                kind = alert.kind.as_str(),
                span_id = %alert.span_id,
                "{}", alert.message
            ),
            _ => warn!(
                kind = alert.kind.as_str(),
                span_id = %alert.span_id,
                "{}", alert.message
            ),
        }
        if let Some(writer) = &self.writer {
            writer.save_alert(alert.clone());
        }
        if let Ok(mut alerts) = self.alerts.lock() {
            if alerts.len() >= self.config.alert_history_size.max(1) {
                alerts.pop_front();
            }
            alerts.push_back(alert);
        }
    }
}

/// Ends the span as an error if the traced future is dropped before finishing.
struct SpanGuard<'a> {
    tracer: &'a Tracer,
    ctx: TraceContext,
    owns_trace: bool,
    armed: bool,
}

impl Drop for SpanGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let reason = if std::thread::panicking() {
            "operation panicked"
        } else {
            "operation cancelled"
        };
        self.tracer
            .end_span(self.ctx.span_id, SpanStatus::Error, Some(reason));
        if self.owns_trace {
            self.tracer.end_trace(self.ctx.trace_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracer() -> Tracer {
        Tracer::in_memory(TracingConfig::default())
    }

    #[test]
    fn test_root_span_has_no_parent_and_children_do() {
        let tracer = tracer();
        let trace_id = tracer.start_trace("checkout", HashMap::new());
        let root = tracer.root_span_id(trace_id).unwrap();
        assert_eq!(tracer.active_span(root).unwrap().parent_span_id, None);

        let child = tracer
            .start_span(trace_id, "charge_card", None, HashMap::new(), None)
            .unwrap();
        assert_eq!(tracer.active_span(child).unwrap().parent_span_id, Some(root));

        tracer.end_span(child, SpanStatus::Success, None);
        let trace = tracer.end_trace(trace_id).unwrap();
        assert_eq!(trace.spans.len(), 2);
        assert_eq!(trace.status, SpanStatus::Success);
        assert!(trace.spans.iter().all(|s| s.trace_id == trace_id));
    }

    #[test]
    fn test_start_span_on_unknown_trace_fails() {
        let tracer = tracer();
        let err = tracer
            .start_span(TraceId::new(), "orphan", None, HashMap::new(), None)
            .unwrap_err();
        assert!(matches!(err, MeshError::TraceNotFound(_)));
    }

    #[test]
    fn test_end_span_twice_is_noop() {
        let tracer = tracer();
        let trace_id = tracer.start_trace("op", HashMap::new());
        let span = tracer
            .start_span(trace_id, "step", None, HashMap::new(), None)
            .unwrap();
        tracer.end_span(span, SpanStatus::Error, Some("boom"));
        tracer.end_span(span, SpanStatus::Success, None);

        let metrics = tracer.get_metrics();
        assert_eq!(metrics.total_spans, 1);
        assert_eq!(metrics.failed_spans, 1);

        let trace = tracer.end_trace(trace_id).unwrap();
        assert_eq!(trace.status, SpanStatus::Error);
        let step = trace.spans.iter().find(|s| s.id == span).unwrap();
        assert_eq!(step.tags.get("error").map(String::as_str), Some("boom"));
    }

    #[tokio::test]
    async fn test_trace_operation_nests_and_propagates_error() {
        let tracer = tracer();
        let result: Result<(), String> = tracer
            .trace_operation("outer", HashMap::new(), None, || async {
                let outer = current_context().unwrap();
                let inner: Result<u32, String> = tracer
                    .trace_operation("inner", HashMap::new(), None, || async {
                        let inner = current_context().unwrap();
                        assert_eq!(inner.trace_id, outer.trace_id);
                        assert_ne!(inner.span_id, outer.span_id);
                        let span = tracer.active_span(inner.span_id).unwrap();
                        assert_eq!(span.parent_span_id, Some(outer.span_id));
                        Ok(7)
                    })
                    .await;
                assert_eq!(inner, Ok(7));
                Err("downstream unavailable".to_string())
            })
            .await;

        assert_eq!(result, Err("downstream unavailable".to_string()));
        assert!(current_context().is_none());
        let metrics = tracer.get_metrics();
        assert_eq!(metrics.total_spans, 2);
        assert_eq!(metrics.failed_spans, 1);
        assert_eq!(metrics.total_traces, 1);
        assert_eq!(metrics.active_spans, 0);
        assert_eq!(metrics.active_traces, 0);

        let alerts = tracer.recent_alerts(10);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::OperationError);
    }

    #[tokio::test]
    async fn test_concurrent_operations_keep_separate_contexts() {
        let tracer = tracer();
        let run = |name: &'static str| {
            let tracer = &tracer;
            async move {
                tracer
                    .trace_operation(name, HashMap::new(), None, || async {
                        let before = current_context().unwrap();
                        tokio::task::yield_now().await;
                        let after = current_context().unwrap();
                        assert_eq!(before, after);
                        Ok::<_, String>(before.trace_id)
                    })
                    .await
            }
        };
        let (a, b) = tokio::join!(run("a"), run("b"));
        assert_ne!(a.unwrap(), b.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_operation_ends_span_as_error() {
        let tracer = tracer();
        let fut = tracer.trace_operation("slow", HashMap::new(), None, || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<(), String>(())
        });
        let timed_out = tokio::time::timeout(Duration::from_millis(10), fut).await;
        assert!(timed_out.is_err());

        let metrics = tracer.get_metrics();
        assert_eq!(metrics.active_spans, 0);
        assert_eq!(metrics.failed_spans, 1);
    }

    #[test]
    fn test_percentiles_use_bucket_lower_edge() {
        let mut stats = SpanStats::default();
        for _ in 0..90 {
            stats.record(50.0, SpanStatus::Success, 100.0);
        }
        for _ in 0..5 {
            stats.record(250.0, SpanStatus::Success, 100.0);
        }
        for _ in 0..5 {
            stats.record(1234.0, SpanStatus::Success, 100.0);
        }

        assert_eq!(stats.percentile(0.5, 100.0), 0.0);
        assert_eq!(stats.percentile(0.95, 100.0), 200.0);
        assert_eq!(stats.percentile(0.99, 100.0), 1200.0);
        assert_eq!(SpanStats::default().percentile(0.95, 100.0), 0.0);
    }

    #[test]
    fn test_slow_span_raises_single_duration_alert() {
        let config = TracingConfig {
            slow_operation_ms: 0.0,
            very_slow_operation_ms: 60_000.0,
            ..TracingConfig::default()
        };
        let tracer = Tracer::in_memory(config);
        let trace_id = tracer.start_trace("op", HashMap::new());
        let span = tracer
            .start_span(trace_id, "step", None, HashMap::new(), None)
            .unwrap();
        std::thread::sleep(Duration::from_millis(2));
        tracer.end_span(span, SpanStatus::Success, None);

        let alerts = tracer.recent_alerts(10);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::SlowOperation);
        assert_eq!(alerts[0].severity, AlertSeverity::Warning);
    }

    #[test]
    fn test_reap_abandoned_spans() {
        let tracer = tracer();
        let trace_id = tracer.start_trace("forgotten", HashMap::new());
        let span = tracer
            .start_span(trace_id, "never_ended", None, HashMap::new(), None)
            .unwrap();

        assert_eq!(tracer.reap_abandoned(Duration::from_secs(3600)), 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(tracer.reap_abandoned(Duration::from_millis(1)), 2);

        let metrics = tracer.get_metrics();
        assert_eq!(metrics.active_spans, 0);
        assert_eq!(metrics.active_traces, 0);
        assert_eq!(metrics.failed_spans, 2);
        assert!(tracer.active_span(span).is_none());
    }

    #[tokio::test]
    async fn test_end_trace_abandons_running_children() {
        let store = agentmesh_memory::MeshStore::open_in_memory().unwrap();
        let tracer = Tracer::new(TracingConfig::default(), store.traces());
        let trace_id = tracer.start_trace("batch", HashMap::new());
        let child = tracer
            .start_span(trace_id, "slow_step", None, HashMap::new(), None)
            .unwrap();

        let trace = tracer.end_trace(trace_id).unwrap();
        assert_eq!(trace.status, SpanStatus::Error);
        assert_eq!(trace.spans.len(), 2);
        let step = trace.spans.iter().find(|s| s.id == child).unwrap();
        assert_eq!(step.status, SpanStatus::Error);
        assert_eq!(step.tags.get("abandoned").map(String::as_str), Some("true"));
        assert!(tracer.active_span(child).is_none());

        // The child finishing late changes nothing.
        tracer.end_span(child, SpanStatus::Success, None);
        let loaded = tracer.load_trace(trace_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, SpanStatus::Error);
        assert_eq!(loaded.spans.len(), 2);
        assert_eq!(
            loaded
                .spans
                .iter()
                .filter(|s| s.status == SpanStatus::Error)
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn test_writes_land_after_flush() {
        let store = agentmesh_memory::MeshStore::open_in_memory().unwrap();
        let tracer = Tracer::new(TracingConfig::default(), store.traces());
        let trace_id = tracer.start_trace("op", HashMap::new());
        let span = tracer
            .start_span(trace_id, "step", None, HashMap::new(), None)
            .unwrap();
        tracer.end_span(span, SpanStatus::Success, None);
        tracer.end_trace(trace_id);
        tracer.snapshot_metrics();

        tracer.flush().await;
        let traces = store.traces();
        assert_eq!(traces.count_spans().unwrap(), 2);
        let snapshot = traces.latest_snapshot().unwrap().unwrap();
        assert_eq!(snapshot.metrics.total_traces, 1);
        let trace = traces.load_trace(trace_id).unwrap().unwrap();
        assert_eq!(trace.status, SpanStatus::Success);
        assert!(trace.end_time.is_some());
    }

    #[test]
    fn test_log_span_requires_active_span() {
        let tracer = tracer();
        let trace_id = tracer.start_trace("op", HashMap::new());
        let root = tracer.root_span_id(trace_id).unwrap();
        tracer
            .log_span(root, LogLevel::Info, "starting", HashMap::new())
            .unwrap();
        assert_eq!(tracer.active_span(root).unwrap().logs.len(), 1);
        tracer.end_trace(trace_id);
        let late = tracer.log_span(root, LogLevel::Info, "late", HashMap::new());
        assert!(matches!(late, Err(MeshError::SpanNotFound(_))));
    }
}
