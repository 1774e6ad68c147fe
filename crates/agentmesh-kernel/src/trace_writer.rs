//! Background persistence for the tracer.
//!
//! Completed spans, trace rows, alerts and metric snapshots are queued on an
//! unbounded channel and written by one drain task. Each batch runs on the
//! blocking pool, so traced async code never waits on the SQLite mutex.
//! Writes are applied in the order they were queued.

use agentmesh_memory::trace_store::TraceStore;
use agentmesh_types::error::MeshResult;
use agentmesh_types::trace::{MetricsSnapshot, PerformanceAlert, Span, Trace};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

enum TraceWrite {
    Trace(Trace),
    Span(Span),
    Alert(PerformanceAlert),
    Snapshot(MetricsSnapshot),
    /// Acknowledged once every earlier write has been applied.
    Flush(oneshot::Sender<()>),
}

impl TraceWrite {
    fn apply(self, store: &TraceStore) {
        let (kind, result): (&str, MeshResult<()>) = match self {
            TraceWrite::Trace(trace) => ("trace", store.save_trace(&trace)),
            TraceWrite::Span(span) => ("span", store.save_span(&span)),
            TraceWrite::Alert(alert) => ("alert", store.save_alert(&alert)),
            TraceWrite::Snapshot(snapshot) => ("metrics snapshot", store.save_snapshot(&snapshot)),
            TraceWrite::Flush(ack) => {
                let _ = ack.send(());
                return;
            }
        };
        if let Err(e) = result {
            warn!(kind, error = %e, "Failed to persist trace record");
        }
    }
}

enum Sink {
    Queue(mpsc::UnboundedSender<TraceWrite>),
    /// No tokio runtime at construction: write on the caller's thread.
    Direct(TraceStore),
}

/// Ordered, fire-and-forget writer in front of a [`TraceStore`].
pub(crate) struct TraceWriter {
    sink: Sink,
}

impl TraceWriter {
    /// Start the drain task on the current runtime.
    pub(crate) fn spawn(store: TraceStore) -> Self {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No tokio runtime; trace records are written inline");
            return Self {
                sink: Sink::Direct(store),
            };
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<TraceWrite>();
        handle.spawn(async move {
            while let Some(first) = rx.recv().await {
                let mut batch = vec![first];
                while let Ok(next) = rx.try_recv() {
                    batch.push(next);
                }
                let store = store.clone();
                let written = tokio::task::spawn_blocking(move || {
                    for write in batch {
                        write.apply(&store);
                    }
                })
                .await;
                if let Err(e) = written {
                    warn!(error = %e, "Trace writer batch aborted");
                }
            }
            debug!("Trace writer stopped");
        });
        Self {
            sink: Sink::Queue(tx),
        }
    }

    pub(crate) fn save_trace(&self, trace: Trace) {
        self.submit(TraceWrite::Trace(trace));
    }

    pub(crate) fn save_span(&self, span: Span) {
        self.submit(TraceWrite::Span(span));
    }

    pub(crate) fn save_alert(&self, alert: PerformanceAlert) {
        self.submit(TraceWrite::Alert(alert));
    }

    pub(crate) fn save_snapshot(&self, snapshot: MetricsSnapshot) {
        self.submit(TraceWrite::Snapshot(snapshot));
    }

    /// Wait until every record queued so far has been written.
    pub(crate) async fn flush(&self) {
        if let Sink::Queue(tx) = &self.sink {
            let (ack, done) = oneshot::channel();
            if tx.send(TraceWrite::Flush(ack)).is_ok() {
                let _ = done.await;
            }
        }
    }

    fn submit(&self, write: TraceWrite) {
        match &self.sink {
            Sink::Queue(tx) => {
                if tx.send(write).is_err() {
                    warn!("Trace writer stopped; dropping record");
                }
            }
            Sink::Direct(store) => write.apply(store),
        }
    }
}
