//! # Tracing Spans
//!
//! Minimal span model: every call frame owns one span, identified by a random
//! 64-bit span id and sharing the 64-bit trace id of the request that entered
//! the process. Finished spans are handed to a `SpanRecorder`.
//!
//! ## Invariants
//!
//! - A `SpanContext` is a value; it never changes after it is created.
//! - Child spans inherit trace id, sampling decision and baggage, and point at
//!   their parent's span id.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;
use std::time::SystemTime;

use serde_json::Value;
use tracing::info;

/// The propagated identity of a span.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: u64,
    pub span_id: u64,
    pub parent_span_id: Option<u64>,
    pub sampled: bool,
    pub baggage: BTreeMap<String, String>,
}

impl SpanContext {
    /// Span id as lowercase hex, the form used on the wire.
    pub fn span_id_hex(&self) -> String {
        format!("{:x}", self.span_id)
    }

    pub fn trace_id_hex(&self) -> String {
        format!("{:x}", self.trace_id)
    }
}

/// A span that is still open.
#[derive(Debug)]
pub struct Span {
    context: SpanContext,
    operation: String,
    service: String,
    start: SystemTime,
    started_at: Instant,
    tags: BTreeMap<String, Value>,
}

impl Span {
    pub fn context(&self) -> &SpanContext {
        &self.context
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn set_tag(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.tags.insert(key.into(), value.into());
    }

    pub fn tag(&self, key: &str) -> Option<&Value> {
        self.tags.get(key)
    }

    pub fn set_baggage(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.context.baggage.insert(key.into(), value.into());
    }

    fn finish(&self) -> FinishedSpan {
        FinishedSpan {
            trace_id: self.context.trace_id,
            span_id: self.context.span_id,
            parent_span_id: self.context.parent_span_id,
            operation: self.operation.clone(),
            service: self.service.clone(),
            start: self.start,
            duration: self.started_at.elapsed(),
            tags: self.tags.clone(),
            baggage: self.context.baggage.clone(),
        }
    }
}

/// The exported record of a finished span.
#[derive(Clone, Debug, PartialEq)]
pub struct FinishedSpan {
    pub trace_id: u64,
    pub span_id: u64,
    pub parent_span_id: Option<u64>,
    pub operation: String,
    pub service: String,
    pub start: SystemTime,
    pub duration: Duration,
    pub tags: BTreeMap<String, Value>,
    pub baggage: BTreeMap<String, String>,
}

/// Sink for finished spans.
///
/// Called synchronously when a frame closes, possibly from `Drop`, so
/// implementations must not block.
pub trait SpanRecorder: Send + Sync + 'static {
    fn record(&self, span: FinishedSpan);
}

/// Keeps every finished span in memory.
#[derive(Debug, Default)]
pub struct InMemoryRecorder {
    spans: Mutex<Vec<FinishedSpan>>,
}

impl InMemoryRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn spans(&self) -> Vec<FinishedSpan> {
        self.spans.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Finished spans for `operation`, in finish order.
    pub fn by_operation(&self, operation: &str) -> Vec<FinishedSpan> {
        self.spans().into_iter().filter(|s| s.operation == operation).collect()
    }

    pub fn clear(&self) {
        self.spans.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

impl SpanRecorder for InMemoryRecorder {
    fn record(&self, span: FinishedSpan) {
        self.spans.lock().unwrap_or_else(|p| p.into_inner()).push(span);
    }
}

/// Emits one structured log event per finished span.
#[derive(Debug, Default)]
pub struct LogRecorder;

impl SpanRecorder for LogRecorder {
    fn record(&self, span: FinishedSpan) {
        let error = span.tags.get("error").and_then(Value::as_bool).unwrap_or(false);
        info!(
            target: "fanrpc::span",
            trace_id = %format!("{:x}", span.trace_id),
            span_id = %format!("{:x}", span.span_id),
            parent_span_id = ?span.parent_span_id.map(|id| format!("{:x}", id)),
            operation = %span.operation,
            service = %span.service,
            duration_us = span.duration.as_micros() as u64,
            error,
            "span finished"
        );
    }
}

/// Drops every span.
#[derive(Debug, Default)]
pub struct NoopRecorder;

impl SpanRecorder for NoopRecorder {
    fn record(&self, _span: FinishedSpan) {}
}

/// Creates spans for one service and exports them when they finish.
#[derive(Clone)]
pub struct Tracer {
    service_name: String,
    recorder: Arc<dyn SpanRecorder>,
}

impl Tracer {
    pub fn new(service_name: impl Into<String>, recorder: Arc<dyn SpanRecorder>) -> Self {
        Self {
            service_name: service_name.into(),
            recorder,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Opens a span. Without a parent a new trace is started.
    pub fn start_span(&self, operation: impl Into<String>, parent: Option<&SpanContext>) -> Span {
        let context = match parent {
            Some(parent) => SpanContext {
                trace_id: parent.trace_id,
                span_id: random_id(),
                parent_span_id: Some(parent.span_id),
                sampled: parent.sampled,
                baggage: parent.baggage.clone(),
            },
            None => SpanContext {
                trace_id: random_id(),
                span_id: random_id(),
                parent_span_id: None,
                sampled: true,
                baggage: BTreeMap::new(),
            },
        };
        Span {
            context,
            operation: operation.into(),
            service: self.service_name.clone(),
            start: SystemTime::now(),
            started_at: Instant::now(),
            tags: BTreeMap::new(),
        }
    }

    /// Exports `span` if it is sampled.
    pub fn finish(&self, span: &Span) {
        if span.context.sampled {
            self.recorder.record(span.finish());
        }
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tracer").field("service_name", &self.service_name).finish()
    }
}

/// A random non-zero id.
pub(crate) fn random_id() -> u64 {
    loop {
        let id: u64 = rand::random();
        if id != 0 {
            return id;
        }
    }
}
