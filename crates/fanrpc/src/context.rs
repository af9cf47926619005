//! # Call Context
//!
//! A `Context` is one frame of a distributed call tree. It carries the runtime
//! (for discovery and tracing), the service it runs on behalf of, and its own
//! span. Every outbound call opens exactly one child frame.
//!
//! ## Invariants
//!
//! - Outbound calls require an entered frame (`enter` or `scope`).
//! - A frame's span is finished at most once, by `exit`, by the end of `scope`,
//!   or when the last handle of an entered frame is dropped.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use serde_json::Value;
use tracing::debug;

use crate::CallArgs;
use crate::Result;
use crate::Rpc;
use crate::Runtime;
use crate::Service;
use crate::ServiceName;
use crate::span::Span;
use crate::span::SpanContext;

struct ContextInner {
    runtime: Runtime,
    service: Option<Arc<Service>>,
    span: Mutex<Span>,
    entered: AtomicBool,
    finished: AtomicBool,
}

/// A tracing-scoped call frame. Clones share the same frame.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub(crate) fn new(
        runtime: Runtime,
        service: Option<Arc<Service>>,
        parent: Option<&SpanContext>,
        operation: impl Into<String>,
    ) -> Self {
        let span = runtime.tracer().start_span(operation, parent);
        Self {
            inner: Arc::new(ContextInner {
                runtime,
                service,
                span: Mutex::new(span),
                entered: AtomicBool::new(false),
                finished: AtomicBool::new(false),
            }),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// The service this frame runs on behalf of, if any.
    pub fn service(&self) -> Option<&Arc<Service>> {
        self.inner.service.as_ref()
    }

    /// A snapshot of this frame's span identity.
    pub fn span_context(&self) -> SpanContext {
        self.span().context().clone()
    }

    pub fn operation(&self) -> String {
        self.span().operation().to_string()
    }

    pub fn trace_id(&self) -> u64 {
        self.span().context().trace_id
    }

    pub fn set_tag(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.span().set_tag(key, value);
    }

    pub fn tag(&self, key: &str) -> Option<Value> {
        self.span().tag(key).cloned()
    }

    /// Sets baggage that travels with every descendant frame.
    pub fn set_baggage(&self, key: impl Into<String>, value: impl Into<String>) {
        self.span().set_baggage(key, value);
    }

    pub fn baggage(&self, key: &str) -> Option<String> {
        self.span().context().baggage.get(key).cloned()
    }

    pub fn is_entered(&self) -> bool {
        self.inner.entered.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::Acquire)
    }

    /// Marks the frame usable for outbound calls.
    pub fn enter(&self) {
        self.inner.entered.store(true, Ordering::Release);
    }

    /// Finishes the span. Returns false if it was already finished.
    pub fn exit(&self) -> bool {
        self.finish(None)
    }

    /// Finishes the span, tagging it with the failure.
    pub fn exit_with_error(&self, error: &dyn std::fmt::Display) -> bool {
        self.finish(Some(error.to_string()))
    }

    /// Runs `f` inside this frame: enters it, then exits it with the outcome.
    pub async fn scope<F, Fut, T, E>(&self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: std::fmt::Display,
    {
        self.enter();
        let result = f(self.clone()).await;
        match &result {
            Ok(_) => self.exit(),
            Err(e) => self.exit_with_error(e),
        };
        result
    }

    /// Opens a child frame whose span's parent is this frame's span.
    pub fn create_child_context(&self, operation: impl Into<String>) -> Context {
        let parent = self.span_context();
        Context::new(self.inner.runtime.clone(), self.inner.service.clone(), Some(&parent), operation)
    }

    /// Starts an RPC path: `ctx.rpc().at("billing").call("charge", args)`.
    pub fn rpc(&self) -> Rpc {
        Rpc::new(self.clone())
    }

    /// Calls a dotted path such as `billing.invoices.create`.
    pub async fn call(&self, path: &str, args: CallArgs) -> Result<Value> {
        let (service, method) = ServiceName::split_method(path)?;
        self.rpc().at_name(&service).call(&method, args).await
    }

    fn finish(&self, error: Option<String>) -> bool {
        finish(&self.inner, error)
    }

    fn span(&self) -> MutexGuard<'_, Span> {
        self.inner.span.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn finish(inner: &ContextInner, error: Option<String>) -> bool {
    if inner.finished.swap(true, Ordering::AcqRel) {
        return false;
    }
    let mut span = inner.span.lock().unwrap_or_else(|p| p.into_inner());
    if let Some(message) = error {
        span.set_tag("error", true);
        span.set_tag("error.message", message);
    }
    debug!(operation = %span.operation(), span_id = %span.context().span_id_hex(), "span finished");
    inner.runtime.tracer().finish(&span);
    true
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        if self.entered.load(Ordering::Acquire) {
            finish(self, None);
        }
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let span = self.span();
        f.debug_struct("Context")
            .field("operation", &span.operation())
            .field("span", span.context())
            .field("entered", &self.is_entered())
            .finish()
    }
}
