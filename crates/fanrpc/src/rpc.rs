//! # RPC Call Builder
//!
//! `Rpc` accumulates path segments without touching the network. Only `call`
//! resolves the endpoint and performs the call inside a fresh child frame.

use serde_json::Value;
use tracing::debug;

use crate::CallArgs;
use crate::Context;
use crate::Error;
use crate::Result;
use crate::ServiceName;
use crate::VersionFilter;

pub struct Rpc {
    ctx: Context,
    segments: Vec<String>,
    filter: VersionFilter,
}

impl Rpc {
    pub(crate) fn new(ctx: Context) -> Self {
        Self {
            ctx,
            segments: Vec::new(),
            filter: VersionFilter::Any,
        }
    }

    /// Appends a path segment. Dotted input appends each part.
    pub fn at(mut self, segment: &str) -> Self {
        self.segments.extend(segment.split('.').map(str::to_string));
        self
    }

    pub(crate) fn at_name(mut self, name: &ServiceName) -> Self {
        self.segments.extend(name.segments().iter().cloned());
        self
    }

    /// Restricts which registered versions may serve the call.
    pub fn version(mut self, filter: VersionFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn path(&self) -> String {
        self.segments.join(".")
    }

    /// Resolves the accumulated path and calls `method` on it.
    pub async fn call(self, method: &str, args: CallArgs) -> Result<Value> {
        if !self.ctx.is_entered() {
            return Err(Error::ContextNotEntered);
        }
        let name = ServiceName::from_segments(self.segments)?;
        let runtime = self.ctx.runtime();
        let endpoint = runtime
            .find_endpoint(&name, &self.filter)
            .await?
            .ok_or_else(|| Error::NoSuchEndpoint(name.to_string()))?;

        let child = self.ctx.create_child_context(format!("{}.{}", name, method));
        debug!(service = %name, method, span_id = %child.span_context().span_id_hex(), "calling");
        child
            .scope(|ctx| async move { endpoint.perform_call(ctx, method, args).await })
            .await
    }
}
