//! # fanrpc
//!
//! Location-transparent RPC between services, with tracing context threaded
//! through every call and supervised transports underneath.
//!
//! ## Architecture
//!
//! - **Runtime**: the process-wide object built once at bootstrap. It owns the
//!   tracer, the composite discovery and the transport bindings, and is passed
//!   down explicitly.
//! - **Context**: a tracing-scoped call frame. `ctx.rpc().at("svc").call(..)`
//!   resolves an endpoint, opens a child frame and performs the call.
//! - **Endpoint**: Local (in-process dispatch), Remote (serves a service over a
//!   transport) or Proxy (calls a remote service through a transport).
//! - **Transport**: request/response (HTTP style) and channel (pub/sub) bindings.
//!   The channel binding correlates replies to requests itself.
//! - **Discovery**: local registry, remote registry (store-backed or static),
//!   and the composite that caches proxies for remote hits.
//!
//! Endpoints are `fanvisor::Managed`, so listeners can run under a supervisor.

pub mod args;
pub mod blocking;
pub mod config;
pub mod context;
pub mod discovery;
pub mod endpoint;
pub mod error;
pub mod name;
pub mod propagation;
pub mod rpc;
pub mod runtime;
pub mod service;
pub mod span;
pub mod telemetry;
pub mod transport;

pub use args::CallArgs;
pub use config::RegistryConfig;
pub use config::RuntimeConfig;
pub use context::Context;
pub use discovery::VersionFilter;
pub use discovery::VersionOrder;
pub use endpoint::Endpoint;
pub use endpoint::EndpointKind;
pub use error::Error;
pub use error::Result;
pub use name::ServiceName;
pub use rpc::Rpc;
pub use runtime::Runtime;
pub use runtime::RuntimeBuilder;
pub use runtime::RuntimeHandle;
pub use service::Service;
pub use service::ServiceBuilder;
pub use span::SpanContext;
pub use span::Tracer;
pub use transport::ConnectionParams;

pub use serde_json::Value;

#[cfg(test)]
mod tests;
