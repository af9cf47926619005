//! # Transport Abstraction
//!
//! A transport carries one endpoint's calls over some wire. Every transport
//! embeds a `TransportCore` holding what all bindings share: the owning
//! endpoint's name, its connection parameters, its role, the service to
//! dispatch inbound calls to, and the termination signal.
//!
//! ## Philosophy
//!
//! - **One per endpoint**: a transport is never shared between endpoints.
//! - **Termination is observable**: a transport that dies fires its
//!   `Termination`, and the endpoint that owns it terminates in turn.
//! - **Bindings are named**: the `transport` connection parameter selects the
//!   `Binding` that builds the transport.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::CallArgs;
use crate::Context;
use crate::RuntimeConfig;
use crate::RuntimeHandle;
use crate::Service;
use crate::ServiceName;
use crate::span::SpanContext;

pub mod channel;
pub mod envelope;
pub mod http;
pub mod memory;
pub mod params;
pub mod pending;

pub use channel::Broker;
pub use channel::ChannelBinding;
pub use channel::ChannelTransport;
pub use channel::Publisher;
pub use channel::Subscription;
pub use http::HttpBinding;
pub use http::HttpClient;
pub use http::HttpTransport;
pub use memory::MemoryBroker;
pub use params::ConnectionParams;

/// Errors that occur at the transport layer.
///
/// `Clone` so that one failure can be delivered to every waiting caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// The remote answered with a status other than 200, 201 or 204.
    Status { status: u16, body: String },
    /// The underlying channel or connection went away.
    Disconnected(String),
    /// An inbound message could not be decoded.
    Decode(String),
    /// An outbound message could not be encoded.
    Encode(String),
    /// The transport was stopped or never started.
    Closed,
    /// The remote handler failed.
    Remote(String),
    /// Fewer subscribers received a publish than required.
    Unacknowledged { delivered: usize, required: usize },
    /// The connection parameters define no such method.
    UnknownMethod(String),
    /// The connection parameters are missing or malformed.
    Params(String),
    /// The wire client failed.
    Client(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Status { status, body } => write!(f, "Unexpected status {}: {}", status, body),
            Self::Disconnected(msg) => write!(f, "Disconnected: {}", msg),
            Self::Decode(msg) => write!(f, "Decode error: {}", msg),
            Self::Encode(msg) => write!(f, "Encode error: {}", msg),
            Self::Closed => write!(f, "Transport closed"),
            Self::Remote(msg) => write!(f, "Remote failure: {}", msg),
            Self::Unacknowledged { delivered, required } => {
                write!(f, "Publish reached {} subscribers, {} required", delivered, required)
            }
            Self::UnknownMethod(name) => write!(f, "Unknown method '{}'", name),
            Self::Params(msg) => write!(f, "Invalid connection parameters: {}", msg),
            Self::Client(msg) => write!(f, "Client error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Which side of a connection a transport serves.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Role {
    /// Issues outbound calls.
    Proxy,
    /// Listens for inbound calls to a local service.
    Remote,
}

/// Resolves once a transport has died, with the cause if one was recorded.
#[derive(Clone)]
pub struct Termination {
    rx: watch::Receiver<Option<Error>>,
}

impl Termination {
    pub fn is_terminated(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// Waits for termination. Also resolves, with `Closed`, if the transport
    /// is dropped.
    pub async fn wait(mut self) -> Error {
        match self.rx.wait_for(Option::is_some).await {
            Ok(cause) => cause.clone().unwrap_or(Error::Closed),
            Err(_) => Error::Closed,
        }
    }
}

/// State shared by every transport binding.
pub struct TransportCore {
    runtime: RuntimeHandle,
    owner: ServiceName,
    params: ConnectionParams,
    role: Role,
    service: Option<Arc<Service>>,
    started: AtomicBool,
    terminated: watch::Sender<Option<Error>>,
}

impl TransportCore {
    pub fn new(
        runtime: RuntimeHandle,
        owner: ServiceName,
        params: ConnectionParams,
        role: Role,
        service: Option<Arc<Service>>,
    ) -> Self {
        let (terminated, _) = watch::channel(None);
        Self {
            runtime,
            owner,
            params,
            role,
            service,
            started: AtomicBool::new(false),
            terminated,
        }
    }

    pub fn owner(&self) -> &ServiceName {
        &self.owner
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn termination(&self) -> Termination {
        Termination { rx: self.terminated.subscribe() }
    }

    /// The recorded cause of death, if the transport has died.
    pub fn failure(&self) -> Option<Error> {
        self.terminated.borrow().clone()
    }

    /// Records the cause of death. Only the first cause is kept.
    pub fn terminate(&self, cause: Error) {
        self.terminated.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            debug!(owner = %self.owner, %cause, "transport terminated");
            *current = Some(cause);
            true
        });
    }

    /// Dispatches an inbound call to the local service in a new frame whose
    /// parent is the caller's span.
    pub async fn handle_call(
        &self,
        method: &str,
        parent: Option<&SpanContext>,
        args: CallArgs,
    ) -> crate::Result<Value> {
        let Some(service) = self.service.clone() else {
            return Err(crate::Error::NoSuchEndpoint(self.owner.to_string()));
        };
        let runtime = self.runtime.upgrade().ok_or(crate::Error::RuntimeGone)?;
        let operation = format!("{}.{}", self.owner, method);
        let ctx = Context::new(runtime, Some(service.clone()), parent, operation);
        ctx.scope(|ctx| async move { service.dispatch(ctx, method, args).await }).await
    }

    fn mark_started(&self) -> bool {
        !self.started.swap(true, Ordering::AcqRel)
    }

    fn mark_stopped(&self) -> bool {
        self.started.swap(false, Ordering::AcqRel)
    }
}

/// A wire binding for one endpoint.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    fn core(&self) -> &TransportCore;

    /// Sends `method` with `args` on behalf of `ctx` and waits for the result.
    async fn rpc_call(&self, method: &str, ctx: &Context, args: CallArgs) -> Result<Value>;

    /// Acquires connections and starts any background readers.
    async fn on_start(&self) -> Result<()>;

    /// Releases connections. Pending calls fail.
    async fn on_stop(&self) -> Result<()>;

    fn is_started(&self) -> bool {
        self.core().is_started()
    }

    fn termination(&self) -> Termination {
        self.core().termination()
    }

    fn params(&self) -> &ConnectionParams {
        self.core().params()
    }

    /// Starts the transport once; later calls are no-ops.
    async fn start(&self) -> Result<()> {
        if !self.core().mark_started() {
            return Ok(());
        }
        if let Err(e) = self.on_start().await {
            self.core().mark_stopped();
            return Err(e);
        }
        Ok(())
    }

    /// Stops a started transport and fires its termination signal.
    async fn stop(&self) -> Result<()> {
        if !self.core().mark_stopped() {
            return Ok(());
        }
        let result = self.on_stop().await;
        self.core().terminate(Error::Closed);
        result
    }
}

/// Builds transports for one binding name.
pub trait Binding: Send + Sync + 'static {
    fn build(&self, core: TransportCore, config: &RuntimeConfig) -> Result<Arc<dyn Transport>>;
}
