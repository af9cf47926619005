//! # Endpoints
//!
//! An endpoint is what discovery resolves a name to. It is lifecycle-managed:
//! starting it starts its transport and registers it; terminating it
//! deregisters it and stops the transport. An endpoint whose transport dies
//! terminates itself, so a supervisor can replace it.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;

use fanvisor::Lifecycle;
use fanvisor::Managed;
use fanvisor::ManagedExt;
use fanvisor::Reason;
use fanvisor::State;
use serde_json::Value;
use tracing::debug;
use tracing::warn;

use crate::CallArgs;
use crate::Context;
use crate::Error;
use crate::Result;
use crate::RuntimeHandle;
use crate::Service;
use crate::ServiceName;
use crate::discovery::RegistryEntry;
use crate::transport::Termination;
use crate::transport::Transport;

pub enum EndpointKind {
    /// Dispatches straight to an in-process service.
    Local { service: Arc<Service> },
    /// Serves an in-process service to other processes over a transport.
    Remote {
        service: Arc<Service>,
        transport: Arc<dyn Transport>,
    },
    /// Calls a service in another process through a transport. `version` is
    /// the registered version it was resolved to.
    Proxy {
        transport: Arc<dyn Transport>,
        version: String,
    },
}

pub struct Endpoint {
    name: ServiceName,
    kind: EndpointKind,
    lifecycle: Lifecycle,
    runtime: RuntimeHandle,
    registration: Mutex<Option<RegistryEntry>>,
    me: Weak<Endpoint>,
}

impl Endpoint {
    pub(crate) fn new(runtime: RuntimeHandle, name: ServiceName, kind: EndpointKind) -> Arc<Self> {
        let label = format!("{}:{}", kind_name(&kind), name);
        Arc::new_cyclic(|me| Self {
            name,
            kind,
            lifecycle: Lifecycle::new(label),
            runtime,
            registration: Mutex::new(None),
            me: me.clone(),
        })
    }

    pub fn name(&self) -> &ServiceName {
        &self.name
    }

    pub fn kind(&self) -> &EndpointKind {
        &self.kind
    }

    pub fn kind_name(&self) -> &'static str {
        kind_name(&self.kind)
    }

    pub fn state(&self) -> State {
        self.lifecycle.state()
    }

    pub fn service(&self) -> Option<&Arc<Service>> {
        match &self.kind {
            EndpointKind::Local { service } | EndpointKind::Remote { service, .. } => Some(service),
            EndpointKind::Proxy { .. } => None,
        }
    }

    /// Version of the service behind this endpoint.
    pub fn version(&self) -> &str {
        match &self.kind {
            EndpointKind::Local { service } | EndpointKind::Remote { service, .. } => service.version(),
            EndpointKind::Proxy { version, .. } => version,
        }
    }

    pub fn transport(&self) -> Option<&Arc<dyn Transport>> {
        match &self.kind {
            EndpointKind::Remote { transport, .. } | EndpointKind::Proxy { transport, .. } => Some(transport),
            EndpointKind::Local { .. } => None,
        }
    }

    /// The remote registry entry published when this endpoint started.
    pub fn registration(&self) -> Option<RegistryEntry> {
        self.registration_slot().clone()
    }

    /// Performs `method` in the frame `ctx`.
    pub async fn perform_call(&self, ctx: Context, method: &str, args: CallArgs) -> Result<Value> {
        match &self.kind {
            EndpointKind::Local { service } | EndpointKind::Remote { service, .. } => {
                service.dispatch(ctx, method, args).await
            }
            EndpointKind::Proxy { transport, .. } => Ok(transport.rpc_call(method, &ctx, args).await?),
        }
    }

    fn registration_slot(&self) -> MutexGuard<'_, Option<RegistryEntry>> {
        self.registration.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn spawn_termination_watch(&self, termination: Termination) {
        let me = self.me.clone();
        tokio::spawn(async move {
            let cause = termination.wait().await;
            if let Some(endpoint) = me.upgrade() {
                endpoint.terminate(Reason::failed(format!("transport terminated: {}", cause))).await;
            }
        });
    }
}

fn kind_name(kind: &EndpointKind) -> &'static str {
    match kind {
        EndpointKind::Local { .. } => "local",
        EndpointKind::Remote { .. } => "remote",
        EndpointKind::Proxy { .. } => "proxy",
    }
}

#[async_trait::async_trait]
impl Managed for Endpoint {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    async fn on_start(&self) -> anyhow::Result<()> {
        if let Some(transport) = self.transport() {
            transport.start().await?;
            self.spawn_termination_watch(transport.termination());
        }

        if matches!(self.kind, EndpointKind::Proxy { .. }) {
            return Ok(());
        }
        let runtime = self.runtime.upgrade().ok_or(Error::RuntimeGone)?;
        let me = self.me.upgrade().ok_or(Error::RuntimeGone)?;
        let entry = runtime.discovery().register(&me).await?;
        if let Some(entry) = &entry {
            debug!(endpoint = %self.name, path = %entry.path, "published");
        }
        *self.registration_slot() = entry;
        Ok(())
    }

    async fn on_terminate(&self, reason: &Reason) -> anyhow::Result<()> {
        debug!(endpoint = %self.name, kind = self.kind_name(), %reason, "stopping endpoint");
        let entry = self.registration_slot().take();
        if let Some(runtime) = self.runtime.upgrade() {
            if let Err(e) = runtime.discovery().deregister(self, entry.as_ref()).await {
                warn!(endpoint = %self.name, error = %e, "failed to deregister");
            }
        }
        if let Some(transport) = self.transport() {
            transport.stop().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("kind", &self.kind_name())
            .field("state", &self.state())
            .finish()
    }
}
