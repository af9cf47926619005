//! # Runtime
//!
//! The process-wide object built once at bootstrap by `RuntimeBuilder` and
//! passed down explicitly. It owns the tracer, the composite discovery and the
//! registry of transport bindings, and builds endpoints from them.
//!
//! Endpoints and transports hold a `RuntimeHandle` (weak), never a `Runtime`,
//! so dropping the last `Runtime` tears the object graph down.

use std::sync::Arc;
use std::sync::Weak;

use async_trait::async_trait;
use dashmap::DashMap;
use fanvisor::Managed;
use fanvisor::ManagedExt;
use fanvisor::Reason;
use fanvisor::Spec;
use serde_json::Value;
use tracing::debug;
use tracing::info;

use crate::CallArgs;
use crate::Context;
use crate::Endpoint;
use crate::EndpointKind;
use crate::Error;
use crate::Result;
use crate::RuntimeConfig;
use crate::Service;
use crate::ServiceName;
use crate::VersionFilter;
use crate::discovery::CompositeDiscovery;
use crate::discovery::ProxyFactory;
use crate::discovery::RegistryEntry;
use crate::discovery::RemoteDiscovery;
use crate::discovery::StaticDiscovery;
use crate::propagation::HeaderMapper;
use crate::propagation::Headers;
use crate::span::LogRecorder;
use crate::span::SpanRecorder;
use crate::span::Tracer;
use crate::transport::Binding;
use crate::transport::ConnectionParams;
use crate::transport::Role;
use crate::transport::Transport;
use crate::transport::TransportCore;

struct RuntimeInner {
    config: RuntimeConfig,
    tracer: Tracer,
    discovery: CompositeDiscovery,
    bindings: DashMap<String, Arc<dyn Binding>>,
}

/// Shared handle to the process-wide runtime. Clones are cheap.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

/// A non-owning reference to a `Runtime`.
#[derive(Clone)]
pub struct RuntimeHandle {
    inner: Weak<RuntimeInner>,
}

impl RuntimeHandle {
    pub fn upgrade(&self) -> Option<Runtime> {
        self.inner.upgrade().map(|inner| Runtime { inner })
    }
}

impl Runtime {
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn tracer(&self) -> &Tracer {
        &self.inner.tracer
    }

    pub fn discovery(&self) -> &CompositeDiscovery {
        &self.inner.discovery
    }

    pub fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Names of the registered transport bindings.
    pub fn bindings(&self) -> Vec<String> {
        self.inner.bindings.iter().map(|b| b.key().clone()).collect()
    }

    /// Connects the remote registry.
    pub async fn start(&self) -> Result<()> {
        self.inner.discovery.start().await?;
        info!(service = %self.inner.config.service_name, "runtime started");
        Ok(())
    }

    /// Terminates every locally known endpoint, then disconnects the remote
    /// registry.
    pub async fn shutdown(&self) -> Result<()> {
        let local = self.inner.discovery.local();
        let endpoints: Vec<Arc<Endpoint>> = local
            .names()
            .iter()
            .filter_map(|name| local.find_endpoint(name))
            .collect();
        for endpoint in &endpoints {
            endpoint.terminate(Reason::Shutdown).await;
        }
        self.inner.discovery.stop().await?;
        info!(service = %self.inner.config.service_name, endpoints = endpoints.len(), "runtime shut down");
        Ok(())
    }

    pub async fn find_endpoint(&self, name: &ServiceName, filter: &VersionFilter) -> Result<Option<Arc<Endpoint>>> {
        self.inner.discovery.find_endpoint(self, name, filter).await
    }

    /// A fresh root frame, not yet entered.
    pub fn root_context(&self, operation: impl Into<String>) -> Context {
        Context::new(self.clone(), None, None, operation)
    }

    /// A frame for a request entering the process, continuing the caller's
    /// trace when `headers` carry one.
    pub fn context_from_headers(
        &self,
        operation: impl Into<String>,
        headers: &Headers,
        mapper: &dyn HeaderMapper,
    ) -> Context {
        let parent = mapper.extract(headers);
        if parent.is_none() {
            debug!("no tracing headers, starting a new trace");
        }
        Context::new(self.clone(), None, parent.as_ref(), operation)
    }

    /// Builds the transport named by `params` for `owner`.
    pub fn build_transport(
        &self,
        owner: &ServiceName,
        params: &ConnectionParams,
        role: Role,
        service: Option<Arc<Service>>,
    ) -> Result<Arc<dyn Transport>> {
        let name = params.binding()?;
        let binding = self
            .inner
            .bindings
            .get(name)
            .map(|b| b.value().clone())
            .ok_or_else(|| Error::UnknownBinding(name.to_string()))?;
        let core = TransportCore::new(self.handle(), owner.clone(), params.clone(), role, service);
        Ok(binding.build(core, &self.inner.config)?)
    }

    /// An unstarted endpoint dispatching straight to `service`.
    pub fn local_endpoint(&self, service: Arc<Service>) -> Arc<Endpoint> {
        let name = service.name().clone();
        Endpoint::new(self.handle(), name, EndpointKind::Local { service })
    }

    /// An unstarted endpoint serving `service` over the transport `params` name.
    pub fn remote_endpoint(&self, service: Arc<Service>, params: ConnectionParams) -> Result<Arc<Endpoint>> {
        let name = service.name().clone();
        let transport = self.build_transport(&name, &params, Role::Remote, Some(service.clone()))?;
        Ok(Endpoint::new(self.handle(), name, EndpointKind::Remote { service, transport }))
    }

    /// An unstarted endpoint calling version `version` of `name` through the
    /// transport `params` name.
    pub fn proxy_endpoint(&self, name: &ServiceName, version: &str, params: &ConnectionParams) -> Result<Arc<Endpoint>> {
        let transport = self.build_transport(name, params, Role::Proxy, None)?;
        let kind = EndpointKind::Proxy {
            transport,
            version: version.to_string(),
        };
        Ok(Endpoint::new(self.handle(), name.clone(), kind))
    }

    /// Starts a local endpoint for `service`, which registers it.
    pub async fn register_local(&self, service: Arc<Service>) -> Result<Arc<Endpoint>> {
        let endpoint = self.local_endpoint(service);
        endpoint.start().await?;
        Ok(endpoint)
    }

    /// Starts a remote endpoint for `service`, which publishes it.
    pub async fn serve(&self, service: Arc<Service>, params: ConnectionParams) -> Result<Arc<Endpoint>> {
        let endpoint = self.remote_endpoint(service, params)?;
        endpoint.start().await?;
        Ok(endpoint)
    }

    /// A supervisor spec whose instances serve `service` over `params`.
    pub fn serve_spec(&self, service: Arc<Service>, params: ConnectionParams) -> Spec {
        let handle = self.handle();
        Spec::new(format!("serve:{}", service.name()), move || {
            let runtime = handle.upgrade().ok_or(Error::RuntimeGone)?;
            let endpoint: Arc<dyn Managed> = runtime.remote_endpoint(service.clone(), params.clone())?;
            Ok(endpoint)
        })
    }

    /// Calls a dotted path from a fresh root frame named `call:<path>`.
    pub async fn call(&self, path: &str, args: CallArgs) -> Result<Value> {
        self.root_context(format!("call:{}", path))
            .scope(|ctx| async move { ctx.call(path, args).await })
            .await
    }
}

#[async_trait]
impl ProxyFactory for Runtime {
    async fn materialize(&self, name: &ServiceName, entry: &RegistryEntry) -> Result<Arc<Endpoint>> {
        let proxy = self.proxy_endpoint(name, &entry.version, &entry.params)?;
        proxy.start().await?;
        Ok(proxy)
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("service", &self.inner.config.service_name)
            .field("bindings", &self.bindings())
            .finish()
    }
}

/// Assembles a `Runtime`. Without a remote registry the runtime gets an empty
/// static one; without a recorder spans go to the log.
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    remote: Option<Arc<dyn RemoteDiscovery>>,
    recorder: Option<Arc<dyn SpanRecorder>>,
    bindings: Vec<(String, Arc<dyn Binding>)>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
            remote: None,
            recorder: None,
            bindings: Vec::new(),
        }
    }

    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn remote_discovery(mut self, remote: Arc<dyn RemoteDiscovery>) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn recorder(mut self, recorder: Arc<dyn SpanRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// Registers `binding` under `name`, the value of the `transport`
    /// connection parameter that selects it. A later binding replaces an
    /// earlier one of the same name.
    pub fn binding(mut self, name: impl Into<String>, binding: impl Binding) -> Self {
        self.bindings.push((name.into(), Arc::new(binding)));
        self
    }

    pub fn build(self) -> Runtime {
        let order = self.config.registry.version_order;
        let remote = self
            .remote
            .unwrap_or_else(|| Arc::new(StaticDiscovery::new(order)));
        let recorder = self.recorder.unwrap_or_else(|| Arc::new(LogRecorder));
        let bindings = DashMap::new();
        for (name, binding) in self.bindings {
            bindings.insert(name, binding);
        }
        Runtime {
            inner: Arc::new(RuntimeInner {
                tracer: Tracer::new(self.config.service_name.clone(), recorder),
                discovery: CompositeDiscovery::new(remote),
                bindings,
                config: self.config,
            }),
        }
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
