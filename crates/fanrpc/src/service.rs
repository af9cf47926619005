//! # Services
//!
//! A service is a named, versioned table of async handlers. Handlers are
//! registered explicitly through `ServiceBuilder`; there is no reflection.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tracing::debug;

use crate::CallArgs;
use crate::Context;
use crate::Error;
use crate::Result;
use crate::ServiceName;
use crate::discovery::is_valid_version;

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// A type-erased service method.
pub type Handler = Arc<dyn Fn(Context, CallArgs) -> HandlerFuture + Send + Sync>;

pub const DEFAULT_VERSION: &str = "1.0.0";

pub struct Service {
    name: ServiceName,
    version: String,
    methods: BTreeMap<String, Handler>,
}

impl Service {
    pub fn name(&self) -> &ServiceName {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    /// Runs `method` with `ctx` as its call frame.
    pub async fn dispatch(&self, ctx: Context, method: &str, args: CallArgs) -> Result<Value> {
        let Some(handler) = self.methods.get(method) else {
            return Err(Error::MethodNotFound {
                service: self.name.to_string(),
                method: method.to_string(),
            });
        };
        debug!(service = %self.name, method, "dispatching");
        handler(ctx, args).await.map_err(Error::Handler)
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Builds a `Service` method by method.
///
/// ```ignore
/// let svc = ServiceBuilder::new("dummy")
///     .method("ping", |_ctx, _args| async { Ok(json!("pong")) })
///     .build()?;
/// ```
pub struct ServiceBuilder {
    name: String,
    version: String,
    methods: BTreeMap<String, Handler>,
}

impl ServiceBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: DEFAULT_VERSION.to_string(),
            methods: BTreeMap::new(),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Registers `handler` under `name`, replacing any previous handler.
    pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Context, CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx: Context, args: CallArgs| handler(ctx, args).boxed());
        self.methods.insert(name.into(), handler);
        self
    }

    pub fn build(self) -> Result<Arc<Service>> {
        let name = ServiceName::parse(&self.name)?;
        if !is_valid_version(&self.version) {
            return Err(Error::Config(format!(
                "service '{}' has invalid version {:?}",
                name, self.version
            )));
        }
        Ok(Arc::new(Service {
            name,
            version: self.version,
            methods: self.methods,
        }))
    }
}
