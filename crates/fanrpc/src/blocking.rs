//! Blocking facade for sequential clients.
//!
//! `BlockingRuntime` owns a current-thread tokio runtime and drives every
//! operation to completion on it. Background tasks (transport read loops,
//! registry watches) only make progress while one of its methods is running.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::CallArgs;
use crate::Endpoint;
use crate::Result;
use crate::Runtime;
use crate::RuntimeBuilder;
use crate::Service;
use crate::transport::ConnectionParams;

pub struct BlockingRuntime {
    executor: tokio::runtime::Runtime,
    runtime: Runtime,
}

impl BlockingRuntime {
    pub fn new(builder: RuntimeBuilder) -> Result<Self> {
        let executor = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self {
            executor,
            runtime: builder.build(),
        })
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn start(&self) -> Result<()> {
        self.executor.block_on(self.runtime.start())
    }

    pub fn call(&self, path: &str, args: CallArgs) -> Result<Value> {
        self.executor.block_on(self.runtime.call(path, args))
    }

    pub fn register_local(&self, service: Arc<Service>) -> Result<Arc<Endpoint>> {
        self.executor.block_on(self.runtime.register_local(service))
    }

    pub fn serve(&self, service: Arc<Service>, params: ConnectionParams) -> Result<Arc<Endpoint>> {
        self.executor.block_on(self.runtime.serve(service, params))
    }

    /// Runs an arbitrary future on the owned executor.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.executor.block_on(future)
    }

    pub fn shutdown(self) -> Result<()> {
        let Self { executor, runtime } = self;
        executor.block_on(runtime.shutdown())
    }
}
