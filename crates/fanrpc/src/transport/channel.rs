//! # Channel Transport
//!
//! Request/response layered over publish/subscribe. A proxy subscribes to a
//! fresh random back-route and publishes calls to the service's `queue`; a
//! remote subscribes to `queue` and publishes each response to the call's
//! back-route.
//!
//! A single read loop per transport decodes inbound messages in arrival order.
//! Inbound calls are handled in their own tasks so that a handler making
//! nested calls never stalls the loop. Any read-loop failure terminates the
//! transport: every pending call fails with the same cause.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::Weak;

use serde::Deserialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::CallArgs;
use crate::Context;
use crate::RuntimeConfig;
use crate::span::SpanContext;
use crate::span::random_id;
use crate::transport::Binding;
use crate::transport::Error;
use crate::transport::Result;
use crate::transport::Role;
use crate::transport::Transport;
use crate::transport::TransportCore;
use crate::transport::envelope::Envelope;
use crate::transport::envelope::Response;
use crate::transport::pending::PendingCalls;

/// A pub/sub message broker.
#[async_trait::async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Subscribes to `channel`.
    async fn subscribe(&self, channel: &str) -> Result<Box<dyn Subscription>>;

    /// Opens a publishing connection.
    async fn publisher(&self) -> Result<Arc<dyn Publisher>>;
}

/// The receiving end of one subscription.
#[async_trait::async_trait]
pub trait Subscription: Send + 'static {
    /// The next message, or `None` once the channel is closed.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>>;
}

#[async_trait::async_trait]
pub trait Publisher: Send + Sync + 'static {
    /// Publishes `payload` to `channel` and returns how many subscribers
    /// received it.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<usize>;
}

#[derive(Deserialize)]
struct ChannelParams {
    queue: String,
}

/// Live connections of a started transport.
struct ChannelIo {
    publisher: Arc<dyn Publisher>,
    back_route: Option<String>,
    // Dropping this ends the read loop.
    _stop: oneshot::Sender<()>,
}

pub struct ChannelTransport {
    core: TransportCore,
    broker: Arc<dyn Broker>,
    queue: String,
    min_subscribers: usize,
    pending: PendingCalls,
    io: Mutex<Option<ChannelIo>>,
    me: Weak<ChannelTransport>,
}

impl ChannelTransport {
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// The private route responses arrive on, for a started proxy.
    pub fn back_route(&self) -> Option<String> {
        self.io().as_ref().and_then(|io| io.back_route.clone())
    }

    /// Calls waiting for a response.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    async fn sub_prepare(&self, route: &str) -> Result<Box<dyn Subscription>> {
        debug!(owner = %self.core.owner(), route, "subscribing");
        self.broker.subscribe(route).await
    }

    async fn pub_prepare(&self) -> Result<Arc<dyn Publisher>> {
        self.broker.publisher().await
    }

    /// Releases both connections. Dropping the stop handle ends the read
    /// loop, which drops the subscription.
    fn release(&self) -> bool {
        self.io().take().is_some()
    }

    fn connection(&self) -> Result<(Arc<dyn Publisher>, Option<String>)> {
        match self.io().as_ref() {
            Some(io) => Ok((io.publisher.clone(), io.back_route.clone())),
            None => Err(self.core.failure().unwrap_or(Error::Closed)),
        }
    }

    fn io(&self) -> MutexGuard<'_, Option<ChannelIo>> {
        self.io.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Classifies one inbound message.
    fn handle_message(self: &Arc<Self>, payload: &[u8]) -> Result<()> {
        let mut envelope = Envelope::decode(payload)?;

        if let Some(response) = envelope.response.take() {
            let result = match response {
                Response::Ok(value) => Ok(value),
                Response::Error(message) => Err(Error::Remote(message)),
            };
            let key = envelope.correlation_key();
            if !self.pending.resolve(key, result) {
                warn!(owner = %self.core.owner(), key, method = %envelope.method, "dropping unmatched response");
            }
            return Ok(());
        }

        if self.core.role() != Role::Remote {
            warn!(owner = %self.core.owner(), method = %envelope.method, "proxy received a call, dropping it");
            return Ok(());
        }

        let parent = envelope.context_headers.to_span_context()?;
        let this = self.clone();
        tokio::spawn(async move { this.answer(envelope, parent).await });
        Ok(())
    }

    async fn answer(&self, envelope: Envelope, parent: SpanContext) {
        let result = self
            .core
            .handle_call(&envelope.method, Some(&parent), envelope.call_args())
            .await;
        let response = match result {
            Ok(value) => Response::Ok(value),
            Err(e) => {
                debug!(owner = %self.core.owner(), method = %envelope.method, error = %e, "handler failed");
                Response::Error(e.to_string())
            }
        };

        let Some(back_route) = envelope.back_route.as_deref() else {
            warn!(owner = %self.core.owner(), method = %envelope.method, "call has no back-route, dropping response");
            return;
        };
        let payload = match envelope.reply(response).encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(owner = %self.core.owner(), error = %e, "failed to encode response");
                return;
            }
        };
        let Ok((publisher, _)) = self.connection() else {
            debug!(owner = %self.core.owner(), "stopped before the response could be sent");
            return;
        };
        if let Err(e) = publisher.publish(back_route, payload).await {
            warn!(owner = %self.core.owner(), back_route, error = %e, "failed to publish response");
        }
    }

    /// Terminates the transport after a read-loop failure.
    fn fail(&self, cause: Error) {
        warn!(owner = %self.core.owner(), %cause, "channel transport failed");
        let failed = self.pending.fail_all(cause.clone());
        if failed > 0 {
            debug!(owner = %self.core.owner(), failed, "failed pending calls");
        }
        self.core.terminate(cause);
        self.release();
    }
}

async fn read_loop(
    me: Weak<ChannelTransport>,
    mut subscription: Box<dyn Subscription>,
    mut stop: oneshot::Receiver<()>,
    route: String,
) {
    let cause = loop {
        let received = tokio::select! {
            _ = &mut stop => {
                debug!(route, "read loop stopped");
                return;
            }
            received = subscription.recv() => received,
        };
        let Some(transport) = me.upgrade() else {
            return;
        };
        match received {
            Ok(Some(payload)) => {
                if let Err(e) = transport.handle_message(&payload) {
                    break e;
                }
            }
            Ok(None) => break Error::Disconnected(format!("channel '{}' closed", route)),
            Err(e) => break e,
        }
    };

    if let Some(transport) = me.upgrade() {
        transport.fail(cause);
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    fn core(&self) -> &TransportCore {
        &self.core
    }

    async fn rpc_call(&self, method: &str, ctx: &Context, args: CallArgs) -> Result<Value> {
        let (publisher, back_route) = self.connection()?;
        let Some(back_route) = back_route else {
            return Err(Error::Params(format!(
                "'{}' listens on '{}' and cannot issue calls",
                self.core.owner(),
                self.queue
            )));
        };

        let span = ctx.span_context();
        let slot = self.pending.register(&span.span_id_hex())?;
        let payload = Envelope::call(&span, method, args, Some(back_route), slot.key()).encode()?;

        let delivered = publisher.publish(&self.queue, payload).await?;
        if delivered < self.min_subscribers {
            return Err(Error::Unacknowledged {
                delivered,
                required: self.min_subscribers,
            });
        }
        debug!(owner = %self.core.owner(), method, key = slot.key(), "awaiting response");

        let termination = self.core.termination();
        tokio::select! {
            result = slot.wait() => result,
            cause = termination.wait() => Err(cause),
        }
    }

    async fn on_start(&self) -> Result<()> {
        let (route, back_route) = match self.core.role() {
            Role::Proxy => {
                let route = format!("{}.back.{:016x}", self.core.owner(), random_id());
                (route.clone(), Some(route))
            }
            Role::Remote => (self.queue.clone(), None),
        };

        let subscription = self.sub_prepare(&route).await?;
        let publisher = self.pub_prepare().await?;
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(read_loop(self.me.clone(), subscription, stop_rx, route.clone()));

        *self.io() = Some(ChannelIo {
            publisher,
            back_route,
            _stop: stop_tx,
        });
        info!(owner = %self.core.owner(), route, queue = %self.queue, "channel transport started");
        Ok(())
    }

    async fn on_stop(&self) -> Result<()> {
        self.release();
        self.pending.fail_all(Error::Closed);
        info!(owner = %self.core.owner(), "channel transport stopped");
        Ok(())
    }
}

/// Builds channel transports over one broker. Binding name: `channel`.
pub struct ChannelBinding {
    broker: Arc<dyn Broker>,
    min_subscribers: Option<usize>,
}

impl ChannelBinding {
    pub const NAME: &'static str = "channel";

    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            min_subscribers: None,
        }
    }

    /// Overrides the runtime's `publish_min_subscribers` for this binding.
    pub fn min_subscribers(mut self, min_subscribers: usize) -> Self {
        self.min_subscribers = Some(min_subscribers);
        self
    }
}

impl Binding for ChannelBinding {
    fn build(&self, core: TransportCore, config: &RuntimeConfig) -> Result<Arc<dyn Transport>> {
        let params: ChannelParams = core.params().parse()?;
        let min_subscribers = self.min_subscribers.unwrap_or(config.publish_min_subscribers);
        let transport: Arc<ChannelTransport> = Arc::new_cyclic(|me| ChannelTransport {
            core,
            broker: self.broker.clone(),
            queue: params.queue,
            min_subscribers,
            pending: PendingCalls::new(),
            io: Mutex::new(None),
            me: me.clone(),
        });
        Ok(transport)
    }
}
