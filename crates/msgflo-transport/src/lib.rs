use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use msgflo_common::{Definition, DiscoveryMessage, Port};
use tokio::sync::broadcast;

pub mod amqp;
pub mod mqtt;
pub mod url;

pub use msgflo_common::{EngineError, Result};
pub use url::{BrokerUrl, MqttUrl};

/// Completion signal a handler sends back for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckNack {
    Ack,
    Nack,
}

type Completion = Box<dyn FnOnce(AckNack) -> BoxFuture<'static, Result<()>> + Send>;

/// A single inbound delivery handed to a participant's handler.
///
/// Valid only for the duration of the handler invocation. The handler must
/// call [`Delivery::ack`] or [`Delivery::nack`] exactly once; the transport
/// owns the underlying broker message and any delivery tag.
pub struct Delivery {
    port_id: String,
    payload: Vec<u8>,
    completion: Option<Completion>,
}

impl Delivery {
    pub fn new(
        port_id: impl Into<String>,
        payload: Vec<u8>,
        completion: impl FnOnce(AckNack) -> BoxFuture<'static, Result<()>> + Send + 'static,
    ) -> Self {
        Self {
            port_id: port_id.into(),
            payload,
            completion: Some(Box::new(completion)),
        }
    }

    pub fn port_id(&self) -> &str {
        &self.port_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn as_str(&self) -> Result<&str> {
        std::str::from_utf8(&self.payload)
            .map_err(|e| EngineError::Transport(format!("invalid utf-8 payload: {e}")))
    }

    pub fn as_json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(Into::into)
    }

    pub async fn ack(mut self) -> Result<()> {
        match self.completion.take() {
            Some(complete) => complete(AckNack::Ack).await,
            None => Ok(()),
        }
    }

    pub async fn nack(mut self) -> Result<()> {
        match self.completion.take() {
            Some(complete) => complete(AckNack::Nack).await,
            None => Ok(()),
        }
    }
}

/// A participant's inbound message handler.
pub type Handler = Arc<dyn Fn(Delivery) -> BoxFuture<'static, ()> + Send + Sync>;

/// Invokes `handler` with `delivery`, catching any panic so a single
/// misbehaving handler never brings down the dispatch loop. Returns
/// `Err(EngineError::HandlerPanic)` when the handler panicked; the caller
/// decides what, if anything, to do about the now-unacked delivery.
pub async fn dispatch(handler: &Handler, delivery: Delivery) -> Result<()> {
    let fut = (handler)(delivery);
    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(()) => Ok(()),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "participant handler panicked".to_string());
            tracing::error!(error = %message, "participant handler panicked; message left unacked");
            Err(EngineError::HandlerPanic(message))
        }
    }
}

/// A broker-agnostic wiring surface: exchanges/queues for AMQP, topics for
/// MQTT, plus publish and discovery-announce primitives (spec §4.2-§4.4).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Wires up one inport: declares/subscribes its broker address and
    /// starts delivering inbound messages to `handler`.
    async fn register_inport(&self, port: &Port, handler: Handler) -> Result<()>;

    /// Wires up one outport's broker address (no-op for transports that
    /// need no advance declaration, e.g. MQTT).
    async fn declare_outport(&self, port: &Port) -> Result<()>;

    /// Publishes `payload` to the broker address bound to `queue`.
    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<()>;

    /// Publishes the discovery message for `definition` to the fixed `"fbp"`
    /// destination (spec §3, §4.6).
    async fn publish_discovery(&self, definition: &Definition) -> Result<()> {
        let message = DiscoveryMessage::for_definition(definition.clone());
        let body = serde_json::to_vec(&message)?;
        self.publish(msgflo_common::DISCOVERY_DESTINATION, body).await
    }

    /// Current connection state.
    fn connected(&self) -> bool;

    /// Drives the transport's own event loop (connection/reconnection,
    /// and for MQTT, the inbound poll loop) until `shutdown` fires.
    async fn run(&self, shutdown: broadcast::Receiver<()>) -> Result<()>;

    /// Releases broker resources.
    async fn shutdown(&self);
}
