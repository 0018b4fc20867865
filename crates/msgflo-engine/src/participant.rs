//! The handle returned by [`crate::Engine::register_participant`].
//!
//! Holds an `Arc`-cloned reference into the engine's transport rather than a
//! back-pointer to the whole `Engine`, so a handler can clone and move a
//! `Participant` into a spawned task and still call `send` from there
//! (spec §9: "cyclic back-reference participant<->engine" avoided this way).

use std::sync::Arc;

use msgflo_common::{Definition, EngineError, Result};
use msgflo_transport::Transport;

/// A registered participant's outbound-publish capability.
#[derive(Clone)]
pub struct Participant {
    definition: Arc<Definition>,
    transport: Arc<dyn Transport>,
}

impl Participant {
    pub(crate) fn new(definition: Definition, transport: Arc<dyn Transport>) -> Self {
        Self {
            definition: Arc::new(definition),
            transport,
        }
    }

    pub fn definition(&self) -> &Definition {
        &self.definition
    }

    /// Publishes `payload` on the outport named `port_id`.
    pub async fn send(&self, port_id: &str, payload: Vec<u8>) -> Result<()> {
        let port = self
            .definition
            .outports
            .iter()
            .find(|p| p.id == port_id)
            .ok_or_else(|| EngineError::UnknownPort(port_id.to_string(), self.definition.id.clone()))?;
        self.transport.publish(&port.queue, payload).await
    }

    pub fn connected(&self) -> bool {
        self.transport.connected()
    }
}
