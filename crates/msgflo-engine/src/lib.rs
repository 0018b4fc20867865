//! Engine core: participant registry, transport selection, the dispatch
//! entry point (`launch`), and the discovery announcement loop.
//!
//! This is the broker-agnostic half of the library; `msgflo-transport`
//! supplies the AMQP/MQTT mechanics behind the `Transport` trait this crate
//! drives.

pub mod discovery;
pub mod participant;
pub mod registry;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub use msgflo_common::{Definition, EngineError, Port, Result};
pub use msgflo_transport::{AckNack, Handler};
pub use participant::Participant;

use msgflo_transport::amqp::{AmqpConfig, AmqpTransport};
use msgflo_transport::mqtt::MqttTransport;
use msgflo_transport::url::{self, BrokerUrl};
use msgflo_transport::Transport;
use registry::Registry;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// A per-delivery view handed to a participant's handler (spec §3 "Message").
pub type Message = msgflo_transport::Delivery;

/// Engine construction options (spec §6).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Broker URL; scheme selects the transport. Falls back to `MSGFLO_BROKER`
    /// when empty.
    pub url: String,
    /// Enables verbose internal logging. The engine itself does not call
    /// `tracing_subscriber::init` — see `msgflo_common::logging::init_logging`,
    /// called once by the host before constructing the engine — but this
    /// flag is honored by `MSGFLO_CPP_DEBUG`-aware default-level resolution
    /// there.
    pub debug_output: bool,
    /// Base period in seconds; discovery announcements fire at `/3` this.
    pub discovery_period: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            debug_output: std::env::var("MSGFLO_CPP_DEBUG").is_ok(),
            discovery_period: Duration::from_secs(60),
        }
    }
}

/// The broker-agnostic participant-library engine (spec §4.2).
pub struct Engine {
    transport: Arc<dyn Transport>,
    registry: Arc<Registry>,
    discovery_period: Duration,
    shutdown_tx: broadcast::Sender<()>,
    launched: AtomicBool,
}

impl Engine {
    /// Resolves `config.url` (or `MSGFLO_BROKER`) to a transport and
    /// constructs the engine. Does not connect; connection happens in
    /// `launch`.
    pub fn new(config: EngineConfig) -> Result<Self> {
        if config.debug_output {
            debug!("engine constructed with debug_output enabled");
        }

        let transport: Arc<dyn Transport> = match url::resolve(&config.url)? {
            BrokerUrl::Amqp(uri) => Arc::new(AmqpTransport::new(AmqpConfig::new(uri))),
            BrokerUrl::Mqtt(mqtt_url) => Arc::new(MqttTransport::new(mqtt_url.into())),
        };

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            transport,
            registry: Arc::new(Registry::new()),
            discovery_period: config.discovery_period,
            shutdown_tx,
            launched: AtomicBool::new(false),
        })
    }

    /// Normalizes and validates `definition`, wires its ports to the
    /// transport, and returns a [`Participant`] handle. Must be called
    /// before [`Engine::launch`].
    pub async fn register_participant(
        &self,
        definition: Definition,
        handler: Handler,
    ) -> Result<Participant> {
        if self.launched.load(Ordering::SeqCst) {
            return Err(EngineError::InvalidDefinition(
                "cannot register a participant after launch".to_string(),
            ));
        }

        let definition = definition.normalize();
        definition.validate()?;

        if self.registry.contains_id(&definition.id).await {
            return Err(EngineError::InvalidDefinition(format!(
                "duplicate participant id '{}'",
                definition.id
            )));
        }

        for port in &definition.inports {
            self.transport.register_inport(port, handler.clone()).await?;
        }
        for port in &definition.outports {
            self.transport.declare_outport(port).await?;
        }

        self.registry.insert(definition.clone()).await;

        Ok(Participant::new(definition, self.transport.clone()))
    }

    /// Runs the transport's event loop and the discovery loop until either
    /// returns (fatal transport error) or the caller drops/cancels the
    /// returned future (external signal, e.g. Ctrl-C in the host binary).
    /// At-most-once per engine: a second call returns `InvalidConfig`.
    pub async fn launch(self) -> Result<()> {
        if self.launched.swap(true, Ordering::SeqCst) {
            return Err(EngineError::InvalidConfig(
                "engine already launched".to_string(),
            ));
        }

        info!("engine launching");

        let transport_shutdown = self.shutdown_tx.subscribe();
        let discovery_shutdown = self.shutdown_tx.subscribe();

        let transport = self.transport.clone();
        let transport_task = tokio::spawn(async move { transport.run(transport_shutdown).await });

        let discovery_transport = self.transport.clone();
        let discovery_registry = self.registry.clone();
        let discovery_period = self.discovery_period;
        let discovery_task = tokio::spawn(async move {
            discovery::run(discovery_transport, discovery_registry, discovery_period, discovery_shutdown).await
        });

        let result = tokio::select! {
            res = transport_task => res.map_err(|e| EngineError::Transport(e.to_string()))?,
            res = discovery_task => res.map_err(|e| EngineError::Transport(e.to_string()))?,
        };

        let _ = self.shutdown_tx.send(());
        self.transport.shutdown().await;

        result
    }

    /// Current transport-connection state.
    pub fn connected(&self) -> bool {
        self.transport.connected()
    }
}
