//! MQTT 3.1.x transport, built on `rumqttc`'s `AsyncClient` + `EventLoop`.
//!
//! A single client/event-loop pair serves every registration (unlike the
//! per-subscription client pattern some MQTT adapters use) since the engine
//! itself is single-threaded cooperative and only one poll loop runs per
//! transport (spec §4.4, §4.7).

use std::time::Duration;

use async_trait::async_trait;
use msgflo_common::{EngineError, Port, Result};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use crate::{dispatch, Delivery, Handler, Transport};

/// Parsed MQTT connection parameters (spec §4.5).
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub client_id: String,
    pub clean_session: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            keep_alive: Duration::from_secs(180),
            client_id: String::new(),
            clean_session: true,
        }
    }
}

struct Registration {
    port: Port,
    handler: Handler,
}

/// MQTT 3.1.x transport: one subscription per inport at QoS 0. Discovery
/// re-announcement is owned by the engine's generic discovery loop (spec
/// §4.6), which calls [`Transport::publish_discovery`] the same way for
/// every transport; this type only drives the subscribe/publish/poll
/// mechanics specific to MQTT.
pub struct MqttTransport {
    config: MqttConfig,
    client: RwLock<Option<AsyncClient>>,
    inports: RwLock<Vec<Registration>>,
    connected: std::sync::atomic::AtomicBool,
}

impl MqttTransport {
    pub fn new(config: MqttConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
            inports: RwLock::new(Vec::new()),
            connected: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn client_id(&self) -> String {
        if self.config.client_id.is_empty() {
            format!("msgflo-{}", uuid_like_suffix())
        } else {
            self.config.client_id.clone()
        }
    }

    async fn connect(&self) -> (AsyncClient, rumqttc::EventLoop) {
        let mut options = MqttOptions::new(self.client_id(), self.config.host.clone(), self.config.port);
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(self.config.clean_session);
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        AsyncClient::new(options, 100)
    }

    async fn resubscribe_all(&self, client: &AsyncClient) -> Result<()> {
        let inports = self.inports.read().await;
        for registration in inports.iter() {
            client
                .subscribe(&registration.port.queue, QoS::AtMostOnce)
                .await
                .map_err(|e| {
                    EngineError::Transport(format!(
                        "subscribe to '{}' failed: {e}",
                        registration.port.queue
                    ))
                })?;
        }
        Ok(())
    }
}

fn uuid_like_suffix() -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

#[async_trait]
impl Transport for MqttTransport {
    async fn register_inport(&self, port: &Port, handler: Handler) -> Result<()> {
        if let Some(client) = self.client.read().await.as_ref() {
            client
                .subscribe(&port.queue, QoS::AtMostOnce)
                .await
                .map_err(|e| EngineError::Transport(format!("subscribe to '{}' failed: {e}", port.queue)))?;
        }
        self.inports.write().await.push(Registration {
            port: port.clone(),
            handler,
        });
        Ok(())
    }

    async fn declare_outport(&self, _port: &Port) -> Result<()> {
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<()> {
        let client_guard = self.client.read().await;
        let client = client_guard
            .as_ref()
            .ok_or_else(|| EngineError::Transport("MQTT client not connected".to_string()))?;
        client
            .publish(queue, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|e| EngineError::Transport(format!("publish to '{queue}' failed: {e}")))?;
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let (client, mut event_loop) = self.connect().await;
        *self.client.write().await = Some(client.clone());

        if let Err(e) = self.resubscribe_all(&client).await {
            error!(error = %e, "failed to subscribe MQTT inports");
        }

        loop {
            tokio::select! {
                event = event_loop.poll() => {
                    match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            self.connected.store(true, std::sync::atomic::Ordering::SeqCst);
                            info!("MQTT CONNACK received");
                            if let Err(e) = self.resubscribe_all(&client).await {
                                error!(error = %e, "failed to resubscribe MQTT inports");
                            }
                        }
                        Ok(Event::Incoming(Incoming::Publish(publish))) => {
                            self.route_publish(&publish.topic, publish.payload.to_vec()).await;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            self.connected.store(false, std::sync::atomic::Ordering::SeqCst);
                            warn!(error = %e, "MQTT event loop error, retrying");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    return Ok(());
                }
            }
        }
    }

    async fn shutdown(&self) {
        self.connected.store(false, std::sync::atomic::Ordering::SeqCst);
        if let Some(client) = self.client.write().await.take() {
            let _ = client.disconnect().await;
        }
        debug!("MQTT transport shut down");
    }
}

impl MqttTransport {
    /// Dispatches an incoming PUBLISH to the first registered inport whose
    /// `queue` matches `topic` exactly (spec §4.4: exact-string matching,
    /// no wildcard expansion).
    async fn route_publish(&self, topic: &str, payload: Vec<u8>) {
        let inports = self.inports.read().await;
        let matched = inports
            .iter()
            .find(|registration| registration.port.queue == topic);

        let Some(registration) = matched else {
            debug!(topic = %topic, "no inport registered for MQTT topic");
            return;
        };

        let handler = registration.handler.clone();
        let port_id = registration.port.id.clone();
        drop(inports);

        let delivery = Delivery::new(port_id, payload, |_ack_nack| {
            Box::pin(async move { Ok(()) })
        });
        if let Err(e) = dispatch(&handler, delivery).await {
            error!(topic = %topic, error = %e, "participant handler failed");
        }
    }
}
