//! AMQP 0-9-1 transport (RabbitMQ-style), built on `lapin`.
//!
//! Follows the same connect/channel/queue_declare/basic_consume idiom as the
//! teacher's ActiveMQ transport, generalized: one fanout exchange per
//! outport, one durable queue + consumer per inport, keyed off the
//! participant's normalized `Definition` rather than a single fixed queue.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::*, types::FieldTable, BasicProperties, Channel, Connection, ConnectionProperties,
};
use msgflo_common::{EngineError, Port, Result};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, error, info, warn};

use crate::{dispatch, AckNack, Delivery, Handler, Transport};

/// AMQP connection settings; `uri` is passed verbatim to `lapin`.
#[derive(Debug, Clone)]
pub struct AmqpConfig {
    pub uri: String,
    pub connection_name: String,
}

impl AmqpConfig {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            connection_name: "msgflo".to_string(),
        }
    }
}

struct Registration {
    port: Port,
    handler: Handler,
}

/// AMQP 0-9-1 transport: durable queue + consumer per inport, fanout
/// exchange per outport, prefetch 1 (spec §4.3).
pub struct AmqpTransport {
    config: AmqpConfig,
    connection: RwLock<Option<Connection>>,
    channel: RwLock<Option<Channel>>,
    inports: RwLock<Vec<Registration>>,
    outports: RwLock<Vec<Port>>,
    connected: AtomicBool,
}

impl AmqpTransport {
    pub fn new(config: AmqpConfig) -> Self {
        Self {
            config,
            connection: RwLock::new(None),
            channel: RwLock::new(None),
            inports: RwLock::new(Vec::new()),
            outports: RwLock::new(Vec::new()),
            connected: AtomicBool::new(false),
        }
    }

    async fn connect(&self) -> Result<Channel> {
        info!(uri = %self.config.uri, "connecting to AMQP broker");

        let connection = Connection::connect(
            &self.config.uri,
            ConnectionProperties::default()
                .with_connection_name(self.config.connection_name.clone().into()),
        )
        .await
        .map_err(|e| EngineError::Transport(format!("AMQP connection failed: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| EngineError::Transport(format!("failed to create channel: {e}")))?;

        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| EngineError::Transport(format!("failed to set QoS: {e}")))?;

        *self.connection.write().await = Some(connection);
        *self.channel.write().await = Some(channel.clone());
        self.connected.store(true, Ordering::SeqCst);

        info!("connected to AMQP broker");
        Ok(channel)
    }

    /// Returns the current channel if the transport is connected. Never
    /// connects itself — connecting is `run()`'s job, driven from `launch()`
    /// (spec §4.2's Connecting/Connected states only apply during/after
    /// launch).
    async fn channel(&self) -> Result<Channel> {
        self.channel
            .read()
            .await
            .clone()
            .ok_or_else(|| EngineError::Transport("AMQP transport not connected".to_string()))
    }

    /// (Re-)declares every registered inport's queue/consumer and every
    /// outport's fanout exchange against the current channel.
    async fn setup(&self, channel: &Channel) -> Result<()> {
        let inports = self.inports.read().await;
        for registration in inports.iter() {
            self.declare_and_consume(channel, registration).await?;
        }
        drop(inports);

        let outports = self.outports.read().await;
        for port in outports.iter() {
            self.declare_fanout(channel, port).await?;
        }
        Ok(())
    }

    async fn declare_fanout(&self, channel: &Channel, port: &Port) -> Result<()> {
        channel
            .exchange_declare(
                &port.queue,
                lapin::ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                EngineError::Transport(format!("failed to declare exchange '{}': {e}", port.queue))
            })?;
        Ok(())
    }

    async fn declare_and_consume(&self, channel: &Channel, registration: &Registration) -> Result<()> {
        let queue_name = &registration.port.queue;
        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                EngineError::Transport(format!("failed to declare queue '{queue_name}': {e}"))
            })?;

        let consumer_tag = format!("msgflo-{queue_name}");
        let mut consumer = channel
            .basic_consume(
                queue_name,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                EngineError::Transport(format!("failed to consume from '{queue_name}': {e}"))
            })?;

        let port_id = registration.port.id.clone();
        let handler = registration.handler.clone();
        let channel = channel.clone();
        let queue_name = queue_name.clone();

        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                let delivery = match delivery {
                    Ok(d) => d,
                    Err(e) => {
                        error!(queue = %queue_name, error = %e, "AMQP consumer error");
                        break;
                    }
                };

                let delivery_tag = delivery.delivery_tag;
                let channel = channel.clone();
                let payload = delivery.data;
                let port_id = port_id.clone();

                let view = Delivery::new(port_id, payload, move |ack_nack| {
                    let channel = channel.clone();
                    Box::pin(async move {
                        let result = match ack_nack {
                            AckNack::Ack => {
                                channel
                                    .basic_ack(delivery_tag, BasicAckOptions::default())
                                    .await
                            }
                            AckNack::Nack => {
                                channel
                                    .basic_reject(
                                        delivery_tag,
                                        BasicRejectOptions { requeue: false },
                                    )
                                    .await
                            }
                        };
                        result.map_err(|e| {
                            EngineError::Transport(format!("ack/nack failed: {e}"))
                        })
                    })
                });

                if let Err(e) = dispatch(&handler, view).await {
                    error!(queue = %queue_name, error = %e, "participant handler failed");
                }
            }
            warn!(queue = %queue_name, "AMQP consumer stream ended");
        });

        Ok(())
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn register_inport(&self, port: &Port, handler: Handler) -> Result<()> {
        let registration = Registration {
            port: port.clone(),
            handler,
        };
        // Registration happens before `launch`, so there is normally no
        // channel yet; topology is declared from `setup()` once `run()`
        // connects. If a channel already exists (a participant registered
        // while already running), declare against it immediately too.
        if let Some(channel) = self.channel.read().await.clone() {
            self.declare_and_consume(&channel, &registration).await?;
        }
        self.inports.write().await.push(registration);
        Ok(())
    }

    async fn declare_outport(&self, port: &Port) -> Result<()> {
        if let Some(channel) = self.channel.read().await.clone() {
            self.declare_fanout(&channel, port).await?;
        }
        self.outports.write().await.push(port.clone());
        Ok(())
    }

    async fn publish(&self, queue: &str, payload: Vec<u8>) -> Result<()> {
        let channel = self.channel().await?;
        let is_discovery = queue == msgflo_common::DISCOVERY_DESTINATION;
        let (exchange, routing_key) = if is_discovery { ("", queue) } else { (queue, "") };

        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await
            .map_err(|e| EngineError::Transport(format!("publish to '{queue}' failed: {e}")))?
            .await
            .map_err(|e| EngineError::Transport(format!("publish confirm failed: {e}")))?;

        Ok(())
    }

    fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        loop {
            let channel = match self.connect().await {
                Ok(channel) => channel,
                Err(e) => {
                    error!(error = %e, "AMQP connection attempt failed, retrying in 1s");
                    tokio::select! {
                        _ = tokio::time::sleep(std::time::Duration::from_secs(1)) => continue,
                        _ = shutdown.recv() => return Ok(()),
                    }
                }
            };

            if let Err(e) = self.setup(&channel).await {
                error!(error = %e, "failed to declare AMQP topology");
            }

            let (tx, mut rx) = tokio::sync::mpsc::channel::<()>(1);
            if let Some(connection) = self.connection.read().await.as_ref() {
                connection.on_error(move |_| {
                    let _ = tx.try_send(());
                });
            }

            tokio::select! {
                _ = rx.recv() => {
                    warn!("AMQP connection error signaled, reconnecting");
                    self.connected.store(false, Ordering::SeqCst);
                }
                _ = shutdown.recv() => {
                    return Ok(());
                }
            }
        }
    }

    async fn shutdown(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(channel) = self.channel.write().await.take() {
            let _ = channel.close(200, "shutdown").await;
        }
        if let Some(connection) = self.connection.write().await.take() {
            let _ = connection.close(200, "shutdown").await;
        }
        debug!("AMQP transport shut down");
    }
}
