//! Live-broker MQTT transport tests.
//!
//! Require a reachable MQTT 3.1.x broker. Skipped unless `MQTT_TEST_URL` is
//! set (spec §8 item 2).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use msgflo_common::Port;
use msgflo_transport::mqtt::{MqttConfig, MqttTransport};
use msgflo_transport::url::{resolve, BrokerUrl};
use msgflo_transport::{Delivery, Transport};
use tokio::sync::broadcast;

fn test_config() -> Option<MqttConfig> {
    let url = std::env::var("MQTT_TEST_URL").ok()?;
    match resolve(&url).ok()? {
        BrokerUrl::Mqtt(mqtt_url) => Some(mqtt_url.into()),
        BrokerUrl::Amqp(_) => None,
    }
}

#[tokio::test]
async fn publish_and_consume_round_trip() {
    let Some(config) = test_config() else {
        eprintln!("skipping: MQTT_TEST_URL not set");
        return;
    };

    let transport = Arc::new(MqttTransport::new(config));
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let run_transport = transport.clone();
    let handle = tokio::spawn(async move { run_transport.run(shutdown_rx).await });

    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut inport = Port::new("in", "any");
    inport.queue = "msgflo-transport-test/in".to_string();

    let received = Arc::new(AtomicBool::new(false));
    let received_clone = received.clone();
    transport
        .register_inport(
            &inport,
            Arc::new(move |delivery: Delivery| {
                let received = received_clone.clone();
                Box::pin(async move {
                    received.store(true, Ordering::SeqCst);
                    let _ = delivery.ack().await;
                })
            }),
        )
        .await
        .expect("register inport");

    tokio::time::sleep(Duration::from_millis(300)).await;

    transport
        .publish(&inport.queue, b"hello".to_vec())
        .await
        .expect("publish");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(received.load(Ordering::SeqCst));

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}

#[tokio::test]
async fn ack_and_nack_are_no_ops_at_qos_0() {
    let Some(config) = test_config() else {
        eprintln!("skipping: MQTT_TEST_URL not set");
        return;
    };

    let transport = Arc::new(MqttTransport::new(config));
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let run_transport = transport.clone();
    let handle = tokio::spawn(async move { run_transport.run(shutdown_rx).await });

    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut inport = Port::new("in", "any");
    inport.queue = "msgflo-transport-test/nack".to_string();

    transport
        .register_inport(
            &inport,
            Arc::new(|delivery: Delivery| {
                Box::pin(async move {
                    delivery.nack().await.expect("nack should succeed as a no-op");
                })
            }),
        )
        .await
        .expect("register inport");

    tokio::time::sleep(Duration::from_millis(300)).await;
    transport
        .publish(&inport.queue, b"hello".to_vec())
        .await
        .expect("publish");
    tokio::time::sleep(Duration::from_millis(300)).await;

    let _ = shutdown_tx.send(());
    let _ = handle.await;
}
