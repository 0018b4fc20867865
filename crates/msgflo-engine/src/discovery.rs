//! The discovery announcement loop (spec §4.6).
//!
//! A single `tokio::spawn` + `tokio::time::interval` + `tokio::sync::broadcast`
//! shutdown task, generalized from the teacher's per-concern lifecycle tasks
//! (see `fc-router/src/lifecycle.rs`) into "one discovery task shared across
//! all registrations" rather than one task per registration.

use std::sync::Arc;
use std::time::Duration;

use msgflo_common::Result;
use msgflo_transport::Transport;
use tokio::sync::broadcast;
use tracing::{debug, error};

use crate::registry::Registry;

/// Runs until `shutdown` fires. Announces every registered definition every
/// `discovery_period / 3`, skipping (not queuing) ticks while the transport
/// reports disconnected.
pub async fn run(
    transport: Arc<dyn Transport>,
    registry: Arc<Registry>,
    discovery_period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let mut ticker = tokio::time::interval(discovery_period / 3);
    ticker.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if !transport.connected() {
                    debug!("transport disconnected, skipping discovery tick");
                    continue;
                }
                for definition in registry.snapshot().await {
                    if let Err(e) = transport.publish_discovery(&definition).await {
                        error!(error = %e, participant = %definition.id, "discovery publish failed");
                    }
                }
            }
            _ = shutdown.recv() => {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use msgflo_common::{Definition, Port};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeTransport {
        connected: std::sync::atomic::AtomicBool,
        publish_count: AtomicUsize,
    }

    impl FakeTransport {
        fn new(connected: bool) -> Self {
            Self {
                connected: std::sync::atomic::AtomicBool::new(connected),
                publish_count: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn register_inport(&self, _port: &Port, _handler: msgflo_transport::Handler) -> Result<()> {
            Ok(())
        }

        async fn declare_outport(&self, _port: &Port) -> Result<()> {
            Ok(())
        }

        async fn publish(&self, _queue: &str, _payload: Vec<u8>) -> Result<()> {
            self.publish_count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn run(&self, _shutdown: broadcast::Receiver<()>) -> Result<()> {
            Ok(())
        }

        async fn shutdown(&self) {}
    }

    #[tokio::test(start_paused = true)]
    async fn announces_every_discovery_period_over_three() {
        let fake = Arc::new(FakeTransport::new(true));
        let transport: Arc<dyn Transport> = fake.clone();
        let registry = Arc::new(Registry::new());
        registry
            .insert(Definition::new("repeat", "CppRepeat").normalize())
            .await;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let period = Duration::from_secs(60);
        let handle = tokio::spawn(async move { run(transport, registry, period, shutdown_rx).await });

        tokio::time::advance(Duration::from_secs(1)).await;
        tokio::time::advance(period / 3).await;
        tokio::time::advance(period / 3).await;

        let _ = shutdown_tx.send(());
        let _ = handle.await;

        let count = fake.publish_count.load(Ordering::SeqCst);
        assert!(count >= 2, "expected at least 2 discovery publishes, got {count}");
    }

    #[tokio::test(start_paused = true)]
    async fn skips_ticks_while_disconnected() {
        let fake = Arc::new(FakeTransport::new(false));
        let transport: Arc<dyn Transport> = fake.clone();
        let registry = Arc::new(Registry::new());
        registry
            .insert(Definition::new("repeat", "CppRepeat").normalize())
            .await;

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let period = Duration::from_secs(60);
        let handle = tokio::spawn(async move { run(transport, registry, period, shutdown_rx).await });

        tokio::time::advance(period).await;

        let _ = shutdown_tx.send(());
        let _ = handle.await;

        assert_eq!(fake.publish_count.load(Ordering::SeqCst), 0);
    }
}
