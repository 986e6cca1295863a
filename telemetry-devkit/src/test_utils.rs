/*!
Test Harness pour le kernel de télémétrie

Monte un kernel complet (IngestionService + Connection) sur un `MockBroker` :
- publication de messages simulés côté broker
- enregistrement de tous les `StateChange` notifiés
- attente bornée sur le snapshot ou les compteurs, sans sleep fixe
*/

use crate::mqtt_stub::{GestureMessageBuilder, MockBroker};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use telemetry_kernel::config::KernelConfig;
use telemetry_kernel::error::TransportError;
use telemetry_kernel::health::{HealthTracker, KernelHealth};
use telemetry_kernel::models::{Snapshot, StateChange};
use telemetry_kernel::publisher::SnapshotPublisher;
use telemetry_kernel::service::IngestionService;
use telemetry_kernel::transport::{BrokerOptions, CloseHandle, Connector, ReconnectPolicy};
use tokio::task::JoinHandle;
use tracing::info;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Logs lisibles dans la sortie des tests (`RUST_LOG=debug cargo test`)
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Backoff court pour que les reconnexions simulées soient quasi immédiates
pub fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        initial: Duration::from_millis(5),
        max: Duration::from_millis(50),
    }
}

pub struct TestHarness {
    pub broker: MockBroker,
    pub health: HealthTracker,
    pub gestures: GestureMessageBuilder,
    publisher: Arc<SnapshotPublisher>,
    changes: Arc<Mutex<Vec<StateChange>>>,
    close: CloseHandle,
    task: JoinHandle<Result<IngestionService, TransportError>>,
}

impl TestHarness {
    /// Kernel sur la configuration par défaut (topics Group_12/LSTM/predict)
    pub async fn new() -> Result<Self> {
        Self::with_config(KernelConfig::default()).await
    }

    pub async fn with_config(cfg: KernelConfig) -> Result<Self> {
        init_test_tracing();

        let health = HealthTracker::new();
        let mut service = IngestionService::from_config(&cfg, health.clone())?;
        let publisher = service.publisher();

        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        publisher.subscribe(move |change: &StateChange| sink.lock().push(change.clone()));

        let connector = Connector::new(BrokerOptions::from_conf(&cfg.broker), fast_reconnect(), health.clone());
        service.register_subscriptions(&connector);

        let broker = MockBroker::new();
        let mut connection = connector.connect_link(broker.link()).await?;
        let close = connection.close_handle();

        let task = tokio::spawn(async move {
            service.run(&mut connection).await?;
            let _ = connection.close().await;
            Ok::<_, TransportError>(service)
        });

        info!("[harness] kernel up on mock broker");
        Ok(Self {
            broker,
            health,
            gestures: GestureMessageBuilder::default(),
            publisher,
            changes,
            close,
            task,
        })
    }

    pub fn send_json(&self, topic: &str, payload: &Value) -> bool {
        self.broker.simulate_json(topic, payload)
    }

    pub fn send_raw(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        self.broker.simulate_incoming(topic, payload)
    }

    pub fn send_head(&self, user: &str, payload: &Value) -> bool {
        self.send_json(&self.gestures.head_topic(user), payload)
    }

    pub fn send_hand(&self, user: &str, payload: &Value) -> bool {
        self.send_json(&self.gestures.hand_topic(user), payload)
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.publisher.get_snapshot()
    }

    pub fn publisher(&self) -> Arc<SnapshotPublisher> {
        self.publisher.clone()
    }

    pub fn changes(&self) -> Vec<StateChange> {
        self.changes.lock().clone()
    }

    pub fn health_report(&self) -> KernelHealth {
        let snapshot = self.snapshot();
        let online = snapshot.devices.values().filter(|d| d.online).count();
        self.health.get_health(snapshot.devices.len(), online)
    }

    /// Attend que `count` messages aient été entièrement traités (appliqués, rejetés ou non routés)
    pub async fn wait_processed(&self, count: u64) -> Result<KernelHealth> {
        let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
        loop {
            let report = self.health_report();
            let processed = report.messages_applied + report.decode_errors + report.unrouted_messages;
            if processed >= count {
                return Ok(report);
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("timeout: {processed}/{count} messages processed");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Attend un snapshot qui satisfait le prédicat
    pub async fn wait_until<F>(&self, predicate: F) -> Result<Arc<Snapshot>>
    where
        F: Fn(&Snapshot) -> bool,
    {
        let deadline = tokio::time::Instant::now() + DEFAULT_TIMEOUT;
        loop {
            let snapshot = self.snapshot();
            if predicate(&snapshot) {
                return Ok(snapshot);
            }
            if tokio::time::Instant::now() >= deadline {
                bail!("timeout waiting for snapshot condition (version {})", snapshot.version);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Coupe puis rétablit la connexion, et attend la ré-émission de `filter`
    pub async fn bounce_connection(&self, filter: &str) -> Result<()> {
        self.broker.simulate_disconnect();
        self.broker.simulate_reconnect();
        if !self.broker.wait_for_subscription(filter, DEFAULT_TIMEOUT).await {
            bail!("subscription {filter} not restored after reconnect");
        }
        Ok(())
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    /// Ferme la connexion et rend le service pour inspection
    pub async fn shutdown(self) -> Result<IngestionService> {
        self.close.close();
        let service = self.task.await??;
        Ok(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn harness_routes_default_topics() {
        let harness = TestHarness::new().await.unwrap();
        assert!(harness.send_head("Glen", &GestureMessageBuilder::gesture("NOD", "NOD", 42)));
        harness.wait_processed(1).await.unwrap();

        let snapshot = harness.snapshot();
        let glen = snapshot.device("Glen").unwrap();
        assert_eq!(glen.fields["headBattery"], 42);
        assert_eq!(harness.changes().len(), 1);

        let service = harness.shutdown().await.unwrap();
        assert_eq!(service.store().len(), 1);
    }
}
