/**
 * SERVICE D'INGESTION - Assemble routeur, décodeur, store et publisher
 *
 * ROLE :
 * Instance explicite (pas d'état global) qui possède le store et consomme une
 * `Connection`. Chaque message est routé, décodé et fusionné entièrement avant
 * le suivant : le store n'a qu'un seul écrivain, aucun verrou nécessaire.
 *
 * FLUX :
 * RawMessage -> TopicRouter (choisit device, channel, mode) -> decode
 *            -> DeviceStateStore::apply_update -> SnapshotPublisher::publish
 *
 * Le sweep de liveness tourne sur la même tâche (tokio::select!), jamais en parallèle.
 */

use crate::config::KernelConfig;
use crate::decoder;
use crate::error::{ConfigError, DecodeError, TransportError};
use crate::health::HealthTracker;
use crate::models::{ChangeKind, DeviceUpdate, RawMessage};
use crate::publisher::SnapshotPublisher;
use crate::router::{RouteResult, TopicRouter};
use crate::store::DeviceStateStore;
use crate::transport::{Connection, Connector};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Interval;
use tracing::{debug, info, warn};

/// Issue du traitement d'un message
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Applied(DeviceUpdate),
    /// Aucun routage : message ignoré (diagnostic uniquement)
    Unrouted,
    DecodeFailed(DecodeError),
    /// Routé vers un channel sans table d'extraction
    Ignored,
}

pub struct IngestionService {
    router: TopicRouter,
    store: DeviceStateStore,
    publisher: Arc<SnapshotPublisher>,
    health: HealthTracker,
    sweep_interval: Option<Duration>,
}

impl IngestionService {
    pub fn from_config(cfg: &KernelConfig, health: HealthTracker) -> Result<Self, ConfigError> {
        let router = TopicRouter::from_rules(&cfg.routes, &cfg.channels)?;
        let staleness = cfg.liveness.staleness();
        info!(
            "[kernel] routing {} rules over {} channels, staleness {}s",
            router.rule_count(),
            cfg.channels.len(),
            staleness.as_secs()
        );
        Ok(Self {
            router,
            store: DeviceStateStore::new(&cfg.channels, staleness),
            publisher: Arc::new(SnapshotPublisher::new(staleness)),
            health,
            sweep_interval: cfg.liveness.sweep_interval(),
        })
    }

    /// Handle à passer à la couche de rendu (seul chemin de lecture)
    pub fn publisher(&self) -> Arc<SnapshotPublisher> {
        self.publisher.clone()
    }

    pub fn store(&self) -> &DeviceStateStore {
        &self.store
    }

    pub fn router(&self) -> &TopicRouter {
        &self.router
    }

    /// Enregistre sur le connector les filtres requis par la table de routage
    pub fn register_subscriptions(&self, connector: &Connector) {
        for filter in self.router.subscription_filters() {
            if connector.subscribe(filter) {
                debug!("[kernel] subscription {filter}");
            }
        }
    }

    pub fn process(&mut self, raw: &RawMessage) -> Outcome {
        let route = match self.router.route(&raw.topic) {
            RouteResult::Matched(route) => route,
            RouteResult::NoMatch => {
                debug!("[router] no rule for topic '{}', message dropped", raw.topic);
                self.health.record_unrouted();
                return Outcome::Unrouted;
            }
        };

        let decoded = match decoder::decode(raw, route.decode) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("[decoder] {e}; message dropped");
                self.health.record_decode_error();
                return Outcome::DecodeFailed(e);
            }
        };

        let now = raw.received_at;
        let Some(update) = self
            .store
            .apply_update(&route.device_id, &route.channel, &decoded, now)
        else {
            return Outcome::Ignored;
        };

        self.health.record_applied();
        debug!(
            "[store] {}/{} <- {:?} (v{})",
            update.device_id,
            update.channel,
            update.fields,
            self.store.version()
        );

        let change = ChangeKind::Updated {
            channel: update.channel.clone(),
            fields: update.fields.clone(),
        };
        self.publisher
            .publish(self.store.snapshot(now), vec![(update.device_id.clone(), change)]);

        Outcome::Applied(update)
    }

    /// Passe offline les devices muets ; notifie `WentOffline` une seule fois par device
    pub fn sweep(&mut self, now: OffsetDateTime) -> Vec<String> {
        let expired = self.store.expire_stale(now);
        if !expired.is_empty() {
            let changes = expired
                .iter()
                .map(|id| (id.clone(), ChangeKind::WentOffline))
                .collect();
            self.publisher.publish(self.store.snapshot(now), changes);
        }
        expired
    }

    pub fn reset(&mut self) {
        self.store.reset();
        self.publisher.replace(self.store.snapshot(OffsetDateTime::now_utc()));
    }

    /// Consomme la connexion jusqu'à sa fermeture
    pub async fn run(&mut self, connection: &mut Connection) -> Result<(), TransportError> {
        let mut sweep = self.sweep_interval.map(tokio::time::interval);
        info!("[kernel] ingestion loop started");

        loop {
            tokio::select! {
                msg = connection.next_message() => match msg {
                    Ok(raw) => {
                        self.process(&raw);
                    }
                    Err(TransportError::Closed) => {
                        info!("[kernel] connection closed, ingestion loop stopped");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                },
                _ = tick(&mut sweep) => {
                    self.sweep(OffsetDateTime::now_utc());
                }
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StateChange;
    use parking_lot::Mutex;
    use serde_json::json;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-03-01 10:00:00 UTC);

    const CONFIG: &str = r#"
broker: {host: localhost, port: 1883}
liveness: {staleness_secs: 30, sweep_interval_secs: 5}
channels:
  head: {fields: {Shown: head, Prediction: headPrediction, batterylife: headBattery}}
  hand: {fields: {Shown: hand, batterylife: handBattery}}
  note: {fields: {value: note}}
routes:
  - {pattern: ns/Glen, device: Glen, channel: head}
  - {pattern: ns/Glen_hand, device: Glen, channel: hand}
  - {pattern: "notes/{device}", channel: note, decode: text}
"#;

    fn service() -> IngestionService {
        let cfg = KernelConfig::from_yaml(CONFIG, "test").unwrap();
        IngestionService::from_config(&cfg, HealthTracker::new()).unwrap()
    }

    fn at(topic: &str, payload: &str, secs: i64) -> RawMessage {
        RawMessage::received_at(topic, payload.as_bytes().to_vec(), T0 + time::Duration::seconds(secs))
    }

    fn record(svc: &IngestionService) -> Arc<Mutex<Vec<StateChange>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = log.clone();
        svc.publisher().subscribe(move |c: &StateChange| sink.lock().push(c.clone()));
        log
    }

    #[test]
    fn head_and_hand_merge_into_one_device() {
        let mut svc = service();
        svc.process(&at("ns/Glen", r#"{"Shown":"SHAKE","batterylife":10}"#, 0));
        svc.process(&at("ns/Glen_hand", r#"{"Shown":"RAISE","batterylife":90}"#, 1));

        let snap = svc.publisher().snapshot_at(T0 + time::Duration::seconds(2));
        let glen = snap.device("Glen").unwrap();
        assert_eq!(glen.fields["head"], json!("SHAKE"));
        assert_eq!(glen.fields["headBattery"], json!(10));
        assert_eq!(glen.fields["hand"], json!("RAISE"));
        assert_eq!(glen.fields["handBattery"], json!(90));
        assert!(glen.online);
        assert_eq!(snap.version, 2);
    }

    #[test]
    fn malformed_json_leaves_snapshot_unchanged() {
        let mut svc = service();
        let log = record(&svc);
        svc.process(&at("ns/Glen", r#"{"Shown":"NOD"}"#, 0));
        let before = svc.publisher().snapshot_at(T0);

        let outcome = svc.process(&at("ns/Glen", "not-json", 1));
        assert!(matches!(outcome, Outcome::DecodeFailed(DecodeError::InvalidJson { .. })));
        assert_eq!(svc.publisher().snapshot_at(T0), before);
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn unknown_topic_creates_nothing_and_notifies_no_one() {
        let mut svc = service();
        let log = record(&svc);
        assert_eq!(svc.process(&at("ns/Unknown", r#"{"Shown":"NOD"}"#, 0)), Outcome::Unrouted);
        assert!(svc.store().is_empty());
        assert!(log.lock().is_empty());
        assert_eq!(svc.health.get_health(0, 0).unrouted_messages, 1);
    }

    #[test]
    fn text_channel_stores_raw_text() {
        let mut svc = service();
        let outcome = svc.process(&at("notes/Sean", "hello there", 0));
        assert!(matches!(outcome, Outcome::Applied(ref u) if u.device_id == "Sean"));
        assert_eq!(svc.store().get("Sean").unwrap().fields["note"], json!("hello there"));
    }

    #[test]
    fn sweep_notifies_went_offline_once() {
        let mut svc = service();
        let log = record(&svc);
        svc.process(&at("ns/Glen", r#"{"Shown":"NOD"}"#, 0));

        assert!(svc.sweep(T0 + time::Duration::seconds(10)).is_empty());
        assert_eq!(svc.sweep(T0 + time::Duration::seconds(45)), vec!["Glen".to_string()]);
        assert!(svc.sweep(T0 + time::Duration::seconds(50)).is_empty());

        let changes = log.lock();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[1].kind, ChangeKind::WentOffline);
        assert!(!changes[1].snapshot.device("Glen").unwrap().online);
    }

    #[test]
    fn subscriptions_follow_routing_table() {
        let svc = service();
        assert_eq!(svc.router().subscription_filters(), ["ns/Glen", "ns/Glen_hand", "notes/+"]);
    }

    #[test]
    fn reset_clears_published_snapshot() {
        let mut svc = service();
        svc.process(&at("ns/Glen", r#"{"Shown":"NOD"}"#, 0));
        svc.reset();
        assert!(svc.publisher().get_snapshot().devices.is_empty());
    }
}
