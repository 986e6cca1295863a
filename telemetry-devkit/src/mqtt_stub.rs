/*!
Broker MQTT simulé pour tester le kernel sans mosquitto

`MockBroker` joue le rôle du broker, `MockLink` celui de l'event loop rumqttc :
il implémente `BrokerLink` et se branche sur `Connector::connect_link`.

Comportement calqué sur un broker réel en session propre (clean session) :
- un message n'est délivré que si un abonnement actif le couvre (`+`, `#`)
- une coupure efface les abonnements, le client doit les ré-émettre
- les messages publiés pendant une coupure sont perdus
*/

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use telemetry_kernel::error::TransportError;
use telemetry_kernel::transport::{BrokerLink, LinkEvent};
use tokio::sync::mpsc;
use tracing::{debug, info};

type LinkItem = Result<LinkEvent, TransportError>;

#[derive(Default)]
struct BrokerInner {
    connected: bool,
    /// abonnements actifs de la session courante
    active: Vec<String>,
    /// chaque SUBSCRIBE reçu, dans l'ordre, sessions comprises
    subscribe_log: Vec<String>,
    delivered: usize,
    dropped: usize,
    disconnects: usize,
    refuse_reason: Option<String>,
    link_tx: Option<mpsc::UnboundedSender<LinkItem>>,
}

impl BrokerInner {
    fn push(&self, item: LinkItem) {
        if let Some(tx) = &self.link_tx {
            let _ = tx.send(item);
        }
    }
}

#[derive(Clone, Default)]
pub struct MockBroker {
    inner: Arc<Mutex<BrokerInner>>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Les prochaines connexions seront refusées (CONNACK négatif)
    pub fn refuse_connections(&self, reason: &str) {
        self.inner.lock().refuse_reason = Some(reason.to_string());
    }

    /// Crée la link côté client ; le CONNACK (ou le refus) est déjà en file
    pub fn link(&self) -> MockLink {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        match &inner.refuse_reason {
            Some(reason) => {
                let _ = tx.send(Err(TransportError::Connection(reason.clone())));
            }
            None => {
                inner.connected = true;
                inner.active.clear();
                let _ = tx.send(Ok(LinkEvent::Connected));
            }
        }
        inner.link_tx = Some(tx);
        MockLink {
            broker: self.clone(),
            events: rx,
        }
    }

    /// Publie sur le broker ; true si au moins un abonnement actif couvre le topic
    pub fn simulate_incoming(&self, topic: &str, payload: impl Into<Vec<u8>>) -> bool {
        let mut inner = self.inner.lock();
        let covered = inner.connected && inner.active.iter().any(|f| topic_matches(f, topic));
        if !covered {
            inner.dropped += 1;
            debug!("[mock-broker] {topic}: no active subscription, dropped");
            return false;
        }
        inner.delivered += 1;
        inner.push(Ok(LinkEvent::Message {
            topic: topic.to_string(),
            payload: payload.into(),
        }));
        true
    }

    pub fn simulate_json(&self, topic: &str, payload: &Value) -> bool {
        self.simulate_incoming(topic, payload.to_string())
    }

    /// Coupe la connexion : abonnements perdus, le client voit une erreur
    pub fn simulate_disconnect(&self) {
        let mut inner = self.inner.lock();
        inner.connected = false;
        inner.active.clear();
        inner.push(Err(TransportError::Connection("connection reset by broker".into())));
        info!("[mock-broker] connection dropped");
    }

    /// Accepte à nouveau le client : un nouveau CONNACK lui est envoyé
    pub fn simulate_reconnect(&self) {
        let mut inner = self.inner.lock();
        inner.connected = true;
        inner.active.clear();
        inner.push(Ok(LinkEvent::Connected));
        info!("[mock-broker] client reconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().connected
    }

    pub fn get_subscriptions(&self) -> Vec<String> {
        self.inner.lock().active.clone()
    }

    /// Nombre de SUBSCRIBE reçus pour ce filtre, toutes sessions confondues
    pub fn subscribe_count(&self, filter: &str) -> usize {
        self.inner.lock().subscribe_log.iter().filter(|f| *f == filter).count()
    }

    pub fn delivered(&self) -> usize {
        self.inner.lock().delivered
    }

    pub fn dropped(&self) -> usize {
        self.inner.lock().dropped
    }

    pub fn disconnects(&self) -> usize {
        self.inner.lock().disconnects
    }

    /// Attend qu'un filtre soit actif dans la session courante
    pub async fn wait_for_subscription(&self, filter: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.inner.lock().active.iter().any(|f| f == filter) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }
}

pub struct MockLink {
    broker: MockBroker,
    events: mpsc::UnboundedReceiver<LinkItem>,
}

#[async_trait::async_trait]
impl BrokerLink for MockLink {
    async fn poll(&mut self) -> Result<LinkEvent, TransportError> {
        match self.events.recv().await {
            Some(item) => item,
            None => std::future::pending().await,
        }
    }

    async fn subscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        let mut inner = self.broker.inner.lock();
        if !inner.connected {
            return Err(TransportError::Subscribe {
                filter: filter.to_string(),
                reason: "not connected".into(),
            });
        }
        inner.subscribe_log.push(filter.to_string());
        if !inner.active.iter().any(|f| f == filter) {
            inner.active.push(filter.to_string());
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let mut inner = self.broker.inner.lock();
        inner.connected = false;
        inner.active.clear();
        inner.disconnects += 1;
        Ok(())
    }
}

/// Correspondance filtre MQTT / topic (`+` un niveau, `#` le reste)
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut levels = topic.split('/');
    for part in filter.split('/') {
        match part {
            "#" => return true,
            "+" => {
                if levels.next().is_none() {
                    return false;
                }
            }
            literal => {
                if levels.next() != Some(literal) {
                    return false;
                }
            }
        }
    }
    levels.next().is_none()
}

/// Payloads au format des capteurs de gestes (tête `<user>`, main `<user>_hand`)
pub struct GestureMessageBuilder {
    base_topic: String,
}

impl GestureMessageBuilder {
    pub fn new<S: Into<String>>(base_topic: S) -> Self {
        Self {
            base_topic: base_topic.into(),
        }
    }

    pub fn head_topic(&self, user: &str) -> String {
        format!("{}/{}", self.base_topic, user)
    }

    pub fn hand_topic(&self, user: &str) -> String {
        format!("{}/{}_hand", self.base_topic, user)
    }

    pub fn gesture(prediction: &str, shown: &str, battery: u8) -> Value {
        json!({
            "Prediction": prediction,
            "Shown": shown,
            "batterylife": battery,
        })
    }

    /// Payload ne portant que l'état de batterie
    pub fn battery_only(battery: u8) -> Value {
        json!({ "batterylife": battery })
    }
}

impl Default for GestureMessageBuilder {
    fn default() -> Self {
        Self::new("Group_12/LSTM/predict")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matching() {
        assert!(topic_matches("ns/+", "ns/Glen"));
        assert!(!topic_matches("ns/+", "ns/Glen/extra"));
        assert!(topic_matches("ns/#", "ns/Glen/extra"));
        assert!(topic_matches("ns/Glen", "ns/Glen"));
        assert!(!topic_matches("ns/Glen", "ns/Glen_hand"));
        assert!(!topic_matches("ns/Glen/x", "ns/Glen"));
    }

    #[tokio::test]
    async fn messages_need_an_active_subscription() {
        let broker = MockBroker::new();
        let mut link = broker.link();
        assert_eq!(link.poll().await.unwrap(), LinkEvent::Connected);

        assert!(!broker.simulate_incoming("ns/Glen", "x"));
        link.subscribe("ns/+").await.unwrap();
        assert!(broker.simulate_incoming("ns/Glen", "x"));
        assert!(matches!(link.poll().await, Ok(LinkEvent::Message { .. })));

        broker.simulate_disconnect();
        assert!(broker.get_subscriptions().is_empty());
        assert!(link.poll().await.is_err());
        assert!(!broker.simulate_incoming("ns/Glen", "x"));
        assert_eq!(broker.dropped(), 2);
    }

    #[tokio::test]
    async fn refused_connection_surfaces_as_error() {
        let broker = MockBroker::new();
        broker.refuse_connections("bad credentials");
        let mut link = broker.link();
        assert!(matches!(link.poll().await, Err(TransportError::Connection(_))));
        assert!(!broker.is_connected());
    }

    #[test]
    fn gesture_builder_topics() {
        let builder = GestureMessageBuilder::default();
        assert_eq!(builder.hand_topic("Glen"), "Group_12/LSTM/predict/Glen_hand");
        let payload = GestureMessageBuilder::gesture("NOD", "SHAKE", 10);
        assert_eq!(payload["Shown"], "SHAKE");
        assert_eq!(payload["batterylife"], 10);
    }
}
