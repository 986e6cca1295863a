/**
 * TRANSPORT MQTT - Connexion broker longue durée + abonnements
 *
 * ROLE :
 * - `Connector` : options broker + ensemble d'abonnements (avant connexion)
 * - `Connection` : séquence de `RawMessage` tant que la connexion est ouverte
 * - tâche driver : possède la `BrokerLink` (event loop rumqttc), reconnecte avec
 *   backoff exponentiel sans limite de tentatives et ré-émet TOUS les abonnements
 *   actifs après chaque reconnexion
 *
 * LIVRAISON :
 * At-most-once côté consommateur (QoS 0). Les messages perdus pendant une coupure
 * ne sont pas rejoués. Après `close()`, plus aucun message n'est délivré et toute
 * opération renvoie `TransportError::Closed`.
 */

use crate::config::{BrokerConf, ReconnectConf};
use crate::error::TransportError;
use crate::health::HealthTracker;
use crate::models::RawMessage;
use crate::state::OrderedSet;
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MESSAGE_BUFFER: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerOptions {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive: Duration,
}

impl BrokerOptions {
    pub fn from_conf(conf: &BrokerConf) -> Self {
        let client_id = conf.client_id.clone().unwrap_or_else(|| {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            format!("telemetry-kernel-{}", &suffix[..8])
        });
        Self {
            host: conf.host.clone(),
            port: conf.port,
            username: conf.username.clone(),
            password: conf.password.clone(),
            client_id,
            keep_alive: Duration::from_secs(conf.keep_alive_secs.max(5)),
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Backoff exponentiel : initial, x2 à chaque échec, plafonné à max
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
}

impl ReconnectPolicy {
    pub fn from_conf(conf: &ReconnectConf) -> Self {
        Self {
            initial: Duration::from_millis(conf.initial_delay_ms),
            max: Duration::from_millis(conf.max_delay_ms),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.initial
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_conf(&ReconnectConf::default())
    }
}

/// Événement vu par le driver, indépendant de la bibliothèque MQTT
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// CONNACK accepté (connexion initiale ou reconnexion)
    Connected,
    Message { topic: String, payload: Vec<u8> },
    Other,
}

/// Couture entre le driver et le broker réel (rumqttc) ou simulé (devkit)
#[async_trait]
pub trait BrokerLink: Send + 'static {
    /// Prochain événement ; une erreur = coupure, le prochain poll retente la connexion
    async fn poll(&mut self) -> Result<LinkEvent, TransportError>;
    async fn subscribe(&mut self, filter: &str) -> Result<(), TransportError>;
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

pub struct MqttLink {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl MqttLink {
    pub fn new(options: &BrokerOptions) -> Self {
        let mut opts = MqttOptions::new(options.client_id.clone(), options.host.clone(), options.port);
        opts.set_keep_alive(options.keep_alive);
        if let Some(user) = &options.username {
            opts.set_credentials(user.clone(), options.password.clone().unwrap_or_default());
        }
        let (client, eventloop) = AsyncClient::new(opts, 100);
        Self { client, eventloop }
    }
}

#[async_trait]
impl BrokerLink for MqttLink {
    async fn poll(&mut self) -> Result<LinkEvent, TransportError> {
        match self.eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    Ok(LinkEvent::Connected)
                } else {
                    Err(TransportError::Connection(format!("broker refused connection: {:?}", ack.code)))
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) => Ok(LinkEvent::Message {
                topic: p.topic,
                payload: p.payload.to_vec(),
            }),
            Ok(_) => Ok(LinkEvent::Other),
            Err(e) => Err(TransportError::Connection(e.to_string())),
        }
    }

    async fn subscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        // try_subscribe : le driver est aussi celui qui poll l'event loop
        self.client
            .try_subscribe(filter, QoS::AtMostOnce)
            .map_err(|e| TransportError::Subscribe {
                filter: filter.to_string(),
                reason: e.to_string(),
            })
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.client
            .try_disconnect()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        // flush du DISCONNECT ; l'event loop rend une erreur une fois la socket fermée
        let _ = tokio::time::timeout(Duration::from_secs(1), async {
            while self.eventloop.poll().await.is_ok() {}
        })
        .await;
        Ok(())
    }
}

/// Ensemble d'abonnements partagé connector/connection/driver, sans doublon
#[derive(Debug, Clone, Default)]
pub struct SubscriptionSet(OrderedSet<String>);

impl SubscriptionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// true si le filtre est nouveau
    pub fn insert(&self, filter: &str) -> bool {
        self.0.insert(filter.to_string())
    }

    pub fn list(&self) -> Vec<String> {
        self.0.to_vec()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

pub struct Connector {
    options: BrokerOptions,
    policy: ReconnectPolicy,
    health: HealthTracker,
    subscriptions: SubscriptionSet,
}

impl Connector {
    pub fn new(options: BrokerOptions, policy: ReconnectPolicy, health: HealthTracker) -> Self {
        Self {
            options,
            policy,
            health,
            subscriptions: SubscriptionSet::new(),
        }
    }

    /// Idempotent ; renvoie true si le filtre est nouveau
    pub fn subscribe(&self, filter: &str) -> bool {
        self.subscriptions.insert(filter)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.list()
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    /// Connexion au broker MQTT configuré
    pub async fn connect(self) -> Result<Connection, TransportError> {
        let link = MqttLink::new(&self.options);
        self.connect_link(link).await
    }

    /// Connexion sur n'importe quelle `BrokerLink` ; échoue si le premier CONNACK n'arrive pas
    pub async fn connect_link<L: BrokerLink>(self, mut link: L) -> Result<Connection, TransportError> {
        let Connector { options, policy, health, subscriptions } = self;
        health.mark_connecting();

        loop {
            match link.poll().await {
                Ok(LinkEvent::Connected) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!("[mqtt] cannot connect to {}: {e}", options.address());
                    health.mark_disconnected();
                    return Err(e);
                }
            }
        }

        for filter in subscriptions.list() {
            link.subscribe(&filter).await?;
        }
        health.mark_connected();
        info!(
            "[mqtt] connected to {} as {} ({} subscriptions)",
            options.address(),
            options.client_id,
            subscriptions.len()
        );

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (msg_tx, msg_rx) = mpsc::channel(MESSAGE_BUFFER);
        let cancel = CancellationToken::new();

        let driver = Driver {
            subscriptions: subscriptions.clone(),
            commands: cmd_rx,
            messages: msg_tx,
            cancel: cancel.clone(),
            policy,
            health,
        };
        let handle = tokio::spawn(driver.run(link));

        Ok(Connection {
            subscriptions,
            commands: cmd_tx,
            messages: msg_rx,
            cancel,
            driver: Some(handle),
        })
    }
}

enum Command {
    Subscribe(String),
}

struct Driver {
    subscriptions: SubscriptionSet,
    commands: mpsc::UnboundedReceiver<Command>,
    messages: mpsc::Sender<RawMessage>,
    cancel: CancellationToken,
    policy: ReconnectPolicy,
    health: HealthTracker,
}

impl Driver {
    async fn run<L: BrokerLink>(mut self, mut link: L) {
        let mut connected = true;
        let mut attempt: u32 = 0;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(cmd) = self.commands.recv() => match cmd {
                    Command::Subscribe(filter) => {
                        // hors connexion : le filtre est déjà dans l'ensemble, il sera ré-émis
                        if connected {
                            if let Err(e) = link.subscribe(&filter).await {
                                warn!("[mqtt] {e}");
                            }
                        }
                    }
                },
                event = link.poll() => match event {
                    Ok(LinkEvent::Connected) => {
                        let filters = self.subscriptions.list();
                        if !connected {
                            info!("[mqtt] reconnected after {attempt} attempt(s), restoring {} subscriptions", filters.len());
                        }
                        connected = true;
                        attempt = 0;
                        for filter in &filters {
                            if let Err(e) = link.subscribe(filter).await {
                                warn!("[mqtt] {e}");
                            }
                        }
                        self.health.mark_connected();
                    }
                    Ok(LinkEvent::Message { topic, payload }) => {
                        self.health.record_received();
                        if self.messages.send(RawMessage::new(topic, payload)).await.is_err() {
                            debug!("[mqtt] consumer gone, stopping driver");
                            break;
                        }
                    }
                    Ok(LinkEvent::Other) => {}
                    Err(e) => {
                        if connected {
                            warn!("[mqtt] connection lost: {e}");
                            self.health.increment_reconnects();
                        }
                        connected = false;
                        let delay = self.policy.delay(attempt);
                        attempt = attempt.saturating_add(1);
                        debug!("[mqtt] reconnect attempt {attempt} in {delay:?}");
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
            }
        }

        if let Err(e) = link.disconnect().await {
            debug!("[mqtt] disconnect: {e}");
        }
        self.health.mark_closed();
        info!("[mqtt] driver stopped");
    }
}

/// Permet de fermer la connexion depuis une autre tâche
#[derive(Debug, Clone)]
pub struct CloseHandle(CancellationToken);

impl CloseHandle {
    pub fn close(&self) {
        self.0.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_cancelled()
    }

    pub async fn closed(&self) {
        self.0.cancelled().await
    }
}

pub struct Connection {
    subscriptions: SubscriptionSet,
    commands: mpsc::UnboundedSender<Command>,
    messages: mpsc::Receiver<RawMessage>,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
}

impl Connection {
    /// Idempotent ; renvoie true si le filtre est nouveau
    pub fn subscribe(&self, filter: &str) -> Result<bool, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if !self.subscriptions.insert(filter) {
            return Ok(false);
        }
        self.commands
            .send(Command::Subscribe(filter.to_string()))
            .map_err(|_| TransportError::Closed)?;
        Ok(true)
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.list()
    }

    /// Prochain message ; `Closed` une fois la connexion fermée (séquence non redémarrable)
    pub async fn next_message(&mut self) -> Result<RawMessage, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(TransportError::Closed),
            msg = self.messages.recv() => msg.ok_or(TransportError::Closed),
        }
    }

    pub fn close_handle(&self) -> CloseHandle {
        CloseHandle(self.cancel.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Ferme la connexion et attend l'arrêt du driver
    pub async fn close(&mut self) -> Result<(), TransportError> {
        let Some(driver) = self.driver.take() else {
            return Err(TransportError::Closed);
        };
        self.cancel.cancel();
        self.messages.close();
        if let Err(e) = driver.await {
            warn!("[mqtt] driver task failed: {e}");
        }
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{new_state, Shared};

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(5),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(4), Duration::from_secs(5));
        assert_eq!(policy.delay(200), Duration::from_secs(5));
    }

    #[test]
    fn subscription_set_is_idempotent() {
        let set = SubscriptionSet::new();
        assert!(set.insert("ns/Glen"));
        assert!(!set.insert("ns/Glen"));
        assert!(set.insert("ns/+"));
        assert_eq!(set.list(), vec!["ns/Glen".to_string(), "ns/+".to_string()]);
    }

    #[test]
    fn broker_options_generate_client_id() {
        let conf = BrokerConf {
            host: "localhost".into(),
            port: 1883,
            username: None,
            password: None,
            client_id: None,
            keep_alive_secs: 1,
        };
        let opts = BrokerOptions::from_conf(&conf);
        assert!(opts.client_id.starts_with("telemetry-kernel-"));
        assert_eq!(opts.keep_alive, Duration::from_secs(5));
        assert_eq!(opts.address(), "localhost:1883");
    }

    /// Link scriptée : une liste d'événements puis attente infinie
    struct ScriptedLink {
        events: std::collections::VecDeque<Result<LinkEvent, TransportError>>,
        subscribed: Shared<Vec<String>>,
    }

    #[async_trait]
    impl BrokerLink for ScriptedLink {
        async fn poll(&mut self) -> Result<LinkEvent, TransportError> {
            match self.events.pop_front() {
                Some(ev) => ev,
                None => std::future::pending().await,
            }
        }

        async fn subscribe(&mut self, filter: &str) -> Result<(), TransportError> {
            self.subscribed.lock().push(filter.to_string());
            Ok(())
        }

        async fn disconnect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn connector() -> Connector {
        let options = BrokerOptions::from_conf(&crate::config::KernelConfig::default().broker);
        Connector::new(options, ReconnectPolicy::default(), HealthTracker::new())
    }

    #[tokio::test]
    async fn refused_connect_is_connection_error() {
        let link = ScriptedLink {
            events: [Err(TransportError::Connection("not authorized".into()))].into(),
            subscribed: new_state(Vec::new()),
        };
        let result = connector().connect_link(link).await;
        assert!(matches!(result, Err(TransportError::Connection(_))));
    }

    #[tokio::test]
    async fn subscriptions_are_sent_once_after_connack() {
        let subscribed = new_state(Vec::new());
        let link = ScriptedLink {
            events: [
                Ok(LinkEvent::Other),
                Ok(LinkEvent::Connected),
                Ok(LinkEvent::Message { topic: "ns/Glen".into(), payload: b"{}".to_vec() }),
            ]
            .into(),
            subscribed: subscribed.clone(),
        };
        let connector = connector();
        assert!(connector.subscribe("ns/Glen"));
        assert!(!connector.subscribe("ns/Glen"));

        let mut conn = connector.connect_link(link).await.unwrap();
        let msg = conn.next_message().await.unwrap();
        assert_eq!(msg.topic, "ns/Glen");
        assert_eq!(*subscribed.lock(), vec!["ns/Glen".to_string()]);

        conn.close().await.unwrap();
        assert!(matches!(conn.next_message().await, Err(TransportError::Closed)));
        assert!(matches!(conn.subscribe("ns/Sean"), Err(TransportError::Closed)));
        assert!(matches!(conn.close().await, Err(TransportError::Closed)));
    }
}
