/**
 * TELEMETRY PROBE - Publie des payloads de test sur un broker MQTT
 *
 * Exemples :
 *   telemetry-probe gesture Glen --shown SHAKE --battery 10
 *   telemetry-probe gesture Glen --hand --shown RAISE
 *   telemetry-probe raw notes/Sean "hello"
 *
 * Broker et identifiants : flags ou TELEMETRY_MQTT_* (.env pris en compte).
 */

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::{Map, Value};
use tokio::time::{timeout, Duration};
use tracing::{debug, info};

const GESTURE_BASE_TOPIC: &str = "Group_12/LSTM/predict";

/// Publie un message de test vers le kernel de télémétrie.
#[derive(Parser, Debug)]
#[command(name = "telemetry-probe", version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    broker: BrokerArgs,
}

#[derive(clap::Args, Debug)]
struct BrokerArgs {
    #[arg(long, env = "TELEMETRY_MQTT_HOST", default_value = "test.mosquitto.org")]
    host: String,

    #[arg(long, env = "TELEMETRY_MQTT_PORT", default_value_t = 1883)]
    port: u16,

    #[arg(long, env = "TELEMETRY_MQTT_USER")]
    username: Option<String>,

    #[arg(long, env = "TELEMETRY_MQTT_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Délai max pour l'accusé de réception du broker (secondes)
    #[arg(long, default_value_t = 10)]
    timeout: u64,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Payload de geste JSON ; seuls les champs fournis sont envoyés
    Gesture {
        /// Utilisateur (dernier niveau du topic)
        user: String,
        /// Capteur main (`<user>_hand`) au lieu de la tête
        #[arg(long)]
        hand: bool,
        #[arg(long)]
        prediction: Option<String>,
        #[arg(long)]
        shown: Option<String>,
        #[arg(long)]
        battery: Option<u8>,
        /// Préfixe du topic
        #[arg(long, default_value = GESTURE_BASE_TOPIC)]
        base_topic: String,
    },
    /// Texte brut sur un topic quelconque
    Raw { topic: String, payload: String },
}

fn gesture_payload(prediction: Option<String>, shown: Option<String>, battery: Option<u8>) -> Value {
    let mut fields = Map::new();
    if let Some(p) = prediction {
        fields.insert("Prediction".into(), Value::String(p));
    }
    if let Some(s) = shown {
        fields.insert("Shown".into(), Value::String(s));
    }
    if let Some(b) = battery {
        fields.insert("batterylife".into(), Value::from(b));
    }
    Value::Object(fields)
}

fn resolve(command: Command) -> Result<(String, Vec<u8>)> {
    match command {
        Command::Gesture { user, hand, prediction, shown, battery, base_topic } => {
            if prediction.is_none() && shown.is_none() && battery.is_none() {
                bail!("gesture needs at least one of --prediction, --shown, --battery");
            }
            let suffix = if hand { "_hand" } else { "" };
            let topic = format!("{base_topic}/{user}{suffix}");
            let payload = gesture_payload(prediction, shown, battery);
            Ok((topic, serde_json::to_vec(&payload)?))
        }
        Command::Raw { topic, payload } => Ok((topic, payload.into_bytes())),
    }
}

async fn wait_puback(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        match eventloop.poll().await? {
            Event::Incoming(Packet::PubAck(_)) => return Ok(()),
            event => debug!("[probe] {event:?}"),
        }
    }
}

async fn publish(broker: &BrokerArgs, topic: &str, payload: Vec<u8>) -> Result<()> {
    let client_id = format!("telemetry-probe-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
    let mut opts = MqttOptions::new(client_id, broker.host.clone(), broker.port);
    opts.set_keep_alive(Duration::from_secs(10));
    if let Some(user) = &broker.username {
        opts.set_credentials(user.clone(), broker.password.clone().unwrap_or_default());
    }

    let (client, mut eventloop) = AsyncClient::new(opts, 10);
    client.publish(topic, QoS::AtLeastOnce, false, payload).await?;

    let address = format!("{}:{}", broker.host, broker.port);
    timeout(Duration::from_secs(broker.timeout), wait_puback(&mut eventloop))
        .await
        .with_context(|| format!("no PUBACK from {address} after {}s", broker.timeout))?
        .with_context(|| format!("publishing to {address}"))?;

    client.disconnect().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let Args { command, broker } = Args::parse();
    let (topic, payload) = resolve(command)?;

    info!("[probe] {} bytes -> {topic} on {}:{}", payload.len(), broker.host, broker.port);
    publish(&broker, &topic, payload).await?;
    info!("[probe] delivered");
    Ok(())
}
