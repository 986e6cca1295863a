use crate::decoder::DecodeMode;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct KernelConfig {
    pub broker: BrokerConf,
    #[serde(default)]
    pub reconnect: ReconnectConf,
    #[serde(default)]
    pub liveness: LivenessConf,
    #[serde(default)]
    pub http: Option<HttpConf>,
    /// nom du channel -> table d'extraction
    pub channels: BTreeMap<String, ChannelConf>,
    /// ordre de déclaration significatif pour les patterns
    pub routes: Vec<RouteConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BrokerConf {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ReconnectConf {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LivenessConf {
    /// âge max du dernier message avant de considérer le device offline
    pub staleness_secs: u64,
    /// période du sweep qui publie les passages offline (None = pas de sweep)
    pub sweep_interval_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct HttpConf {
    pub bind: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ChannelConf {
    /// clé du payload -> champ cible dans DeviceState.fields
    pub fields: BTreeMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RouteConf {
    pub pattern: String,
    /// device littéral ; absent => capturé via `{device}` dans le pattern
    pub device: Option<String>,
    pub channel: String,
    #[serde(default)]
    pub decode: DecodeMode,
}

fn default_keep_alive() -> u64 {
    15
}

impl Default for ReconnectConf {
    fn default() -> Self {
        Self { initial_delay_ms: 500, max_delay_ms: 30_000 }
    }
}

impl Default for LivenessConf {
    fn default() -> Self {
        Self { staleness_secs: 30, sweep_interval_secs: Some(5) }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

impl LivenessConf {
    pub fn staleness(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        self.sweep_interval_secs.filter(|s| *s > 0).map(Duration::from_secs)
    }
}

impl Default for KernelConfig {
    /// Topics historiques du projet : `Group_12/LSTM/predict/<user>` (tête)
    /// et `Group_12/LSTM/predict/<user>_hand` (main)
    fn default() -> Self {
        let gesture_channel = |prefix: &str| ChannelConf {
            fields: BTreeMap::from([
                ("Prediction".to_string(), format!("{prefix}Prediction")),
                ("Shown".to_string(), prefix.to_string()),
                ("batterylife".to_string(), format!("{prefix}Battery")),
            ]),
        };

        let mut routes = Vec::new();
        for user in ["Glen", "Sean", "Nicholas"] {
            routes.push(RouteConf {
                pattern: format!("Group_12/LSTM/predict/{user}"),
                device: Some(user.into()),
                channel: "head".into(),
                decode: DecodeMode::Json,
            });
            routes.push(RouteConf {
                pattern: format!("Group_12/LSTM/predict/{user}_hand"),
                device: Some(user.into()),
                channel: "hand".into(),
                decode: DecodeMode::Json,
            });
        }

        Self {
            broker: BrokerConf {
                host: "test.mosquitto.org".into(),
                port: 1883,
                username: None,
                password: None,
                client_id: None,
                keep_alive_secs: default_keep_alive(),
            },
            reconnect: ReconnectConf::default(),
            liveness: LivenessConf::default(),
            http: Some(HttpConf::default()),
            channels: BTreeMap::from([
                ("head".to_string(), gesture_channel("head")),
                ("hand".to_string(), gesture_channel("hand")),
            ]),
            routes,
        }
    }
}

impl KernelConfig {
    pub fn from_yaml(txt: &str, origin: &str) -> Result<Self, ConfigError> {
        let cfg: KernelConfig = serde_yaml::from_str(txt).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Vérifications indépendantes du routage (le routeur valide le reste)
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.host.trim().is_empty() {
            return Err(ConfigError::Invalid("broker.host is empty".into()));
        }
        if self.routes.is_empty() {
            return Err(ConfigError::Invalid("at least one route is required".into()));
        }
        if self.reconnect.initial_delay_ms == 0
            || self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms
        {
            return Err(ConfigError::Invalid(format!(
                "reconnect delays must satisfy 0 < initial ({}) <= max ({})",
                self.reconnect.initial_delay_ms, self.reconnect.max_delay_ms
            )));
        }
        if self.liveness.staleness_secs == 0 {
            return Err(ConfigError::Invalid("liveness.staleness_secs must be > 0".into()));
        }
        if self.broker.password.is_some() && self.broker.username.is_none() {
            return Err(ConfigError::Invalid("broker.password set without broker.username".into()));
        }
        Ok(())
    }

    /// Surcharges via variables d'environnement (.env chargé par le main)
    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("TELEMETRY_MQTT_HOST") {
            self.broker.host = host;
        }
        if let Some(port) = lookup("TELEMETRY_MQTT_PORT") {
            self.broker.port = port.parse().map_err(|_| {
                ConfigError::Invalid(format!("TELEMETRY_MQTT_PORT is not a port: {port}"))
            })?;
        }
        if let Some(user) = lookup("TELEMETRY_MQTT_USER") {
            self.broker.username = Some(user);
        }
        if let Some(pw) = lookup("TELEMETRY_MQTT_PASSWORD") {
            self.broker.password = Some(pw);
        }
        if let Some(bind) = lookup("TELEMETRY_HTTP_BIND") {
            self.http = Some(HttpConf { bind });
        }
        Ok(())
    }
}

pub async fn load_config() -> Result<KernelConfig, ConfigError> {
    let path = std::env::var("TELEMETRY_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = load_config_from(&path).await?;
    cfg.apply_env_overrides()?;
    cfg.validate()?;
    Ok(cfg)
}

pub async fn load_config_from(path: &str) -> Result<KernelConfig, ConfigError> {
    if !Path::new(path).exists() {
        warn!("[config] no {path}, using built-in defaults");
        return Ok(KernelConfig::default());
    }
    let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
        path: path.to_string(),
        source,
    })?;
    if txt.trim().is_empty() {
        warn!("[config] {path} is empty, using built-in defaults");
        return Ok(KernelConfig::default());
    }
    let cfg = KernelConfig::from_yaml(&txt, path)?;
    info!("[config] loaded {path}: {} channels, {} routes", cfg.channels.len(), cfg.routes.len());
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
broker:
  host: broker.local
  port: 1884
  username: demo
  password: secret
channels:
  head:
    fields:
      Shown: head
      batterylife: headBattery
  raw:
    fields:
      value: note
routes:
  - pattern: ns/Glen
    device: Glen
    channel: head
  - pattern: ns/{device}/notes
    channel: raw
    decode: text
"#;

    #[test]
    fn parses_yaml_with_defaults() {
        let cfg = KernelConfig::from_yaml(SAMPLE, "sample").unwrap();
        assert_eq!(cfg.broker.port, 1884);
        assert_eq!(cfg.broker.keep_alive_secs, 15);
        assert_eq!(cfg.reconnect, ReconnectConf::default());
        assert_eq!(cfg.liveness.staleness(), Duration::from_secs(30));
        assert_eq!(cfg.routes[0].decode, DecodeMode::Json);
        assert_eq!(cfg.routes[1].decode, DecodeMode::Text);
        assert_eq!(cfg.routes[1].device, None);
        assert!(cfg.http.is_none());
    }

    #[test]
    fn rejects_garbage_yaml() {
        let err = KernelConfig::from_yaml("broker: [", "broken.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn rejects_missing_routes() {
        let txt = "broker: {host: h, port: 1883}\nchannels: {}\nroutes: []\n";
        let err = KernelConfig::from_yaml(txt, "t").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn env_overrides_apply() {
        let mut cfg = KernelConfig::default();
        let env: HashMap<&str, &str> = HashMap::from([
            ("TELEMETRY_MQTT_HOST", "10.0.0.2"),
            ("TELEMETRY_MQTT_PORT", "8883"),
            ("TELEMETRY_MQTT_USER", "ec2-user"),
            ("TELEMETRY_MQTT_PASSWORD", "pw"),
        ]);
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(cfg.broker.host, "10.0.0.2");
        assert_eq!(cfg.broker.port, 8883);
        assert_eq!(cfg.broker.username.as_deref(), Some("ec2-user"));
        assert_eq!(cfg.broker.password.as_deref(), Some("pw"));
    }

    #[test]
    fn bad_port_override_is_config_error() {
        let mut cfg = KernelConfig::default();
        let err = cfg
            .apply_overrides(|k| (k == "TELEMETRY_MQTT_PORT").then(|| "abc".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = KernelConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.routes.len(), 6);
        assert_eq!(cfg.channels["hand"].fields["batterylife"], "handBattery");
    }

    #[tokio::test]
    async fn missing_file_falls_back_to_defaults() {
        let cfg = load_config_from("/definitely/not/here/kernel.yaml").await.unwrap();
        assert_eq!(cfg, KernelConfig::default());
    }
}
