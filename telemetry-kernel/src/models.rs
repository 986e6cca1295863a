use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use time::OffsetDateTime;

/// Message brut tel que reçu du broker
#[derive(Debug, Clone, PartialEq)]
pub struct RawMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub received_at: OffsetDateTime,
}

impl RawMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self::received_at(topic, payload, OffsetDateTime::now_utc())
    }

    pub fn received_at(
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        received_at: OffsetDateTime,
    ) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at,
        }
    }
}

/// Payload décodé : clé -> valeur JSON. Jamais partiel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedPayload(Map<String, Value>);

impl DecodedPayload {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Payload texte : la valeur est le texte lui-même, sous la clé `value`
    pub fn text(text: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert(TEXT_KEY.to_string(), Value::String(text.into()));
        Self(fields)
    }

    /// `None` pour une clé absente ou explicitement `null`
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Clé utilisée par le mode de décodage texte
pub const TEXT_KEY: &str = "value";

/// Lecture d'un champ : sentinelle explicite quand rien n'a été reçu
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum FieldReading {
    NothingHeard,
    Heard(Value),
}

impl FieldReading {
    pub fn is_heard(&self) -> bool {
        matches!(self, FieldReading::Heard(_))
    }
}

impl fmt::Display for FieldReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldReading::NothingHeard => write!(f, "nothing heard"),
            FieldReading::Heard(Value::String(s)) => write!(f, "{s}"),
            FieldReading::Heard(v) => write!(f, "{v}"),
        }
    }
}

/// État d'un device logique (une personne équipée de capteurs, un hôte…)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceState {
    pub device_id: String,
    pub online: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen_at: Option<OffsetDateTime>,
    /// Champ cible -> dernière valeur reçue. Les champs jamais reçus sont absents.
    pub fields: BTreeMap<String, Value>,
}

impl DeviceState {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            online: false,
            last_seen_at: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn reading(&self, field: &str) -> FieldReading {
        match self.fields.get(field) {
            Some(v) => FieldReading::Heard(v.clone()),
            None => FieldReading::NothingHeard,
        }
    }
}

/// Vue figée de tous les devices connus
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    /// Incrémentée à chaque mutation du store
    pub version: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub taken_at: OffsetDateTime,
    pub devices: BTreeMap<String, DeviceState>,
}

impl Snapshot {
    pub fn empty(taken_at: OffsetDateTime) -> Self {
        Self {
            version: 0,
            taken_at,
            devices: BTreeMap::new(),
        }
    }

    pub fn device(&self, device_id: &str) -> Option<&DeviceState> {
        self.devices.get(device_id)
    }
}

/// Résultat d'un `apply_update` réussi
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceUpdate {
    pub device_id: String,
    pub channel: String,
    /// Champs cibles effectivement écrits (peut être vide : seul last_seen bouge)
    pub fields: Vec<String>,
    /// true si le device vient d'être créé
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeKind {
    Updated { channel: String, fields: Vec<String> },
    WentOffline,
}

/// Notification envoyée aux listeners du publisher
#[derive(Debug, Clone)]
pub struct StateChange {
    pub device_id: String,
    pub kind: ChangeKind,
    pub snapshot: std::sync::Arc<Snapshot>,
}
