//! Payload decoding. Pure functions, no side effects.

use crate::error::DecodeError;
use crate::models::{DecodedPayload, RawMessage};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Mode de décodage, choisi par route
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodeMode {
    /// Le texte brut devient la valeur du champ `value`
    Text,
    /// JSON strict, objet obligatoire
    #[default]
    Json,
}

pub fn decode(raw: &RawMessage, mode: DecodeMode) -> Result<DecodedPayload, DecodeError> {
    match mode {
        DecodeMode::Text => {
            let text = std::str::from_utf8(&raw.payload).map_err(|_| DecodeError::InvalidUtf8 {
                topic: raw.topic.clone(),
            })?;
            Ok(DecodedPayload::text(text))
        }
        DecodeMode::Json => match serde_json::from_slice::<Value>(&raw.payload) {
            Ok(Value::Object(fields)) => Ok(DecodedPayload::new(fields)),
            Ok(_) => Err(DecodeError::NotAnObject { topic: raw.topic.clone() }),
            Err(e) => Err(DecodeError::InvalidJson {
                topic: raw.topic.clone(),
                reason: e.to_string(),
            }),
        },
    }
}
