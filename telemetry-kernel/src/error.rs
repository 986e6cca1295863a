/**
 * ERREURS KERNEL - Taxonomie des erreurs du pipeline d'ingestion
 *
 * ROLE :
 * - TransportError : connexion broker (fatale au connect, retentée ensuite)
 * - DecodeError    : payload illisible (loggé, message ignoré)
 * - ConfigError    : table de routage / fichier invalide (fatale au démarrage)
 *
 * Un topic non routé n'est PAS une erreur : voir `router::RouteResult::NoMatch`.
 */

use thiserror::Error;

/// Erreurs de la couche transport MQTT
#[derive(Debug, Error)]
pub enum TransportError {
    /// Broker injoignable ou authentification refusée
    #[error("connection error: {0}")]
    Connection(String),

    /// Opération sur une connexion déjà fermée
    #[error("connection closed")]
    Closed,

    #[error("subscribe to '{filter}' failed: {reason}")]
    Subscribe { filter: String, reason: String },
}

/// Erreurs de décodage d'un payload (toujours isolées au message)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload on '{topic}' is not valid UTF-8")]
    InvalidUtf8 { topic: String },

    #[error("payload on '{topic}' is not valid JSON: {reason}")]
    InvalidJson { topic: String, reason: String },

    #[error("payload on '{topic}' is JSON but not an object")]
    NotAnObject { topic: String },
}

/// Erreurs de configuration : empêchent le démarrage
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
