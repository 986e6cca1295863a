//! Ingestion de télémétrie MQTT et réconciliation de l'état des devices.
//!
//! `Connector` -> `Connection` (transport) -> `IngestionService` (routage, décodage,
//! fusion) -> `SnapshotPublisher` (seul chemin de lecture pour le rendu).

pub mod config;
pub mod decoder;
pub mod error;
pub mod health;
pub mod http;
pub mod models;
pub mod publisher;
pub mod router;
pub mod service;
pub mod state;
pub mod store;
pub mod transport;

pub use error::{ConfigError, DecodeError, TransportError};
pub use models::{DecodedPayload, DeviceState, FieldReading, RawMessage, Snapshot, StateChange};
pub use service::{IngestionService, Outcome};
