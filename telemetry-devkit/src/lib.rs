/*!
# Telemetry DevKit - Outils de test pour le kernel de télémétrie

- Broker MQTT simulé (`MockBroker`) branché sur la couture `BrokerLink`
- Constructeur de payloads de gestes
- Harness qui monte un kernel complet sans réseau
*/

pub mod mqtt_stub;
pub mod test_utils;

pub use mqtt_stub::{topic_matches, GestureMessageBuilder, MockBroker, MockLink};
pub use test_utils::TestHarness;
