/**
 * DEVICE STATE STORE - État courant de chaque device, fusion partielle par channel
 *
 * ROLE :
 * Unique propriétaire de la map device_id -> DeviceState. Mutations uniquement via
 * `apply_update` (message reçu) et `expire_stale` (politique de liveness).
 *
 * INVARIANTS :
 * - fusion partielle : seuls les champs de la table d'extraction du channel ET présents
 *   dans le payload sont écrits ; un channel n'écrase jamais les champs d'un autre
 * - un device observé reste adressable jusqu'au `reset` explicite
 * - online <=> now - last_seen_at < staleness
 */

use crate::config::ChannelConf;
use crate::models::{DecodedPayload, DeviceState, DeviceUpdate, Snapshot};
use std::collections::BTreeMap;
use std::time::Duration;
use time::OffsetDateTime;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct DeviceStateStore {
    devices: BTreeMap<String, DeviceState>,
    /// channel -> (clé source, champ cible)
    extraction: BTreeMap<String, Vec<(String, String)>>,
    staleness: Duration,
    version: u64,
}

impl DeviceStateStore {
    pub fn new(channels: &BTreeMap<String, ChannelConf>, staleness: Duration) -> Self {
        let extraction = channels
            .iter()
            .map(|(name, conf)| {
                let fields = conf
                    .fields
                    .iter()
                    .map(|(source, target)| (source.clone(), target.clone()))
                    .collect();
                (name.clone(), fields)
            })
            .collect();

        Self {
            devices: BTreeMap::new(),
            extraction,
            staleness,
            version: 0,
        }
    }

    /// Fusionne un payload décodé dans l'état du device. `None` si le channel est inconnu.
    pub fn apply_update(
        &mut self,
        device_id: &str,
        channel: &str,
        decoded: &DecodedPayload,
        now: OffsetDateTime,
    ) -> Option<DeviceUpdate> {
        let Some(mapping) = self.extraction.get(channel) else {
            debug!("[store] unknown channel '{channel}' for device {device_id}");
            return None;
        };

        let created = !self.devices.contains_key(device_id);
        let state = self
            .devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceState::new(device_id));

        let mut written = Vec::new();
        for (source, target) in mapping {
            if let Some(value) = decoded.get(source) {
                state.fields.insert(target.clone(), value.clone());
                written.push(target.clone());
            }
        }

        state.last_seen_at = Some(now);
        state.online = true;
        self.version += 1;

        if created {
            info!("[store] new device {device_id} (via channel {channel})");
        }

        Some(DeviceUpdate {
            device_id: device_id.to_string(),
            channel: channel.to_string(),
            fields: written,
            created,
        })
    }

    fn is_fresh(&self, state: &DeviceState, now: OffsetDateTime) -> bool {
        match state.last_seen_at {
            Some(seen) => now - seen < self.staleness,
            None => false,
        }
    }

    /// Liveness dérivée à `now`, sans muter le store
    pub fn compute_liveness(&self, now: OffsetDateTime) -> BTreeMap<String, bool> {
        self.devices
            .iter()
            .map(|(id, state)| (id.clone(), self.is_fresh(state, now)))
            .collect()
    }

    /// Passe offline les devices trop vieux ; renvoie ceux qui viennent de basculer
    pub fn expire_stale(&mut self, now: OffsetDateTime) -> Vec<String> {
        let staleness = self.staleness;
        let mut expired = Vec::new();

        for (id, state) in self.devices.iter_mut() {
            let fresh = state.last_seen_at.is_some_and(|seen| now - seen < staleness);
            if state.online && !fresh {
                state.online = false;
                expired.push(id.clone());
            }
        }

        if !expired.is_empty() {
            self.version += 1;
            info!("[store] {} device(s) went offline: {}", expired.len(), expired.join(", "));
        }
        expired
    }

    /// Copie immuable, liveness recalculée à `now`
    pub fn snapshot(&self, now: OffsetDateTime) -> Snapshot {
        let devices = self
            .devices
            .iter()
            .map(|(id, state)| {
                let mut copy = state.clone();
                copy.online = self.is_fresh(state, now);
                (id.clone(), copy)
            })
            .collect();

        Snapshot {
            version: self.version,
            taken_at: now,
            devices,
        }
    }

    pub fn get(&self, device_id: &str) -> Option<&DeviceState> {
        self.devices.get(device_id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn staleness(&self) -> Duration {
        self.staleness
    }

    /// Champs cibles déclarés, tous channels confondus
    pub fn declared_fields(&self) -> Vec<String> {
        let mut fields: Vec<String> = self
            .extraction
            .values()
            .flat_map(|m| m.iter().map(|(_, target)| target.clone()))
            .collect();
        fields.sort();
        fields.dedup();
        fields
    }

    pub fn reset(&mut self) {
        self.devices.clear();
        self.version += 1;
        info!("[store] reset");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldReading;
    use serde_json::{json, Map, Value};
    use time::macros::datetime;

    fn gesture_channels() -> BTreeMap<String, ChannelConf> {
        let channel = |pairs: &[(&str, &str)]| ChannelConf {
            fields: pairs.iter().map(|(s, t)| (s.to_string(), t.to_string())).collect(),
        };
        BTreeMap::from([
            ("head".to_string(), channel(&[("Shown", "head"), ("batterylife", "headBattery")])),
            ("hand".to_string(), channel(&[("Shown", "hand"), ("batterylife", "handBattery")])),
        ])
    }

    fn payload(v: Value) -> DecodedPayload {
        let map: Map<String, Value> = serde_json::from_value(v).unwrap();
        DecodedPayload::new(map)
    }

    fn store() -> DeviceStateStore {
        DeviceStateStore::new(&gesture_channels(), Duration::from_secs(30))
    }

    const T0: OffsetDateTime = datetime!(2024-03-01 10:00:00 UTC);

    #[test]
    fn channels_do_not_clobber_each_other() {
        let mut store = store();
        store.apply_update("Glen", "head", &payload(json!({"Shown":"SHAKE","batterylife":10})), T0);
        store.apply_update("Glen", "hand", &payload(json!({"Shown":"RAISE","batterylife":90})), T0);

        let glen = store.get("Glen").unwrap();
        assert_eq!(
            glen.fields,
            BTreeMap::from([
                ("head".to_string(), json!("SHAKE")),
                ("headBattery".to_string(), json!(10)),
                ("hand".to_string(), json!("RAISE")),
                ("handBattery".to_string(), json!(90)),
            ])
        );
        assert!(glen.online);
        assert_eq!(glen.last_seen_at, Some(T0));
    }

    #[test]
    fn absent_keys_are_not_merged() {
        let mut store = store();
        store.apply_update("Glen", "head", &payload(json!({"Shown":"NOD","batterylife":55})), T0);
        let update = store
            .apply_update("Glen", "head", &payload(json!({"Shown":"IDLE"})), T0)
            .unwrap();

        assert_eq!(update.fields, vec!["head".to_string()]);
        assert!(!update.created);
        let glen = store.get("Glen").unwrap();
        assert_eq!(glen.fields["head"], json!("IDLE"));
        assert_eq!(glen.fields["headBattery"], json!(55));
    }

    #[test]
    fn unmapped_keys_are_ignored() {
        let mut store = store();
        let update = store
            .apply_update("Glen", "head", &payload(json!({"Prediction":"NOD","data":[1,2]})), T0)
            .unwrap();
        assert!(update.fields.is_empty());
        assert!(update.created);
        let glen = store.get("Glen").unwrap();
        assert!(glen.fields.is_empty());
        assert_eq!(glen.reading("head"), FieldReading::NothingHeard);
        assert!(glen.online);
    }

    #[test]
    fn unknown_channel_leaves_store_untouched() {
        let mut store = store();
        assert!(store.apply_update("Glen", "tail", &payload(json!({"Shown":"NOD"})), T0).is_none());
        assert!(store.is_empty());
        assert_eq!(store.version(), 0);
    }

    #[test]
    fn liveness_follows_staleness_threshold() {
        let mut store = store();
        store.apply_update("Glen", "head", &payload(json!({"Shown":"NOD"})), T0);

        let fresh = store.compute_liveness(T0 + time::Duration::seconds(29));
        assert!(fresh["Glen"]);
        let stale = store.compute_liveness(T0 + time::Duration::seconds(30));
        assert!(!stale["Glen"]);

        // compute_liveness est pure
        assert!(store.get("Glen").unwrap().online);
    }

    #[test]
    fn expire_stale_flips_once() {
        let mut store = store();
        store.apply_update("Glen", "head", &payload(json!({"Shown":"NOD"})), T0);
        store.apply_update("Sean", "head", &payload(json!({"Shown":"NOD"})), T0 + time::Duration::seconds(20));

        let later = T0 + time::Duration::seconds(40);
        assert_eq!(store.expire_stale(later), vec!["Glen".to_string()]);
        assert!(store.expire_stale(later).is_empty());
        assert!(!store.get("Glen").unwrap().online);
        assert!(store.get("Sean").unwrap().online);

        // un nouveau message remet le device online
        store.apply_update("Glen", "hand", &payload(json!({"batterylife":3})), later);
        assert!(store.get("Glen").unwrap().online);
    }

    #[test]
    fn snapshot_derives_liveness_and_versions() {
        let mut store = store();
        store.apply_update("Glen", "head", &payload(json!({"Shown":"NOD"})), T0);
        let snap = store.snapshot(T0 + time::Duration::minutes(5));
        assert_eq!(snap.version, 1);
        assert!(!snap.device("Glen").unwrap().online);
        assert!(store.get("Glen").unwrap().online);
    }

    #[test]
    fn declared_fields_are_sorted_and_unique() {
        assert_eq!(store().declared_fields(), ["hand", "handBattery", "head", "headBattery"]);
    }

    #[test]
    fn reset_forgets_devices() {
        let mut store = store();
        store.apply_update("Glen", "head", &payload(json!({"Shown":"NOD"})), T0);
        store.reset();
        assert!(store.is_empty());
        assert_eq!(store.version(), 2);
    }
}
