/**
 * SNAPSHOT PUBLISHER - Seul chemin de lecture pour la couche de rendu
 *
 * CONTRAT DE LIVRAISON :
 * - chaque `apply_update` réussi et chaque passage offline => un `StateChange`
 *   (device_id + nature du changement + snapshot complet immuable)
 * - livraison synchrone, sur la tâche d'ingestion, dans l'ordre de réception
 *   pour un même device ; pas d'ordre garanti entre devices différents
 * - les listeners sont appelés HORS du verrou : ils peuvent relire le snapshot,
 *   s'abonner ou se désabonner (effectif à la notification suivante)
 * - un listener qui panique est loggé puis ignoré ; les autres sont notifiés
 */

use crate::models::{ChangeKind, Snapshot, StateChange};
use crate::state::{new_state, Shared};
use parking_lot::RwLock;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::error;

pub type Listener = Arc<dyn Fn(&StateChange) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

pub struct SnapshotPublisher {
    listeners: Shared<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
    latest: RwLock<Arc<Snapshot>>,
    staleness: std::time::Duration,
    watch_tx: watch::Sender<Arc<Snapshot>>,
}

impl SnapshotPublisher {
    pub fn new(staleness: std::time::Duration) -> Self {
        let initial = Arc::new(Snapshot::empty(OffsetDateTime::now_utc()));
        let (watch_tx, _) = watch::channel(initial.clone());
        Self {
            listeners: new_state(Vec::new()),
            next_id: AtomicU64::new(1),
            latest: RwLock::new(initial),
            staleness,
            watch_tx,
        }
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Receiver async : reçoit chaque nouveau snapshot publié
    pub fn watch(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.watch_tx.subscribe()
    }

    /// Snapshot courant, liveness recalculée maintenant
    pub fn get_snapshot(&self) -> Arc<Snapshot> {
        self.snapshot_at(OffsetDateTime::now_utc())
    }

    pub fn snapshot_at(&self, now: OffsetDateTime) -> Arc<Snapshot> {
        let latest = self.latest.read().clone();
        let stale = latest.devices.values().any(|d| d.online != self.is_fresh(d.last_seen_at, now));
        if !stale {
            return latest;
        }

        let mut copy = (*latest).clone();
        copy.taken_at = now;
        for device in copy.devices.values_mut() {
            device.online = self.is_fresh(device.last_seen_at, now);
        }
        Arc::new(copy)
    }

    fn is_fresh(&self, last_seen: Option<OffsetDateTime>, now: OffsetDateTime) -> bool {
        last_seen.is_some_and(|seen| now - seen < self.staleness)
    }

    /// Remplace le snapshot courant sans notifier (état initial, reset)
    pub fn replace(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        *self.latest.write() = snapshot.clone();
        self.watch_tx.send_replace(snapshot.clone());
        snapshot
    }

    /// Publie un nouveau snapshot puis notifie chaque listener pour chaque changement
    pub fn publish(&self, snapshot: Snapshot, changes: Vec<(String, ChangeKind)>) {
        let snapshot = self.replace(snapshot);

        // copie des listeners : aucun verrou tenu pendant les callbacks
        let listeners: Vec<(ListenerId, Listener)> = self.listeners.lock().clone();

        for (device_id, kind) in changes {
            let change = StateChange {
                device_id,
                kind,
                snapshot: snapshot.clone(),
            };
            for (id, listener) in &listeners {
                if catch_unwind(AssertUnwindSafe(|| listener(&change))).is_err() {
                    error!(
                        "[publisher] listener {:?} panicked on change for {}",
                        id, change.device_id
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DeviceState;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use time::macros::datetime;

    const T0: OffsetDateTime = datetime!(2024-03-01 10:00:00 UTC);

    fn snapshot_with(device: &str, version: u64) -> Snapshot {
        let mut state = DeviceState::new(device);
        state.online = true;
        state.last_seen_at = Some(T0);
        let mut snap = Snapshot::empty(T0);
        snap.version = version;
        snap.devices.insert(device.to_string(), state);
        snap
    }

    fn updated(device: &str) -> Vec<(String, ChangeKind)> {
        vec![(
            device.to_string(),
            ChangeKind::Updated { channel: "head".into(), fields: vec!["head".into()] },
        )]
    }

    #[test]
    fn listeners_receive_changes_with_snapshot() {
        let publisher = SnapshotPublisher::new(Duration::from_secs(30));
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        publisher.subscribe(move |change: &StateChange| {
            sink.lock().push((change.device_id.clone(), change.snapshot.version));
        });

        publisher.publish(snapshot_with("Glen", 1), updated("Glen"));
        publisher.publish(snapshot_with("Glen", 2), updated("Glen"));

        assert_eq!(*seen.lock(), vec![("Glen".to_string(), 1), ("Glen".to_string(), 2)]);
        assert_eq!(publisher.snapshot_at(T0).version, 2);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let publisher = SnapshotPublisher::new(Duration::from_secs(30));
        let count = Arc::new(AtomicUsize::new(0));
        publisher.subscribe(|_: &StateChange| panic!("renderer blew up"));
        let counter = count.clone();
        publisher.subscribe(move |_: &StateChange| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        publisher.publish(snapshot_with("Glen", 1), updated("Glen"));
        publisher.publish(snapshot_with("Glen", 2), updated("Glen"));

        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(publisher.snapshot_at(T0).device("Glen").is_some());
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let publisher = SnapshotPublisher::new(Duration::from_secs(30));
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let id = publisher.subscribe(move |_: &StateChange| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        publisher.publish(snapshot_with("Glen", 1), updated("Glen"));
        assert!(publisher.unsubscribe(id));
        assert!(!publisher.unsubscribe(id));
        publisher.publish(snapshot_with("Glen", 2), updated("Glen"));

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.listener_count(), 0);
    }

    #[test]
    fn listener_may_read_back_the_publisher() {
        let publisher = Arc::new(SnapshotPublisher::new(Duration::from_secs(30)));
        let inner = publisher.clone();
        let observed = Arc::new(AtomicU64::new(0));
        let sink = observed.clone();
        publisher.subscribe(move |_: &StateChange| {
            sink.store(inner.snapshot_at(T0).version, Ordering::SeqCst);
            inner.listener_count();
        });

        publisher.publish(snapshot_with("Glen", 7), updated("Glen"));
        assert_eq!(observed.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn snapshot_liveness_is_derived_at_read_time() {
        let publisher = SnapshotPublisher::new(Duration::from_secs(30));
        publisher.publish(snapshot_with("Glen", 1), Vec::new());

        let early = publisher.snapshot_at(T0 + time::Duration::seconds(10));
        assert!(early.device("Glen").unwrap().online);
        let late = publisher.snapshot_at(T0 + time::Duration::seconds(31));
        assert!(!late.device("Glen").unwrap().online);
        // le snapshot publié n'est pas modifié
        assert!(publisher.snapshot_at(T0).device("Glen").unwrap().online);
    }

    #[tokio::test]
    async fn watch_receivers_see_new_snapshots() {
        let publisher = SnapshotPublisher::new(Duration::from_secs(30));
        let mut rx = publisher.watch();
        publisher.publish(snapshot_with("Glen", 3), updated("Glen"));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().version, 3);
    }
}
