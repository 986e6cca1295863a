use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub devices_tracked: u32,
    pub devices_online: u32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u64,
    pub messages_received: u64,
    pub messages_applied: u64,
    pub decode_errors: u64,
    pub unrouted_messages: u64,
}

#[derive(Default)]
struct Counters {
    reconnects: AtomicU64,
    received: AtomicU64,
    applied: AtomicU64,
    decode_errors: AtomicU64,
    unrouted: AtomicU64,
}

/// Compteurs partagés entre le driver MQTT, le service d'ingestion et l'API HTTP
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    counters: Arc<Counters>,
    mqtt_status: Arc<parking_lot::Mutex<String>>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            counters: Arc::new(Counters::default()),
            mqtt_status: Arc::new(parking_lot::Mutex::new("idle".to_string())),
        }
    }

    fn set_status(&self, status: &str) {
        *self.mqtt_status.lock() = status.to_string();
    }

    pub fn mark_connecting(&self) {
        self.set_status("connecting");
    }

    pub fn mark_connected(&self) {
        self.set_status("connected");
    }

    pub fn mark_disconnected(&self) {
        self.set_status("disconnected");
    }

    pub fn mark_closed(&self) {
        self.set_status("closed");
    }

    pub fn increment_reconnects(&self) {
        self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
        self.set_status("reconnecting");
    }

    pub fn record_received(&self) {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_applied(&self) {
        self.counters.applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unrouted(&self) {
        self.counters.unrouted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_status(&self) -> String {
        self.mqtt_status.lock().clone()
    }

    pub fn reconnects(&self) -> u64 {
        self.counters.reconnects.load(Ordering::Relaxed)
    }

    pub fn get_health(&self, devices_tracked: usize, devices_online: usize) -> KernelHealth {
        let c = &self.counters;
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            devices_tracked: devices_tracked as u32,
            devices_online: devices_online as u32,
            mqtt_status: self.mqtt_status(),
            mqtt_reconnects: c.reconnects.load(Ordering::Relaxed),
            messages_received: c.received.load(Ordering::Relaxed),
            messages_applied: c.applied.load(Ordering::Relaxed),
            decode_errors: c.decode_errors.load(Ordering::Relaxed),
            unrouted_messages: c.unrouted.load(Ordering::Relaxed),
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}
