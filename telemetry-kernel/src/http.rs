/**
 * API REST - Lecture seule de l'état des devices
 *
 * ROLE :
 * Couche de rendu minimale branchée sur le `SnapshotPublisher` : elle ne touche
 * jamais le store, elle lit uniquement des snapshots immuables.
 *
 * ROUTES :
 * - GET /health            : "ok"
 * - GET /system/health     : compteurs MQTT / ingestion (KernelHealth)
 * - GET /devices           : liste des devices connus
 * - GET /devices/{id}      : détail, 404 si jamais observé
 *
 * Chaque champ déclaré apparaît dans la vue, avec la sentinelle
 * `nothing_heard` s'il n'a jamais été reçu (distinct de 0 ou "").
 */

use crate::health::{HealthTracker, KernelHealth};
use crate::models::{DeviceState, FieldReading};
use crate::publisher::SnapshotPublisher;
use crate::transport::CloseHandle;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::info;

#[derive(Debug, Serialize)]
pub struct DeviceView {
    pub device_id: String,
    pub online: bool,
    pub last_seen: Option<String>, // RFC3339
    pub stale_for_seconds: Option<i64>,
    pub fields: BTreeMap<String, FieldReading>,
}

fn to_view(d: &DeviceState, declared: &[String], now: OffsetDateTime) -> DeviceView {
    let mut fields: BTreeMap<String, FieldReading> =
        declared.iter().map(|f| (f.clone(), d.reading(f))).collect();
    for (name, value) in &d.fields {
        fields.insert(name.clone(), FieldReading::Heard(value.clone()));
    }

    DeviceView {
        device_id: d.device_id.clone(),
        online: d.online,
        last_seen: d.last_seen_at.and_then(|t| t.format(&Rfc3339).ok()),
        stale_for_seconds: d.last_seen_at.map(|t| (now - t).whole_seconds().max(0)),
        fields,
    }
}

#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<SnapshotPublisher>,
    pub health: HealthTracker,
    pub declared_fields: Arc<Vec<String>>,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/devices", get(get_devices))
        .route("/devices/{id}", get(get_device))
        .with_state(app_state)
}

/// Sert l'API jusqu'à la fermeture de la connexion MQTT
pub async fn serve(bind: &str, app_state: AppState, close: CloseHandle) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!("[http] listening on http://{bind}");
    axum::serve(listener, build_router(app_state))
        .with_graceful_shutdown(async move { close.closed().await })
        .await?;
    Ok(())
}

// GET /devices (liste)
async fn get_devices(State(app): State<AppState>) -> Json<Vec<DeviceView>> {
    let snapshot = app.publisher.get_snapshot();
    let now = OffsetDateTime::now_utc();
    let list = snapshot
        .devices
        .values()
        .map(|d| to_view(d, &app.declared_fields, now))
        .collect();
    Json(list)
}

// GET /devices/{id} (détail)
async fn get_device(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<DeviceView>, StatusCode> {
    let snapshot = app.publisher.get_snapshot();
    let Some(d) = snapshot.device(&id) else {
        return Err(StatusCode::NOT_FOUND);
    };
    Ok(Json(to_view(d, &app.declared_fields, OffsetDateTime::now_utc())))
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    let snapshot = app.publisher.get_snapshot();
    let online = snapshot.devices.values().filter(|d| d.online).count();
    Json(app.health.get_health(snapshot.devices.len(), online))
}
