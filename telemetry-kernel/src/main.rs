/**
 * TELEMETRY KERNEL - Point d'entrée
 *
 * RÔLE : config -> routage -> connexion MQTT -> boucle d'ingestion + API HTTP.
 * Une config de routage invalide ou un broker injoignable au démarrage = sortie non nulle.
 * Ctrl-C ferme la connexion ; la boucle d'ingestion et le serveur HTTP s'arrêtent avec elle.
 */

use anyhow::Context;
use std::sync::Arc;
use telemetry_kernel::config::load_config;
use telemetry_kernel::health::HealthTracker;
use telemetry_kernel::http::{self, AppState};
use telemetry_kernel::service::IngestionService;
use telemetry_kernel::transport::{BrokerOptions, Connector, ReconnectPolicy};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("telemetry_kernel=info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env optionnel
    dotenvy::dotenv().ok();
    init_tracing();

    let cfg = load_config().await.context("loading kernel configuration")?;
    let health = HealthTracker::new();
    let mut service =
        IngestionService::from_config(&cfg, health.clone()).context("building routing table")?;

    let connector = Connector::new(
        BrokerOptions::from_conf(&cfg.broker),
        ReconnectPolicy::from_conf(&cfg.reconnect),
        health.clone(),
    );
    service.register_subscriptions(&connector);
    let address = connector.options().address();

    let mut connection = connector
        .connect()
        .await
        .with_context(|| format!("connecting to MQTT broker {address}"))?;
    let close = connection.close_handle();

    if let Some(http_conf) = cfg.http.clone() {
        let app_state = AppState {
            publisher: service.publisher(),
            health: health.clone(),
            declared_fields: Arc::new(service.store().declared_fields()),
        };
        let close = close.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve(&http_conf.bind, app_state, close).await {
                error!("[http] server stopped: {e:#}");
            }
        });
    }

    let ctrl_c = close.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("[kernel] ctrl-c received, closing");
            ctrl_c.close();
        }
    });

    info!("[kernel] up");
    service.run(&mut connection).await?;
    // déjà fermée si la boucle s'est arrêtée sur Closed
    let _ = connection.close().await;
    info!("[kernel] bye");
    Ok(())
}
