use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum_prometheus::PrometheusMetricLayer;
use checks_ledger::billing::{
    start_dispatch_worker, EntitlementLedger, EntitlementSync, HttpEntitlementSync, LedgerStore,
    LogNotifier, MemoryLedgerStore, NotificationSink, TelegramNotifier,
};
use checks_ledger::db::PgLedgerStore;
use checks_ledger::{app, config, AppServices};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    let settings = config::ledger_settings();

    let store: Arc<dyn LedgerStore> = match config::DATABASE_URL.as_deref() {
        Some(db_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(*config::DATABASE_MAX_CONNECTIONS)
                .acquire_timeout(settings.storage_timeout)
                .connect(db_url)
                .await?;

            if let Err(error) = sqlx::migrate!().run(&pool).await {
                if *config::ALLOW_MIGRATION_FAILURE {
                    tracing::warn!(
                        ?error,
                        "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
                    );
                } else {
                    return Err(Box::new(error) as Box<dyn std::error::Error>);
                }
            }
            Arc::new(PgLedgerStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL is not set; ledger state is kept in memory only");
            Arc::new(MemoryLedgerStore::new())
        }
    };

    let catalog = Arc::new(config::load_catalog()?);
    tracing::info!(tariffs = catalog.tariffs().len(), "tariff catalog loaded");
    let ledger = Arc::new(EntitlementLedger::new(store, catalog, settings));

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let notifier: Arc<dyn NotificationSink> = match config::TELEGRAM_BOT_TOKEN.as_deref() {
        Some(token) => Arc::new(TelegramNotifier::new(
            client.clone(),
            config::TELEGRAM_API_BASE.as_str(),
            token,
        )?),
        None => {
            tracing::warn!("TELEGRAM_BOT_TOKEN is not set; activation messages are only logged");
            Arc::new(LogNotifier)
        }
    };
    let sync = match config::SYNC_API_URL.as_deref() {
        Some(url) => {
            let sync: Arc<dyn EntitlementSync> = Arc::new(HttpEntitlementSync::new(client, url)?);
            Some(sync)
        }
        None => None,
    };
    let dispatcher = start_dispatch_worker(
        notifier,
        sync,
        config::sync_retry_policy(),
        *config::DISPATCH_QUEUE_CAPACITY,
    );

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = app(AppServices::new(ledger, dispatcher))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .layer(prometheus_layer);

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
