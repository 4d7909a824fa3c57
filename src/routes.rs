use std::sync::Arc;

use axum::{
    routing::{get, post},
    Extension, Json, Router,
};
use serde_json::{json, Value};

use crate::billing::{
    self, DispatchHandle, EntitlementLedger, EntitlementQueryService, PaymentConfirmationHandler,
};
use crate::error::AppError;
use crate::webhooks;

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/payments/tariffs", get(billing::list_tariffs))
        .route(
            "/api/payments/subscription/:user_id",
            get(billing::get_subscription),
        )
        .route("/api/payments/history/:user_id", get(billing::get_history))
        .route("/api/payments/confirm", post(billing::confirm_payment))
        .route("/api/user/:user_id", get(billing::get_snapshot))
        .route("/api/user/:user_id/grants", get(billing::list_grants))
        .route("/api/user/:user_id/consume", post(billing::consume_check))
        .route("/api/webhook/telegram", post(webhooks::telegram_webhook))
}

/// Shared components the handlers pull out of request extensions.
#[derive(Clone)]
pub struct AppServices {
    pub ledger: Arc<EntitlementLedger>,
    pub queries: Arc<EntitlementQueryService>,
    pub confirmations: Arc<PaymentConfirmationHandler>,
    pub dispatcher: DispatchHandle,
}

impl AppServices {
    pub fn new(ledger: Arc<EntitlementLedger>, dispatcher: DispatchHandle) -> Self {
        Self {
            queries: Arc::new(EntitlementQueryService::new(ledger.clone())),
            confirmations: Arc::new(PaymentConfirmationHandler::new(
                ledger.clone(),
                dispatcher.clone(),
            )),
            ledger,
            dispatcher,
        }
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "ok": true, "data": { "status": "ok" } }))
}

async fn not_found() -> AppError {
    AppError::NotFound
}

/// Full application router without the metrics layer.
pub fn app(services: AppServices) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(api_routes())
        .fallback(not_found)
        .layer(Extension(services.ledger))
        .layer(Extension(services.queries))
        .layer(Extension(services.confirmations))
        .layer(Extension(services.dispatcher))
}
