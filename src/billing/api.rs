use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{
    ConfirmationEvent, ConfirmationReceipt, Consumption, EntitlementLedger,
    EntitlementQueryService, EntitlementSnapshot, Grant, PaymentConfirmationHandler,
    PaymentHistoryEntry, SubscriptionView, TariffView,
};
use crate::error::AppResult;

pub const DEFAULT_HISTORY_LIMIT: i64 = 20;

/// Success envelope shared by every JSON endpoint: `{ "ok": true, "data": ... }`.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub ok: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T) -> Json<Self> {
        Json(Self { ok: true, data })
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

impl HistoryQuery {
    fn limit(&self) -> i64 {
        self.limit.unwrap_or(DEFAULT_HISTORY_LIMIT)
    }
}

/// key: payments-api -> tariff, subscription and history endpoints
pub async fn list_tariffs(
    Extension(queries): Extension<Arc<EntitlementQueryService>>,
) -> Json<ApiResponse<Vec<TariffView>>> {
    ApiResponse::new(queries.tariffs())
}

pub async fn get_subscription(
    Extension(queries): Extension<Arc<EntitlementQueryService>>,
    Path(user_id): Path<i64>,
) -> AppResult<Json<ApiResponse<Option<SubscriptionView>>>> {
    let view = queries.subscription(user_id, Utc::now()).await?;
    Ok(ApiResponse::new(view))
}

pub async fn get_history(
    Extension(queries): Extension<Arc<EntitlementQueryService>>,
    Path(user_id): Path<i64>,
    Query(params): Query<HistoryQuery>,
) -> AppResult<Json<ApiResponse<Vec<PaymentHistoryEntry>>>> {
    let entries = queries.history(user_id, params.limit()).await?;
    Ok(ApiResponse::new(entries))
}

pub async fn confirm_payment(
    Extension(handler): Extension<Arc<PaymentConfirmationHandler>>,
    Json(event): Json<ConfirmationEvent>,
) -> AppResult<Json<ApiResponse<ConfirmationReceipt>>> {
    let receipt = handler.handle(event, Utc::now()).await?;
    Ok(ApiResponse::new(receipt))
}

/// key: user-api -> per-user entitlement endpoints
pub async fn get_snapshot(
    Extension(queries): Extension<Arc<EntitlementQueryService>>,
    Path(user_id): Path<i64>,
    Query(params): Query<HistoryQuery>,
) -> AppResult<Json<ApiResponse<EntitlementSnapshot>>> {
    let snapshot = queries
        .snapshot(user_id, params.limit(), Utc::now())
        .await?;
    Ok(ApiResponse::new(snapshot))
}

pub async fn list_grants(
    Extension(ledger): Extension<Arc<EntitlementLedger>>,
    Path(user_id): Path<i64>,
) -> AppResult<Json<ApiResponse<Vec<Grant>>>> {
    let grants = ledger.list_grants(user_id, Utc::now()).await?;
    Ok(ApiResponse::new(grants))
}

pub async fn consume_check(
    Extension(ledger): Extension<Arc<EntitlementLedger>>,
    Path(user_id): Path<i64>,
) -> AppResult<Json<ApiResponse<Consumption>>> {
    let consumption = ledger.consume_check(user_id, Utc::now()).await?;
    Ok(ApiResponse::new(consumption))
}
