use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::billing::LedgerError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("not found")]
    NotFound,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Ledger(err) => match err {
                LedgerError::AmountMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                LedgerError::InvalidPayload(_) | LedgerError::UnknownTariff(_) => {
                    StatusCode::BAD_REQUEST
                }
                LedgerError::NoEntitlement { .. } => StatusCode::PAYMENT_REQUIRED,
                LedgerError::StorageTimeout(_) | LedgerError::StorageUnavailable(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                LedgerError::Storage(_) | LedgerError::ExpiryOverflow { .. } => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::debug!(?self);
        }
        let body = Json(json!({ "ok": false, "error": self.to_string() }));
        (status, body).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn ledger_errors_map_to_statuses() {
        let cases = [
            (
                AppError::from(LedgerError::InvalidPayload("x".into())),
                StatusCode::BAD_REQUEST,
            ),
            (
                AppError::from(LedgerError::AmountMismatch {
                    tariff_code: "LITE".into(),
                    expected: 1,
                    received: 2,
                }),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                AppError::from(LedgerError::NoEntitlement { user_id: 1 }),
                StatusCode::PAYMENT_REQUIRED,
            ),
            (
                AppError::from(LedgerError::StorageTimeout(Duration::from_secs(1))),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                AppError::from(LedgerError::ExpiryOverflow {
                    tariff_code: "FOREVER".into(),
                }),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (AppError::NotFound, StatusCode::NOT_FOUND),
        ];
        for (err, status) in cases {
            assert_eq!(err.status(), status, "{err}");
        }
    }
}
