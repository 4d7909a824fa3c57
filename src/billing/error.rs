use std::time::Duration;

use thiserror::Error;

/// key: ledger-errors -> rejection and storage taxonomy
///
/// A transaction that was already recorded is not an error; it comes back as an
/// `Activation` with `created == false`.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("invalid payment payload: {0}")]
    InvalidPayload(String),
    #[error("unknown tariff `{0}`")]
    UnknownTariff(String),
    #[error("amount mismatch for tariff `{tariff_code}`: expected {expected}, received {received}")]
    AmountMismatch {
        tariff_code: String,
        expected: i64,
        received: i64,
    },
    #[error("expiry of tariff `{tariff_code}` is out of range")]
    ExpiryOverflow { tariff_code: String },
    #[error("user {user_id} has no checks left")]
    NoEntitlement { user_id: i64 },
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("storage operation timed out after {0:?}")]
    StorageTimeout(Duration),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

impl LedgerError {
    /// Validation failures: the event is rejected and nothing was written.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidPayload(_)
                | LedgerError::UnknownTariff(_)
                | LedgerError::AmountMismatch { .. }
        )
    }

    /// Failures the caller should retry (the platform redelivers the event).
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            LedgerError::Storage(_)
                | LedgerError::StorageTimeout(_)
                | LedgerError::StorageUnavailable(_)
        )
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;
