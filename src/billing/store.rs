use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::LedgerResult;
use super::models::{
    Activation, ActivationRequest, Consumption, Grant, NewAccount, PaymentRecord, UserAccount,
};

/// key: ledger-store -> durable state behind the entitlement ledger
///
/// Each method is one atomic unit. Implementations apply the lazy grant transitions
/// (`Grant::observe`) to every grant they read for a user and persist the result.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Inserts the account if absent and returns the stored row either way.
    async fn ensure_account(&self, account: NewAccount) -> LedgerResult<UserAccount>;

    async fn find_account(&self, user_id: i64) -> LedgerResult<Option<UserAccount>>;

    /// Ensures the account, then inserts payment and grant together. When a payment with the
    /// same transaction id exists, nothing is written and the existing grant is returned.
    async fn activate(&self, request: ActivationRequest) -> LedgerResult<Activation>;

    /// Read-check-decrement of one check. Returns `LedgerError::NoEntitlement` when neither
    /// an active grant nor free checks remain.
    async fn consume(&self, user_id: i64, now: DateTime<Utc>) -> LedgerResult<Consumption>;

    async fn active_grant(&self, user_id: i64, now: DateTime<Utc>) -> LedgerResult<Option<Grant>>;

    /// All grants of the user, newest purchase first.
    async fn list_grants(&self, user_id: i64, now: DateTime<Utc>) -> LedgerResult<Vec<Grant>>;

    async fn grant_by_transaction(&self, transaction_id: &str) -> LedgerResult<Option<Grant>>;

    /// Payment records newest first, at most `limit`.
    async fn payment_history(&self, user_id: i64, limit: i64) -> LedgerResult<Vec<PaymentRecord>>;
}
