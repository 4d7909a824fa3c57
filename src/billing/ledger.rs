use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use super::catalog::TariffCatalog;
use super::error::{LedgerError, LedgerResult};
use super::models::{
    Activation, ActivationRequest, Consumption, Grant, NewAccount, NewGrant, NewPayment,
    PaymentActivation, PaymentRecord, UserAccount,
};
use super::store::LedgerStore;

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// Free checks handed out once when an account is first created.
    pub default_free_checks: i64,
    /// Upper bound on every storage call.
    pub storage_timeout: Duration,
    /// Largest page `list_payment_history` returns.
    pub history_limit_max: i64,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            default_free_checks: 3,
            storage_timeout: Duration::from_secs(5),
            history_limit_max: 100,
        }
    }
}

/// key: entitlement-ledger -> accounts, grants and payments
#[derive(Clone)]
pub struct EntitlementLedger {
    store: Arc<dyn LedgerStore>,
    catalog: Arc<TariffCatalog>,
    settings: LedgerSettings,
}

impl EntitlementLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        catalog: Arc<TariffCatalog>,
        settings: LedgerSettings,
    ) -> Self {
        Self {
            store,
            catalog,
            settings,
        }
    }

    pub fn catalog(&self) -> &TariffCatalog {
        &self.catalog
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    pub async fn ensure_account(
        &self,
        user_id: i64,
        display_name: Option<String>,
        locale: Option<String>,
        now: DateTime<Utc>,
    ) -> LedgerResult<UserAccount> {
        let account = NewAccount {
            user_id,
            display_name,
            locale,
            free_checks: self.settings.default_free_checks,
            created_at: now,
        };
        self.bounded(self.store.ensure_account(account)).await
    }

    pub async fn find_account(&self, user_id: i64) -> LedgerResult<Option<UserAccount>> {
        self.bounded(self.store.find_account(user_id)).await
    }

    /// Records a confirmed payment and activates its grant exactly once per transaction id.
    /// Redelivery of the same transaction returns the grant created by the first delivery.
    pub async fn record_payment_and_activate(
        &self,
        payment: PaymentActivation,
        now: DateTime<Utc>,
    ) -> LedgerResult<Activation> {
        let tariff = self
            .catalog
            .lookup(&payment.tariff_code)
            .ok_or_else(|| LedgerError::UnknownTariff(payment.tariff_code.clone()))?;
        let transaction_id = payment.transaction_id.trim();
        if transaction_id.is_empty() {
            return Err(LedgerError::InvalidPayload(
                "transaction id must not be empty".to_string(),
            ));
        }

        let request = ActivationRequest {
            account: NewAccount {
                user_id: payment.user_id,
                display_name: payment.display_name,
                locale: payment.locale,
                free_checks: self.settings.default_free_checks,
                created_at: now,
            },
            payment: NewPayment {
                id: Uuid::new_v4(),
                transaction_id: transaction_id.to_string(),
                user_id: payment.user_id,
                tariff_code: tariff.code.clone(),
                amount: payment.amount,
                currency: payment.currency,
                raw_payload: payment.raw_payload,
                recorded_at: now,
            },
            grant: NewGrant::for_tariff(payment.user_id, tariff, transaction_id, now)?,
        };

        let activation = self.bounded(self.store.activate(request)).await?;
        if activation.created {
            info!(
                user_id = payment.user_id,
                transaction_id,
                tariff = %activation.grant.tariff_code,
                grant_id = activation.grant.id,
                expires_at = ?activation.grant.expires_at,
                "grant activated"
            );
        } else {
            info!(
                user_id = payment.user_id,
                transaction_id,
                grant_id = activation.grant.id,
                "duplicate payment confirmation resolved to existing grant"
            );
        }
        Ok(activation)
    }

    pub async fn consume_check(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> LedgerResult<Consumption> {
        let consumption = self.bounded(self.store.consume(user_id, now)).await?;
        debug!(user_id, remaining = consumption.remaining(), "check consumed");
        Ok(consumption)
    }

    pub async fn get_active_grant(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<Grant>> {
        self.bounded(self.store.active_grant(user_id, now)).await
    }

    pub async fn list_grants(&self, user_id: i64, now: DateTime<Utc>) -> LedgerResult<Vec<Grant>> {
        self.bounded(self.store.list_grants(user_id, now)).await
    }

    pub async fn grant_by_transaction(&self, transaction_id: &str) -> LedgerResult<Option<Grant>> {
        self.bounded(self.store.grant_by_transaction(transaction_id))
            .await
    }

    pub async fn list_payment_history(
        &self,
        user_id: i64,
        limit: i64,
    ) -> LedgerResult<Vec<PaymentRecord>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let limit = limit.min(self.settings.history_limit_max.max(1));
        self.bounded(self.store.payment_history(user_id, limit))
            .await
    }

    async fn bounded<T, F>(&self, operation: F) -> LedgerResult<T>
    where
        F: Future<Output = LedgerResult<T>>,
    {
        match tokio::time::timeout(self.settings.storage_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::StorageTimeout(self.settings.storage_timeout)),
        }
    }
}
