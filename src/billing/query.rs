use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use super::catalog::GrantSize;
use super::error::LedgerResult;
use super::ledger::EntitlementLedger;
use super::models::{Grant, PaymentRecord};

/// A check count as shown to clients: a number, or the literal `"unlimited"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckCount {
    Limited(i64),
    Unlimited,
}

impl Serialize for CheckCount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CheckCount::Limited(count) => serializer.serialize_i64(*count),
            CheckCount::Unlimited => serializer.serialize_str("unlimited"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TariffView {
    pub code: String,
    pub name: String,
    pub description: String,
    pub price: i64,
    pub currency: String,
    pub checks: CheckCount,
    pub validity_seconds: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionView {
    pub tariff_code: String,
    pub checks_remaining: CheckCount,
    pub checks_limit: CheckCount,
    pub expires_at: Option<DateTime<Utc>>,
    pub purchased_at: DateTime<Utc>,
    pub transaction_id: String,
}

impl From<&Grant> for SubscriptionView {
    fn from(grant: &Grant) -> Self {
        let (checks_remaining, checks_limit) = if grant.unlimited {
            (CheckCount::Unlimited, CheckCount::Unlimited)
        } else {
            (
                CheckCount::Limited(grant.checks_remaining),
                CheckCount::Limited(grant.checks_limit),
            )
        };
        Self {
            tariff_code: grant.tariff_code.clone(),
            checks_remaining,
            checks_limit,
            expires_at: grant.expires_at,
            purchased_at: grant.purchased_at,
            transaction_id: grant.transaction_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentHistoryEntry {
    pub tariff_code: String,
    pub amount: i64,
    pub currency: String,
    pub transaction_id: String,
    pub recorded_at: DateTime<Utc>,
}

impl From<PaymentRecord> for PaymentHistoryEntry {
    fn from(record: PaymentRecord) -> Self {
        Self {
            tariff_code: record.tariff_code,
            amount: record.amount,
            currency: record.currency,
            transaction_id: record.transaction_id,
            recorded_at: record.recorded_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntitlementSnapshot {
    pub user_id: i64,
    pub active_grant: Option<SubscriptionView>,
    /// Zero for users the ledger has never seen.
    pub free_checks_remaining: i64,
    pub history: Vec<PaymentHistoryEntry>,
}

/// key: entitlement-query -> read-only views over the ledger
#[derive(Clone)]
pub struct EntitlementQueryService {
    ledger: Arc<EntitlementLedger>,
}

impl EntitlementQueryService {
    pub fn new(ledger: Arc<EntitlementLedger>) -> Self {
        Self { ledger }
    }

    pub fn tariffs(&self) -> Vec<TariffView> {
        let catalog = self.ledger.catalog();
        catalog
            .tariffs()
            .iter()
            .map(|tariff| TariffView {
                code: tariff.code.clone(),
                name: tariff.name.clone(),
                description: tariff.description.clone(),
                price: tariff.price,
                currency: catalog.currency().to_string(),
                checks: match tariff.grant {
                    GrantSize::Limited(count) => CheckCount::Limited(count),
                    GrantSize::Unlimited => CheckCount::Unlimited,
                },
                validity_seconds: tariff.validity_seconds,
            })
            .collect()
    }

    pub async fn subscription(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> LedgerResult<Option<SubscriptionView>> {
        let grant = self.ledger.get_active_grant(user_id, now).await?;
        Ok(grant.as_ref().map(SubscriptionView::from))
    }

    pub async fn history(&self, user_id: i64, limit: i64) -> LedgerResult<Vec<PaymentHistoryEntry>> {
        let records = self.ledger.list_payment_history(user_id, limit).await?;
        Ok(records.into_iter().map(PaymentHistoryEntry::from).collect())
    }

    pub async fn snapshot(
        &self,
        user_id: i64,
        history_limit: i64,
        now: DateTime<Utc>,
    ) -> LedgerResult<EntitlementSnapshot> {
        let active_grant = self.subscription(user_id, now).await?;
        let free_checks_remaining = self
            .ledger
            .find_account(user_id)
            .await?
            .map(|account| account.free_checks_remaining)
            .unwrap_or(0);
        let history = self.history(user_id, history_limit).await?;

        Ok(EntitlementSnapshot {
            user_id,
            active_grant,
            free_checks_remaining,
            history,
        })
    }
}
