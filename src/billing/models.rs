use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use super::catalog::{GrantSize, Tariff};
use super::error::{LedgerError, LedgerResult};

/// Remaining-count stored for unlimited grants. Consumption still decrements it, so a grant
/// tagged `unlimited` behaves as a very large cap rather than a special case in the counters.
pub const UNLIMITED_CHECKS: i64 = 1_000_000_000;

/// key: ledger-account-model -> per-user balance
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct UserAccount {
    pub user_id: i64,
    pub display_name: Option<String>,
    pub locale: Option<String>,
    pub free_checks_remaining: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    Active,
    Expired,
    Exhausted,
}

impl GrantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrantStatus::Active => "active",
            GrantStatus::Expired => "expired",
            GrantStatus::Exhausted => "exhausted",
        }
    }

}

impl FromStr for GrantStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "active" => Ok(GrantStatus::Active),
            "expired" => Ok(GrantStatus::Expired),
            "exhausted" => Ok(GrantStatus::Exhausted),
            other => Err(format!("unknown grant status `{other}`")),
        }
    }
}

/// key: ledger-grant-model -> usage rights bought by one payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub id: i64,
    pub user_id: i64,
    pub tariff_code: String,
    pub unlimited: bool,
    pub checks_limit: i64,
    pub checks_remaining: i64,
    pub purchased_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub transaction_id: String,
    pub status: GrantStatus,
}

impl Grant {
    /// Status this grant has when observed at `now`. Expiry wins over exhaustion and a
    /// grant that already left `active` keeps its status.
    pub fn status_at(&self, now: DateTime<Utc>) -> GrantStatus {
        if self.status != GrantStatus::Active {
            return self.status;
        }
        if let Some(expires_at) = self.expires_at {
            if expires_at < now {
                return GrantStatus::Expired;
            }
        }
        if self.checks_remaining <= 0 {
            return GrantStatus::Exhausted;
        }
        GrantStatus::Active
    }

    /// Applies the lazy transition rule in place; returns whether the status changed.
    pub fn observe(&mut self, now: DateTime<Utc>) -> bool {
        let next = self.status_at(now);
        if next != self.status {
            self.status = next;
            return true;
        }
        false
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status_at(now) == GrantStatus::Active
    }
}

/// Picks the grant a user's operations act on: latest `purchased_at`, ties broken by the
/// highest id. Only grants still active at `now` are considered.
pub fn select_active<'a, I>(grants: I, now: DateTime<Utc>) -> Option<&'a Grant>
where
    I: IntoIterator<Item = &'a Grant>,
{
    grants
        .into_iter()
        .filter(|grant| grant.is_active_at(now))
        .max_by_key(|grant| (grant.purchased_at, grant.id))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Completed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Completed => "completed",
        }
    }

}

impl FromStr for PaymentStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "completed" => Ok(PaymentStatus::Completed),
            other => Err(format!("unknown payment status `{other}`")),
        }
    }
}

/// key: ledger-payment-model -> audit record of a confirmed payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub transaction_id: String,
    pub user_id: i64,
    pub tariff_code: String,
    pub amount: i64,
    pub currency: String,
    pub raw_payload: Value,
    pub status: PaymentStatus,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub user_id: i64,
    pub display_name: Option<String>,
    pub locale: Option<String>,
    pub free_checks: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub id: Uuid,
    pub transaction_id: String,
    pub user_id: i64,
    pub tariff_code: String,
    pub amount: i64,
    pub currency: String,
    pub raw_payload: Value,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewGrant {
    pub user_id: i64,
    pub tariff_code: String,
    pub unlimited: bool,
    pub checks_limit: i64,
    pub purchased_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub transaction_id: String,
}

impl NewGrant {
    /// Fails with `ExpiryOverflow` when `purchased_at + validity` is not a representable instant.
    pub fn for_tariff(
        user_id: i64,
        tariff: &Tariff,
        transaction_id: &str,
        purchased_at: DateTime<Utc>,
    ) -> LedgerResult<Self> {
        let (unlimited, checks_limit) = match tariff.grant {
            GrantSize::Limited(count) => (false, count),
            GrantSize::Unlimited => (true, UNLIMITED_CHECKS),
        };
        let expires_at = match tariff.validity_seconds {
            Some(seconds) => Some(
                Duration::try_seconds(seconds)
                    .and_then(|validity| purchased_at.checked_add_signed(validity))
                    .ok_or_else(|| LedgerError::ExpiryOverflow {
                        tariff_code: tariff.code.clone(),
                    })?,
            ),
            None => None,
        };

        Ok(Self {
            user_id,
            tariff_code: tariff.code.clone(),
            unlimited,
            checks_limit,
            purchased_at,
            expires_at,
            transaction_id: transaction_id.to_string(),
        })
    }
}

/// Everything the store writes for one confirmed payment, applied as a single unit.
#[derive(Debug, Clone)]
pub struct ActivationRequest {
    pub account: NewAccount,
    pub payment: NewPayment,
    pub grant: NewGrant,
}

/// Caller-facing input of `record_payment_and_activate`.
#[derive(Debug, Clone)]
pub struct PaymentActivation {
    pub user_id: i64,
    pub tariff_code: String,
    pub transaction_id: String,
    pub amount: i64,
    pub currency: String,
    pub raw_payload: Value,
    pub display_name: Option<String>,
    pub locale: Option<String>,
}

/// Result of activation. `created == false` means the transaction was already recorded and
/// `grant` is the one created by the first delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Activation {
    pub grant: Grant,
    pub created: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Consumption {
    Grant { grant: Grant },
    FreeAllotment { user_id: i64, remaining: i64 },
}

impl Consumption {
    pub fn remaining(&self) -> i64 {
        match self {
            Consumption::Grant { grant } => grant.checks_remaining,
            Consumption::FreeAllotment { remaining, .. } => *remaining,
        }
    }
}
