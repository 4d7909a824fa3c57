use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use super::dispatch::{DispatchHandle, SideEffectJob};
use super::error::{LedgerError, LedgerResult};
use super::ledger::EntitlementLedger;
use super::models::{Grant, PaymentActivation};

static INVOICE_PAYLOAD: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^tariff_([A-Za-z0-9]+)_(\d+)_(\d+)$").expect("invoice payload pattern is valid")
});

/// key: invoice-payload -> opaque string attached to the invoice and echoed back on payment
///
/// Format: `tariff_<CODE>_<user_id>_<issued_at_ms>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoicePayload {
    pub tariff_code: String,
    pub user_id: i64,
    pub issued_at_ms: i64,
}

impl InvoicePayload {
    pub fn new(tariff_code: &str, user_id: i64, issued_at: DateTime<Utc>) -> Self {
        Self {
            tariff_code: tariff_code.to_ascii_uppercase(),
            user_id,
            issued_at_ms: issued_at.timestamp_millis(),
        }
    }

    pub fn parse(raw: &str) -> LedgerResult<Self> {
        let captures = INVOICE_PAYLOAD
            .captures(raw.trim())
            .ok_or_else(|| LedgerError::InvalidPayload(format!("unrecognized payload `{raw}`")))?;
        let user_id = captures[2]
            .parse::<i64>()
            .map_err(|_| LedgerError::InvalidPayload(format!("bad user id in `{raw}`")))?;
        let issued_at_ms = captures[3]
            .parse::<i64>()
            .map_err(|_| LedgerError::InvalidPayload(format!("bad timestamp in `{raw}`")))?;

        Ok(Self {
            tariff_code: captures[1].to_ascii_uppercase(),
            user_id,
            issued_at_ms,
        })
    }
}

impl fmt::Display for InvoicePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tariff_{}_{}_{}",
            self.tariff_code, self.user_id, self.issued_at_ms
        )
    }
}

/// Inbound "payment completed" event as delivered by the platform callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfirmationEvent {
    pub user_id: i64,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    pub invoice_payload: String,
    pub transaction_id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub raw_payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationStage {
    Received,
    Validated,
    Applied,
    /// Notification handed to the side-effect queue.
    Notified,
    /// Notification and sync both handed to the side-effect queue.
    SyncAttempted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfirmationReceipt {
    pub grant: Grant,
    /// The transaction had already been applied by an earlier delivery.
    pub replayed: bool,
    /// Last step reached without a gap; a failed notification holds it at `Applied`.
    pub stage: ConfirmationStage,
    pub notification_queued: bool,
    pub sync_queued: bool,
}

/// key: payment-confirmation -> validate, apply once, then hand off side effects
#[derive(Clone)]
pub struct PaymentConfirmationHandler {
    ledger: Arc<EntitlementLedger>,
    dispatcher: DispatchHandle,
}

impl PaymentConfirmationHandler {
    pub fn new(ledger: Arc<EntitlementLedger>, dispatcher: DispatchHandle) -> Self {
        Self { ledger, dispatcher }
    }

    pub async fn handle(
        &self,
        event: ConfirmationEvent,
        now: DateTime<Utc>,
    ) -> LedgerResult<ConfirmationReceipt> {
        let user_id = event.user_id;
        let transaction_id = event.transaction_id.clone();
        match self.apply(event, now).await {
            Ok(receipt) => Ok(receipt),
            Err(err) => {
                if err.is_rejection() {
                    warn!(?err, user_id, %transaction_id, "payment confirmation rejected");
                } else {
                    error!(?err, user_id, %transaction_id, "payment confirmation failed");
                }
                Err(err)
            }
        }
    }

    async fn apply(
        &self,
        event: ConfirmationEvent,
        now: DateTime<Utc>,
    ) -> LedgerResult<ConfirmationReceipt> {
        let mut stage = ConfirmationStage::Received;
        let payload = InvoicePayload::parse(&event.invoice_payload)?;
        if payload.user_id != event.user_id {
            return Err(LedgerError::InvalidPayload(format!(
                "payload issued for user {} but paid by {}",
                payload.user_id, event.user_id
            )));
        }
        if event.transaction_id.trim().is_empty() {
            return Err(LedgerError::InvalidPayload(
                "transaction id must not be empty".to_string(),
            ));
        }
        let catalog = self.ledger.catalog();
        if !event.currency.eq_ignore_ascii_case(catalog.currency()) {
            return Err(LedgerError::InvalidPayload(format!(
                "unsupported currency `{}`",
                event.currency
            )));
        }

        let tariff = catalog
            .lookup(&payload.tariff_code)
            .ok_or_else(|| LedgerError::UnknownTariff(payload.tariff_code.clone()))?
            .clone();
        if event.amount != tariff.price {
            error!(
                target: "anomaly",
                user_id = event.user_id,
                transaction_id = %event.transaction_id,
                tariff = %tariff.code,
                expected = tariff.price,
                received = event.amount,
                "confirmed amount disagrees with catalog price"
            );
            return Err(LedgerError::AmountMismatch {
                tariff_code: tariff.code.clone(),
                expected: tariff.price,
                received: event.amount,
            });
        }
        stage = advance(stage, ConfirmationStage::Validated);

        let locale = event.locale.clone();
        let activation = self
            .ledger
            .record_payment_and_activate(
                PaymentActivation {
                    user_id: event.user_id,
                    tariff_code: tariff.code.clone(),
                    transaction_id: event.transaction_id,
                    amount: event.amount,
                    currency: catalog.currency().to_string(),
                    raw_payload: event.raw_payload,
                    display_name: event.display_name,
                    locale: event.locale,
                },
                now,
            )
            .await?;
        stage = advance(stage, ConfirmationStage::Applied);

        if !activation.created {
            return Ok(ConfirmationReceipt {
                grant: activation.grant,
                replayed: true,
                stage,
                notification_queued: false,
                sync_queued: false,
            });
        }

        let grant = activation.grant;
        let notification_queued = match self.dispatcher.enqueue(SideEffectJob::NotifyActivation {
            user_id: grant.user_id,
            locale,
            tariff,
            amount: event.amount,
            grant: grant.clone(),
        }) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    ?err,
                    user_id = grant.user_id,
                    transaction_id = %grant.transaction_id,
                    "activation notification not queued"
                );
                false
            }
        };
        let sync_queued = match self.dispatcher.enqueue(SideEffectJob::SyncEntitlement {
            user_id: grant.user_id,
            grant: grant.clone(),
        }) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    ?err,
                    user_id = grant.user_id,
                    transaction_id = %grant.transaction_id,
                    "entitlement sync not queued"
                );
                false
            }
        };
        let stage = settle(stage, notification_queued, sync_queued);

        info!(
            user_id = grant.user_id,
            transaction_id = %grant.transaction_id,
            stage = ?stage,
            notification_queued,
            sync_queued,
            "payment confirmation processed"
        );
        Ok(ConfirmationReceipt {
            grant,
            replayed: false,
            stage,
            notification_queued,
            sync_queued,
        })
    }
}

fn advance(current: ConfirmationStage, next: ConfirmationStage) -> ConfirmationStage {
    if next as u8 > current as u8 {
        next
    } else {
        current
    }
}

/// Stage after the side-effect hand-off. Sync only counts once the notification is queued.
fn settle(stage: ConfirmationStage, notified: bool, synced: bool) -> ConfirmationStage {
    if !notified {
        return stage;
    }
    let stage = advance(stage, ConfirmationStage::Notified);
    if synced {
        advance(stage, ConfirmationStage::SyncAttempted)
    } else {
        stage
    }
}
