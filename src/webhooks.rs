use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::billing::replies::{self, Locale, HISTORY_REPLY_LIMIT};
use crate::billing::{
    ConfirmationEvent, DispatchHandle, EntitlementLedger, EntitlementQueryService,
    LedgerResult, PaymentConfirmationHandler, SideEffectJob,
};

/// Subset of the Bot API `Update` object the service reacts to.
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    #[serde(default)]
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    #[serde(default)]
    pub chat: Option<TelegramChat>,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub successful_payment: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub language_code: Option<String>,
}

impl TelegramUser {
    fn display_name(&self) -> Option<String> {
        self.first_name
            .clone()
            .filter(|name| !name.trim().is_empty())
            .or_else(|| self.username.clone())
    }
}

/// Bot commands answered with a chat reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Tariffs,
    MyPlan,
    History,
}

impl Command {
    /// Reads the leading `/command` or `/command@bot_name` word of a message.
    fn parse(text: &str) -> Option<Self> {
        let word = text.split_whitespace().next()?.strip_prefix('/')?;
        let name = word.split('@').next().unwrap_or(word);
        match name.to_ascii_lowercase().as_str() {
            "start" => Some(Command::Start),
            "tariffs" => Some(Command::Tariffs),
            "myplan" => Some(Command::MyPlan),
            "history" => Some(Command::History),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SuccessfulPayment {
    currency: String,
    total_amount: i64,
    invoice_payload: String,
    telegram_payment_charge_id: String,
}

fn acknowledge(outcome: &str) -> Response {
    (
        StatusCode::OK,
        Json(json!({ "ok": true, "data": { "outcome": outcome } })),
    )
        .into_response()
}

fn retry_later(message: String) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "ok": false, "error": message })),
    )
        .into_response()
}

/// Builds the confirmation event for a `successful_payment` message.
pub fn confirmation_event(user: &TelegramUser, payment: Value) -> Result<ConfirmationEvent, String> {
    let parsed: SuccessfulPayment =
        serde_json::from_value(payment.clone()).map_err(|err| err.to_string())?;
    Ok(ConfirmationEvent {
        user_id: user.id,
        display_name: user.display_name(),
        locale: user.language_code.clone(),
        invoice_payload: parsed.invoice_payload,
        transaction_id: parsed.telegram_payment_charge_id,
        amount: parsed.total_amount,
        currency: parsed.currency,
        raw_payload: payment,
    })
}

fn reply(dispatcher: &DispatchHandle, chat_id: i64, text: String) {
    if let Err(err) = dispatcher.enqueue(SideEffectJob::SendText { chat_id, text }) {
        warn!(?err, chat_id, "chat reply not queued");
    }
}

/// key: webhooks-telegram -> platform update entrypoint
///
/// Rejected events are acknowledged with 200 so the platform stops redelivering them; storage
/// failures answer 500 so the same update comes back later. Command replies and the payment
/// failure notice go through the side-effect queue.
pub async fn telegram_webhook(
    Extension(handler): Extension<Arc<PaymentConfirmationHandler>>,
    Extension(ledger): Extension<Arc<EntitlementLedger>>,
    Extension(queries): Extension<Arc<EntitlementQueryService>>,
    Extension(dispatcher): Extension<DispatchHandle>,
    Json(update): Json<TelegramUpdate>,
) -> Response {
    let Some(message) = update.message else {
        debug!(update_id = update.update_id, "ignoring update without message");
        return acknowledge("ignored");
    };
    let Some(user) = message.from else {
        debug!(update_id = update.update_id, "ignoring message without sender");
        return acknowledge("ignored");
    };
    let chat_id = message.chat.map(|chat| chat.id).unwrap_or(user.id);
    let locale = Locale::from_code(user.language_code.as_deref());

    if let Some(payment) = message.successful_payment {
        let event = match confirmation_event(&user, payment) {
            Ok(event) => event,
            Err(reason) => {
                error!(
                    update_id = update.update_id,
                    user_id = user.id,
                    %reason,
                    "malformed successful_payment"
                );
                reply(&dispatcher, chat_id, replies::payment_failed(locale));
                return acknowledge("rejected");
            }
        };
        return match handler.handle(event, Utc::now()).await {
            Ok(receipt) if receipt.replayed => acknowledge("duplicate"),
            Ok(_) => acknowledge("applied"),
            Err(err) if err.is_rejection() => {
                reply(&dispatcher, chat_id, replies::payment_failed(locale));
                acknowledge("rejected")
            }
            Err(err) => retry_later(err.to_string()),
        };
    }

    let Some(command) = message.text.as_deref().and_then(Command::parse) else {
        return acknowledge("ignored");
    };
    let now = Utc::now();

    if command == Command::Start {
        return match ledger
            .ensure_account(user.id, user.display_name(), user.language_code.clone(), now)
            .await
        {
            Ok(account) => {
                info!(
                    user_id = account.user_id,
                    free_checks_remaining = account.free_checks_remaining,
                    "first contact registered"
                );
                reply(
                    &dispatcher,
                    chat_id,
                    replies::welcome(locale, user.first_name.as_deref()),
                );
                acknowledge("registered")
            }
            Err(err) => {
                error!(?err, user_id = user.id, "failed to register account");
                retry_later(err.to_string())
            }
        };
    }

    match answer(command, &ledger, &queries, user.id, locale, now).await {
        Ok(text) => {
            reply(&dispatcher, chat_id, text);
            acknowledge("replied")
        }
        Err(err) => {
            error!(?err, user_id = user.id, ?command, "bot command failed");
            reply(&dispatcher, chat_id, replies::command_failed(locale));
            acknowledge("failed")
        }
    }
}

async fn answer(
    command: Command,
    ledger: &EntitlementLedger,
    queries: &EntitlementQueryService,
    user_id: i64,
    locale: Locale,
    now: DateTime<Utc>,
) -> LedgerResult<String> {
    match command {
        Command::Tariffs | Command::Start => Ok(replies::tariff_list(locale, ledger.catalog())),
        Command::MyPlan => {
            if ledger.find_account(user_id).await?.is_none() {
                return Ok(replies::unknown_user(locale));
            }
            let plan = queries.subscription(user_id, now).await?;
            Ok(replies::subscription(
                locale,
                ledger.catalog(),
                plan.as_ref(),
                now,
            ))
        }
        Command::History => {
            let entries = queries.history(user_id, HISTORY_REPLY_LIMIT).await?;
            Ok(replies::history(locale, &entries))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn successful_payment_maps_to_event() {
        let user = TelegramUser {
            id: 77,
            first_name: None,
            username: Some("buyer".to_string()),
            language_code: Some("ru".to_string()),
        };
        let payment = json!({
            "currency": "XTR",
            "total_amount": 1,
            "invoice_payload": "tariff_LITE_77_1717000000000",
            "telegram_payment_charge_id": "charge-1",
            "provider_payment_charge_id": "",
        });

        let event = confirmation_event(&user, payment.clone()).unwrap();
        assert_eq!(event.user_id, 77);
        assert_eq!(event.display_name.as_deref(), Some("buyer"));
        assert_eq!(event.locale.as_deref(), Some("ru"));
        assert_eq!(event.transaction_id, "charge-1");
        assert_eq!(event.amount, 1);
        assert_eq!(event.raw_payload, payment);
    }

    #[test]
    fn incomplete_payment_object_is_rejected() {
        let user = TelegramUser {
            id: 1,
            first_name: Some("A".to_string()),
            username: None,
            language_code: None,
        };
        assert!(confirmation_event(&user, json!({ "currency": "XTR" })).is_err());
    }

    #[test]
    fn commands_are_recognized_with_bot_suffix() {
        assert_eq!(Command::parse("/start"), Some(Command::Start));
        assert_eq!(Command::parse("  /myplan@checks_bot"), Some(Command::MyPlan));
        assert_eq!(Command::parse("/History now"), Some(Command::History));
        assert_eq!(Command::parse("/tariffs"), Some(Command::Tariffs));
        assert_eq!(Command::parse("/app"), None);
        assert_eq!(Command::parse("history"), None);
        assert_eq!(Command::parse(""), None);
    }
}
