use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::info;
use url::Url;

use super::catalog::Tariff;
use super::models::Grant;
use super::replies::{self, Locale};

/// key: notification-sink -> outbound chat messages
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_activation(
        &self,
        user_id: i64,
        locale: Option<&str>,
        tariff: &Tariff,
        amount: i64,
        grant: &Grant,
    ) -> Result<()>;

    /// Plain reply to a chat, e.g. the answer to a bot command.
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()>;
}

/// key: entitlement-sync -> mirror of new grants into the consumer system
#[async_trait]
pub trait EntitlementSync: Send + Sync {
    async fn push_entitlement(&self, user_id: i64, grant: &Grant) -> Result<()>;
}

/// Sends the confirmation through the Bot API `sendMessage` method.
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_base: Url,
    token: String,
}

impl TelegramNotifier {
    pub fn new(client: reqwest::Client, api_base: &str, token: impl Into<String>) -> Result<Self> {
        let api_base = Url::parse(api_base).context("invalid Telegram API base url")?;
        Ok(Self {
            client,
            api_base,
            token: token.into(),
        })
    }

    // bot tokens contain `:`, so the path is set directly instead of going through `Url::join`
    fn send_message_url(&self) -> Url {
        let mut url = self.api_base.clone();
        let base_path = self.api_base.path().trim_end_matches('/');
        url.set_path(&format!("{base_path}/bot{}/sendMessage", self.token));
        url
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        let response = self
            .client
            .post(self.send_message_url())
            .json(&json!({
                "chat_id": chat_id,
                "text": text,
                "parse_mode": "HTML",
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("sendMessage returned {status}: {body}"));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for TelegramNotifier {
    async fn notify_activation(
        &self,
        user_id: i64,
        locale: Option<&str>,
        tariff: &Tariff,
        amount: i64,
        grant: &Grant,
    ) -> Result<()> {
        let text = replies::activation(Locale::from_code(locale), tariff, amount, grant);
        self.send_message(user_id, &text).await
    }

    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()> {
        self.send_message(chat_id, text).await
    }
}

/// Used when no bot token is configured; the activation is only logged.
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn notify_activation(
        &self,
        user_id: i64,
        _locale: Option<&str>,
        tariff: &Tariff,
        amount: i64,
        grant: &Grant,
    ) -> Result<()> {
        info!(
            user_id,
            tariff = %tariff.code,
            amount,
            transaction_id = %grant.transaction_id,
            "activation notification (log only)"
        );
        Ok(())
    }

    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()> {
        info!(chat_id, chars = text.chars().count(), "chat reply (log only)");
        Ok(())
    }
}

/// Posts new grants to `{base}/api/user/{user_id}/subscription`.
pub struct HttpEntitlementSync {
    client: reqwest::Client,
    base: Url,
}

impl HttpEntitlementSync {
    pub fn new(client: reqwest::Client, base: &str) -> Result<Self> {
        let mut base = Url::parse(base).context("invalid entitlement sync url")?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { client, base })
    }
}

#[async_trait]
impl EntitlementSync for HttpEntitlementSync {
    async fn push_entitlement(&self, user_id: i64, grant: &Grant) -> Result<()> {
        let url = self
            .base
            .join(&format!("api/user/{user_id}/subscription"))
            .context("failed to build sync url")?;
        self.client
            .post(url)
            .json(&json!({
                "tariff": grant.tariff_code,
                "checks_limit": grant.checks_limit,
                "checks_remaining": grant.checks_remaining,
                "unlimited": grant.unlimited,
                "expires_at": grant.expires_at,
                "transaction_id": grant.transaction_id,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}
