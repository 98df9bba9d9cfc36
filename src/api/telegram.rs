use reqwest::Client;
use serde::Serialize;

use super::AlertSink;
use crate::error::BotError;
use crate::Result;

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_notification: bool,
}

/// Telegram Bot API alert sink
#[derive(Clone)]
pub struct TelegramNotifier {
    client: Client,
    base_url: String,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self::with_base_url(TELEGRAM_API_BASE, token, chat_id)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        token: impl Into<String>,
        chat_id: impl Into<String>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            chat_id: chat_id.into(),
        }
    }

    /// Deliver one message and wait for the result
    pub async fn send(&self, text: &str, silent: bool) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.token);
        let body = SendMessage {
            chat_id: &self.chat_id,
            text,
            disable_notification: silent,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BotError::Notification(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(BotError::Notification(format!("HTTP {}: {}", status, detail)));
        }
        Ok(())
    }
}

impl AlertSink for TelegramNotifier {
    fn notify(&self, text: &str, silent: bool) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("No runtime available, alert dropped: {}", text);
            return;
        };

        let notifier = self.clone();
        let text = text.to_string();
        handle.spawn(async move {
            match notifier.send(&text, silent).await {
                Ok(()) => tracing::info!("📱 Alert sent: {}", text),
                Err(e) => tracing::error!("❌ Failed to send Telegram message: {}", e),
            }
        });
    }
}
