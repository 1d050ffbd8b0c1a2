//! Best-effort notification delivery.
//!
//! Notifications are fire-and-forget: a failed delivery is logged and
//! swallowed, never blocking the reconcile loop.

use async_trait::async_trait;
use tracing::{info, warn};

/// A sink for human-facing messages about cluster events.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, message: &str) -> bool;
}

/// Chat webhook sink.
pub struct WebhookNotifier {
    http: reqwest::Client,
    chat_id: String,
    token: String,
}

impl WebhookNotifier {
    pub fn new(chat_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            chat_id: chat_id.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send_message(&self, message: &str) -> bool {
        info!(message, "notification");

        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let result = self
            .http
            .get(&url)
            .query(&[("chat_id", self.chat_id.as_str()), ("text", message)])
            .send()
            .await;

        match result {
            Ok(response) => response.status().is_success(),
            Err(error) => {
                warn!(error = %error, "notification delivery failed");
                false
            }
        }
    }
}

/// Log-only sink for local runs and tests.
#[derive(Debug, Default)]
pub struct NotificationStub;

#[async_trait]
impl Notifier for NotificationStub {
    async fn send_message(&self, message: &str) -> bool {
        info!(message, "notification");
        false
    }
}
