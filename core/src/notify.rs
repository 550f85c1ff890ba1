//! Push notification sink: "tell the user their attention is needed" as a small
//! injectable trait so the engine never knows the transport. Deployment uses the
//! webhook sender (JSON POST); tests use an in-memory recorder.

use async_trait::async_trait;

/// Error from delivering a notification. Always logged and swallowed by callers;
/// a failed push must never affect the PTY session.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("push endpoint returned status {0}")]
    Status(u16),
    #[error("push request failed: {0}")]
    Transport(String),
}

/// Sink for user-facing notifications. Implemented per transport.
#[async_trait]
pub trait PushNotifier: Send + Sync {
    /// Deliver one notification. `data` carries structured context
    /// (session id, reason) for the receiving client.
    async fn send(
        &self,
        title: &str,
        body: &str,
        data: serde_json::Value,
    ) -> Result<(), NotifyError>;
}

/// Webhook sender: POSTs `{title, body, data}` as JSON to a configured URL.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl PushNotifier for WebhookNotifier {
    async fn send(
        &self,
        title: &str,
        body: &str,
        data: serde_json::Value,
    ) -> Result<(), NotifyError> {
        let payload = serde_json::json!({
            "title": title,
            "body": body,
            "data": data,
        });
        let resp = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(NotifyError::Status(resp.status().as_u16()));
        }
        Ok(())
    }
}

/// No-op sink used when no webhook is configured.
pub struct NoopNotifier;

#[async_trait]
impl PushNotifier for NoopNotifier {
    async fn send(&self, _: &str, _: &str, _: serde_json::Value) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Build the notifier from config: webhook when configured, no-op otherwise.
pub fn notifier_from_config(cfg: &crate::config::Config) -> std::sync::Arc<dyn PushNotifier> {
    match &cfg.push_webhook_url {
        Some(url) => std::sync::Arc::new(WebhookNotifier::new(url.clone())),
        None => std::sync::Arc::new(NoopNotifier),
    }
}
