// =============================================================================
// Webhook sender — best-effort JSON POST of feed events
// =============================================================================

use tracing::debug;

use crate::error::{EngineError, Result};

use super::FeedEvent;

/// POSTs every feed event to one configured URL. Delivery is best effort:
/// failures are surfaced to the caller for logging and never retried.
pub struct WebhookSender {
    url: String,
    http: reqwest::Client,
}

impl WebhookSender {
    pub fn new(url: impl Into<String>, timeout: std::time::Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| EngineError::Config(format!("failed to build webhook client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }

    pub async fn send(&self, event: &FeedEvent) -> Result<()> {
        let resp = self
            .http
            .post(&self.url)
            .json(event)
            .send()
            .await
            .map_err(|e| EngineError::transient(format!("webhook POST failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(EngineError::transient(format!(
                "webhook returned {status}"
            )));
        }

        debug!(url = %self.url, "webhook delivered");
        Ok(())
    }
}

impl std::fmt::Debug for WebhookSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookSender").field("url", &self.url).finish()
    }
}
