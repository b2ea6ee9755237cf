//! Review-comment adapters.
//!
//! `WebhookCommenter` posts `{thread_id, body}` as JSON to an HTTP endpoint
//! (a bot or CI relay that owns the platform credentials). `LogCommenter`
//! only logs, for runs without a review platform.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;

use super::{CommentReceipt, ReviewCommenter};

/// Webhook-based review commenter
pub struct WebhookCommenter {
    /// Endpoint receiving comments
    url: String,
    /// Optional bearer token
    token: Option<String>,
    /// HTTP client
    client: reqwest::Client,
}

/// Response from the webhook (all fields optional)
#[derive(Debug, Default, Deserialize)]
struct WebhookResponse {
    #[serde(default)]
    id: Option<serde_json::Value>,
}

impl WebhookCommenter {
    pub fn new(url: impl Into<String>, token: Option<String>) -> Self {
        Self {
            url: url.into(),
            token,
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ReviewCommenter for WebhookCommenter {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn post_comment(&self, thread_id: &str, body: &str) -> Result<CommentReceipt> {
        let mut request = self.client.post(&self.url).json(&serde_json::json!({
            "thread_id": thread_id,
            "body": body,
        }));
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to post comment to {}", self.url))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Comment webhook returned {}: {}", status, text.trim());
        }

        let parsed: WebhookResponse = response.json().await.unwrap_or_default();
        let comment_id = parsed.id.map(|id| match id {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        });

        Ok(CommentReceipt::new(thread_id, comment_id))
    }
}

/// Commenter that only logs the comment
#[derive(Debug, Default, Clone, Copy)]
pub struct LogCommenter;

#[async_trait]
impl ReviewCommenter for LogCommenter {
    fn name(&self) -> &str {
        "log"
    }

    async fn post_comment(&self, thread_id: &str, body: &str) -> Result<CommentReceipt> {
        info!(thread_id, body_len = body.len(), "Review comment (log only)");
        Ok(CommentReceipt::new(thread_id, None))
    }
}
