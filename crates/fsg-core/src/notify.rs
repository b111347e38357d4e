//! Notification collaborator: announces freshly issued tokens.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use crate::{errors::Error, utils::fingerprint, Result};

/// What gets announced when a token is issued.
#[derive(Clone, Debug, Serialize)]
pub struct TokenNotice {
    pub token_id: String,
    /// Where a user redeems the token (deep link).
    pub redemption: String,
    pub expiry: DateTime<Utc>,
    /// `true` for the open-access token.
    pub open_access: bool,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &TokenNotice) -> Result<()>;
}

/// JSON POST of the notice to `TOKEN_WEBHOOK_URL`.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| Error::External(format!("webhook client: {e}")))?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notice: &TokenNotice) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(notice)
            .send()
            .await
            .map_err(|e| Error::External(format!("webhook: {e}")))?;
        if !resp.status().is_success() {
            return Err(Error::External(format!(
                "webhook returned {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

/// Calls every inner notifier; individual failures are logged, never returned.
#[derive(Default)]
pub struct FanoutNotifier {
    targets: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(targets: Vec<Arc<dyn Notifier>>) -> Self {
        Self { targets }
    }

    pub fn push(&mut self, target: Arc<dyn Notifier>) {
        self.targets.push(target);
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, notice: &TokenNotice) -> Result<()> {
        for target in &self.targets {
            if let Err(e) = target.notify(notice).await {
                warn!(
                    "[NOTIFY] token {} announcement failed: {e}",
                    fingerprint(&notice.token_id)
                );
            }
        }
        Ok(())
    }
}
