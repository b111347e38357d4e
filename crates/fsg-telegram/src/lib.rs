//! Telegram adapter (teloxide).
//!
//! Implements the `fsg-core` delivery, notification and remote-index ports over
//! the Telegram Bot API.

use std::sync::Arc;

use async_trait::async_trait;
use teloxide::{prelude::*, ApiError, RequestError};
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub mod handlers;
pub mod links_channel;
pub mod router;

use fsg_core::{
    config::ConfigHandle,
    delivery::port::DeliveryPort,
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    notify::{Notifier, TokenNotice},
    utils::{fingerprint, human_time},
    Result,
};

pub(crate) fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
    teloxide::types::ChatId(chat_id.0)
}

pub(crate) fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
    teloxide::types::MessageId(message_id.0)
}

fn map_err(e: RequestError) -> Error {
    match e {
        RequestError::Api(ApiError::MessageToDeleteNotFound) => {
            Error::Delivery("message already deleted".to_string())
        }
        RequestError::Api(api) => Error::Delivery(format!("telegram api error: {api}")),
        other => Error::External(format!("telegram error: {other}")),
    }
}

/// Run a Bot API call, honouring one 429 `RetryAfter`.
pub(crate) async fn with_retry<T, Fut>(mut op: impl FnMut() -> Fut) -> Result<T>
where
    Fut: std::future::IntoFuture<Output = std::result::Result<T, RequestError>>,
    Fut::IntoFuture: Send,
{
    const MAX_RETRIES: usize = 1;
    let mut attempts = 0usize;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(RequestError::RetryAfter(d)) if attempts < MAX_RETRIES => {
                attempts += 1;
                debug!("[TG] rate limited, retrying after {d:?}");
                sleep(d).await;
            }
            Err(other) => return Err(map_err(other)),
        }
    }
}

/// Delivery over `copyMessage` / `deleteMessage`.
#[derive(Clone)]
pub struct TelegramDelivery {
    bot: Bot,
    config: Arc<ConfigHandle>,
}

impl TelegramDelivery {
    pub fn new(bot: Bot, config: Arc<ConfigHandle>) -> Self {
        Self { bot, config }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    /// Forward an admin upload into the archive chat; the forwarded message is
    /// the content's location from then on.
    pub async fn archive(&self, upload: MessageRef) -> Result<MessageRef> {
        let archive = ChatId(self.config.current().database_channel);
        let msg = with_retry(|| {
            self.bot.forward_message(
                tg_chat(archive),
                tg_chat(upload.chat_id),
                tg_msg_id(upload.message_id),
            )
        })
        .await?;
        Ok(MessageRef {
            chat_id: archive,
            message_id: MessageId(msg.id.0),
        })
    }
}

#[async_trait]
impl DeliveryPort for TelegramDelivery {
    async fn deliver(
        &self,
        location: MessageRef,
        destination: ChatId,
        caption: Option<&str>,
    ) -> Result<MessageRef> {
        let protect = self.config.current().protect_content;
        let id = with_retry(|| {
            let mut req = self
                .bot
                .copy_message(
                    tg_chat(destination),
                    tg_chat(location.chat_id),
                    tg_msg_id(location.message_id),
                )
                .protect_content(protect);
            if let Some(c) = caption {
                req = req.caption(c.to_string());
            }
            req
        })
        .await?;

        Ok(MessageRef {
            chat_id: destination,
            message_id: MessageId(id.0),
        })
    }

    async fn send_notice(&self, destination: ChatId, text: &str) -> Result<MessageRef> {
        let msg = with_retry(|| self.bot.send_message(tg_chat(destination), text.to_string()))
            .await?;
        Ok(MessageRef {
            chat_id: destination,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn remove(&self, delivered: MessageRef) -> Result<()> {
        let res = with_retry(|| {
            self.bot
                .delete_message(tg_chat(delivered.chat_id), tg_msg_id(delivered.message_id))
        })
        .await;
        match res {
            Ok(_) => Ok(()),
            Err(e) => {
                debug!("[TG] delete {delivered} failed: {e}");
                Err(e)
            }
        }
    }
}

/// Announces new tokens to every admin, and the open-access token to the
/// archive chat as well.
pub struct AdminNotifier {
    bot: Bot,
    config: Arc<ConfigHandle>,
}

impl AdminNotifier {
    pub fn new(bot: Bot, config: Arc<ConfigHandle>) -> Self {
        Self { bot, config }
    }
}

#[async_trait]
impl Notifier for AdminNotifier {
    async fn notify(&self, notice: &TokenNotice) -> Result<()> {
        let cfg = self.config.current();
        let text = format!(
            "🔑 New Token Generated\n\nVerification URL: {}\nExpires: {}",
            notice.redemption,
            human_time(notice.expiry)
        );

        let mut failures = 0usize;
        for admin in &cfg.admins {
            if let Err(e) = with_retry(|| {
                self.bot
                    .send_message(tg_chat(ChatId(*admin)), text.clone())
                    .disable_web_page_preview(true)
            })
            .await
            {
                warn!("[NOTIFY] could not reach admin {admin}: {e}");
                failures += 1;
            }
        }

        if notice.open_access {
            let hours = cfg.token_duration.as_secs() / 3600;
            let post = format!(
                "🔑 Current Access Token (valid for {hours} hours)\n\nVerification URL: {}",
                notice.redemption
            );
            with_retry(|| {
                self.bot
                    .send_message(tg_chat(ChatId(cfg.database_channel)), post.clone())
                    .disable_web_page_preview(true)
            })
            .await?;
        }

        info!(
            "[NOTIFY] token {} announced ({} admin failures)",
            fingerprint(&notice.token_id),
            failures
        );
        if failures == cfg.admins.len() && !cfg.admins.is_empty() {
            return Err(Error::External("no admin could be notified".to_string()));
        }
        Ok(())
    }
}
