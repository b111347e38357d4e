//! Telegram update handlers.
//!
//! Commands go to `commands`; everything an admin sends in private chat is
//! either the answer to a pending `/rename` or an upload for `ingest`.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};

use fsg_core::domain::UserId;

use crate::router::AppState;

mod commands;
mod ingest;

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let user_id = UserId(user.id.0 as i64);

    if let Some(text) = msg.text() {
        if text.starts_with('/') {
            let _guard = state.chat_locks.lock_chat(msg.chat.id.0).await;
            return commands::handle_command(bot, msg, state).await;
        }
    }

    // Uploads and rename answers are admin-only and private-chat only.
    if !msg.chat.is_private() || !state.config.current().is_admin(user_id.0) {
        return Ok(());
    }

    if let Some(text) = msg.text() {
        if state.gateway.ingestor().offer_text(user_id, text).await {
            let _ = bot
                .send_message(
                    msg.chat.id,
                    format!("Next file will be named: {}\n\nNow send the file.", text.trim()),
                )
                .await;
        }
        return Ok(());
    }

    let _guard = state.chat_locks.lock_chat(msg.chat.id.0).await;
    ingest::handle_upload(bot, msg, state, user_id).await
}
