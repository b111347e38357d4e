use std::sync::Arc;

use teloxide::{prelude::*, types::Message};
use tracing::error;

use fsg_core::{
    domain::{MessageRef, UserId},
    records::MediaKind,
};

use crate::router::AppState;

pub(super) fn media_kind(msg: &Message) -> Option<MediaKind> {
    if msg.photo().is_some() {
        Some(MediaKind::Photo)
    } else if msg.video().is_some() {
        Some(MediaKind::Video)
    } else if msg.audio().is_some() {
        Some(MediaKind::Audio)
    } else if msg.animation().is_some() {
        // Animations also carry a document; check them first.
        Some(MediaKind::Animation)
    } else if msg.document().is_some() {
        Some(MediaKind::Document)
    } else if msg.voice().is_some() {
        Some(MediaKind::Voice)
    } else if msg.video_note().is_some() {
        Some(MediaKind::VideoNote)
    } else if msg.sticker().is_some() {
        Some(MediaKind::Sticker)
    } else {
        None
    }
}

pub(super) async fn handle_upload(
    bot: Bot,
    msg: Message,
    state: Arc<AppState>,
    admin: UserId,
) -> ResponseResult<()> {
    let Some(kind) = media_kind(&msg) else {
        return Ok(());
    };

    let upload = MessageRef::new(msg.chat.id.0, msg.id.0);
    let location = match state.telegram.archive(upload).await {
        Ok(loc) => loc,
        Err(e) => {
            error!("[INGEST] archiving {upload} failed: {e}");
            let _ = bot
                .send_message(msg.chat.id, "Failed to store the file in the archive.")
                .await;
            return Ok(());
        }
    };

    let caption = msg.caption().map(str::to_string);
    let reply = match state
        .gateway
        .ingestor()
        .ingest(admin, location, kind, caption)
        .await
    {
        Ok(done) => match done.batch_len {
            Some(n) => format!("Added to batch ({n} files so far).\n\nFile link:\n{}", done.link),
            None => format!("File stored!\n\nShare link:\n{}", done.link),
        },
        Err(e) => {
            error!("[INGEST] registering {location} failed: {e}");
            "Failed to save the file record.".to_string()
        }
    };

    let _ = bot.send_message(msg.chat.id, reply).await;
    Ok(())
}
