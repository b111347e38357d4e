//! Human-readable mirror of the remote index in `LINKS_CHANNEL`.

use std::sync::Arc;

use async_trait::async_trait;
use teloxide::prelude::*;
use tracing::{info, warn};

use fsg_core::{
    clock::{from_unix, Clock},
    domain::ChatId,
    index::RemoteIndex,
    links::LinkBuilder,
    records::{BatchRecord, ContentRecord, IndexEntry, Locator},
    utils::human_time,
    Result,
};

use crate::{tg_chat, with_retry};

/// Publishes to the inner index, then posts a readable entry (with the
/// searchable hashtag) to the links channel. Searches go to the inner index;
/// the Bot API cannot search channel history.
pub struct LinksChannelIndex {
    inner: Arc<dyn RemoteIndex>,
    bot: Bot,
    channel: ChatId,
    links: LinkBuilder,
    clock: Arc<dyn Clock>,
}

impl LinksChannelIndex {
    pub fn new(
        inner: Arc<dyn RemoteIndex>,
        bot: Bot,
        channel: ChatId,
        links: LinkBuilder,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner,
            bot,
            channel,
            links,
            clock,
        }
    }

    fn render(&self, entry: &IndexEntry) -> String {
        render_entry(entry, &self.links, &human_time(self.clock.now()))
    }
}

pub(crate) fn render_entry(entry: &IndexEntry, links: &LinkBuilder, date: &str) -> String {
    match entry {
        IndexEntry::File(r) => format!(
            "🔗 File Link\n\nName: {}\nType: {}\nDate: {date}\nStored: {}\n\nLink: {}\n\n{}",
            r.display_name.as_deref().unwrap_or("Unnamed file"),
            r.kind.as_str(),
            human_time(from_unix(r.created_at)),
            links.content_link(&r.id),
            entry.tag()
        ),
        IndexEntry::Batch(b) => format!(
            "🔗 Batch Link (contains {} files)\n\nDate: {date}\n\nLink: {}\n\n{}",
            b.member_ids.len(),
            links.content_link(&b.id),
            entry.tag()
        ),
    }
}

#[async_trait]
impl RemoteIndex for LinksChannelIndex {
    async fn publish(&self, entry: &IndexEntry) -> Result<Locator> {
        let locator = self.inner.publish(entry).await?;

        let text = self.render(entry);
        match with_retry(|| {
            self.bot
                .send_message(tg_chat(self.channel), text.clone())
                .disable_web_page_preview(true)
        })
        .await
        {
            Ok(msg) => info!(
                "[INDEX] {} mirrored to links channel as message {}",
                entry.id(),
                msg.id.0
            ),
            Err(e) => warn!("[INDEX] links channel post for {} failed: {e}", entry.id()),
        }

        Ok(locator)
    }

    async fn search_by_id(&self, id: &str) -> Result<Option<ContentRecord>> {
        self.inner.search_by_id(id).await
    }

    async fn search_batch_by_id(&self, id: &str) -> Result<Option<BatchRecord>> {
        self.inner.search_batch_by_id(id).await
    }
}
