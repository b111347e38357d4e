//! Admin uploads: per-admin rename and batch-collection state, and turning an
//! archived message into a registered record.

use std::{collections::HashMap, sync::Arc};

use tokio::sync::Mutex;
use tracing::info;

use crate::{
    clock::Clock,
    domain::{MessageRef, UserId},
    links::LinkBuilder,
    records::{BatchRecord, ContentRecord, MediaKind},
    resolver::{PublishHandle, ReferenceResolver},
    Result,
};

#[derive(Debug, Default)]
struct Session {
    awaiting_rename: bool,
    pending_name: Option<String>,
    batch: Option<Vec<String>>,
}

/// Result of ingesting one upload.
pub struct Ingested {
    pub record: ContentRecord,
    pub link: String,
    /// Size of the open batch after this upload, if one is being collected.
    pub batch_len: Option<usize>,
    pub publish: PublishHandle,
}

/// Result of closing a batch.
pub struct ClosedBatch {
    pub batch: BatchRecord,
    pub link: String,
    pub publish: PublishHandle,
}

pub struct Ingestor {
    resolver: Arc<ReferenceResolver>,
    clock: Arc<dyn Clock>,
    links: LinkBuilder,
    sessions: Mutex<HashMap<UserId, Session>>,
}

impl Ingestor {
    pub fn new(resolver: Arc<ReferenceResolver>, clock: Arc<dyn Clock>, links: LinkBuilder) -> Self {
        Self {
            resolver,
            clock,
            links,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// `/rename`: the next text message names the next upload.
    pub async fn request_rename(&self, admin: UserId) {
        self.sessions.lock().await.entry(admin).or_default().awaiting_rename = true;
    }

    /// Consume a plain text message as the pending name. `false` when no rename
    /// was requested (or the text is a command).
    pub async fn offer_text(&self, admin: UserId, text: &str) -> bool {
        let mut sessions = self.sessions.lock().await;
        let Some(s) = sessions.get_mut(&admin) else {
            return false;
        };
        let name = text.trim();
        if !s.awaiting_rename || name.is_empty() || name.starts_with('/') {
            return false;
        }
        s.awaiting_rename = false;
        s.pending_name = Some(name.to_string());
        true
    }

    /// `/firstbatch`: start (or restart) collecting uploads.
    pub async fn start_batch(&self, admin: UserId) {
        self.sessions.lock().await.entry(admin).or_default().batch = Some(Vec::new());
    }

    /// Register an upload already copied to the archive at `location`.
    ///
    /// A pending `/rename` wins over the upload's own caption.
    pub async fn ingest(
        &self,
        admin: UserId,
        location: MessageRef,
        kind: MediaKind,
        caption: Option<String>,
    ) -> Result<Ingested> {
        let name = {
            let mut sessions = self.sessions.lock().await;
            sessions
                .get_mut(&admin)
                .and_then(|s| s.pending_name.take())
        };
        let name = name.or(caption.filter(|c| !c.trim().is_empty()));

        let record = ContentRecord::new(location, name, kind, self.clock.unix_now());
        let publish = self.resolver.register(record.clone()).await?;

        let batch_len = {
            let mut sessions = self.sessions.lock().await;
            sessions
                .get_mut(&admin)
                .and_then(|s| s.batch.as_mut())
                .map(|b| {
                    b.push(record.id.clone());
                    b.len()
                })
        };

        info!(
            "[INGEST] {} stored {} from {location}",
            admin.0,
            kind.as_str()
        );
        Ok(Ingested {
            link: self.links.content_link(&record.id),
            record,
            batch_len,
            publish,
        })
    }

    /// `/lastbatch`: close the open batch. `None` when nothing was collected.
    pub async fn finish_batch(&self, admin: UserId) -> Result<Option<ClosedBatch>> {
        let members = {
            let mut sessions = self.sessions.lock().await;
            sessions.get_mut(&admin).and_then(|s| s.batch.take())
        };
        let Some(members) = members.filter(|m| !m.is_empty()) else {
            return Ok(None);
        };

        let batch = BatchRecord::new(members, self.clock.unix_now());
        let publish = self.resolver.register_batch(batch.clone()).await?;
        Ok(Some(ClosedBatch {
            link: self.links.content_link(&batch.id),
            batch,
            publish,
        }))
    }
}
