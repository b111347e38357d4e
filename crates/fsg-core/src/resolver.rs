//! Reference resolver: opaque id -> archived content location.
//!
//! Two tiers. The local record store is the fast path and may be stale or
//! purged; the remote index is authoritative. Remote hits are written back
//! locally when possible. Nothing locks the two tiers against each other, so a
//! record can be local-only (publish still pending) or remote-only (after a
//! purge) and both are normal.

use std::{path::Path, sync::Arc};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    index::RemoteIndex,
    records::{BatchRecord, ContentRecord, IndexEntry, Locator},
    search::{self, SearchHit, SearchQuery},
    store::Collection,
    Result,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    File(ContentRecord),
    Batch(BatchRecord),
    NotFound,
}

/// Per-member outcome of a batch. `missing` keeps the ids that resolved to
/// nothing in either tier; the batch itself never fails for them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchResolution {
    pub resolved: Vec<ContentRecord>,
    pub missing: Vec<String>,
}

/// Outcome of `purge_local`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub files: usize,
    pub batches: usize,
    /// Records left in place because no remote copy is known.
    pub kept_local_only: usize,
}

/// Completion handle of a background publication.
pub struct PublishHandle {
    task: Option<JoinHandle<Option<Locator>>>,
}

impl PublishHandle {
    /// Wait for publication. `None` when there is no remote index or the
    /// publish failed.
    pub async fn wait(self) -> Option<Locator> {
        match self.task {
            Some(task) => task.await.ok().flatten(),
            None => None,
        }
    }
}

pub struct ReferenceResolver {
    files: Arc<Collection<ContentRecord>>,
    batches: Arc<Collection<BatchRecord>>,
    remote: Option<Arc<dyn RemoteIndex>>,
}

impl ReferenceResolver {
    pub fn new(data_dir: &Path, remote: Option<Arc<dyn RemoteIndex>>) -> Self {
        Self {
            files: Arc::new(Collection::open(data_dir, "files")),
            batches: Arc::new(Collection::open(data_dir, "batches")),
            remote,
        }
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub fn files(&self) -> &Collection<ContentRecord> {
        &self.files
    }

    pub fn batches(&self) -> &Collection<BatchRecord> {
        &self.batches
    }

    /// Files first, then batches; local tier before remote.
    pub async fn resolve(&self, id: &str) -> Resolution {
        if let Some(r) = self.local_file(id).await {
            return Resolution::File(r);
        }
        if let Some(b) = self.local_batch(id).await {
            return Resolution::Batch(b);
        }
        if let Some(r) = self.remote_file(id).await {
            return Resolution::File(r);
        }
        if let Some(b) = self.remote_batch(id).await {
            return Resolution::Batch(b);
        }
        info!("[RESOLVE] {id} not found in either tier");
        Resolution::NotFound
    }

    pub async fn resolve_file(&self, id: &str) -> Option<ContentRecord> {
        match self.local_file(id).await {
            Some(r) => Some(r),
            None => self.remote_file(id).await,
        }
    }

    /// Resolve a batch and each of its members. `None` when the batch id
    /// itself is unknown.
    pub async fn resolve_batch(&self, id: &str) -> Option<BatchResolution> {
        let batch = match self.local_batch(id).await {
            Some(b) => b,
            None => self.remote_batch(id).await?,
        };
        Some(self.resolve_members(&batch).await)
    }

    /// Members are resolved independently, in declared order.
    pub async fn resolve_members(&self, batch: &BatchRecord) -> BatchResolution {
        let mut out = BatchResolution::default();
        for member in &batch.member_ids {
            match self.resolve_file(member).await {
                Some(r) => out.resolved.push(r),
                None => out.missing.push(member.clone()),
            }
        }
        if !out.missing.is_empty() {
            warn!(
                "[RESOLVE] batch {}: {} of {} members missing",
                batch.id,
                out.missing.len(),
                batch.member_ids.len()
            );
        }
        out
    }

    /// Persist locally, then publish to the remote index in the background and
    /// attach the returned locator. Only the local write can fail the call.
    pub async fn register(&self, record: ContentRecord) -> Result<PublishHandle> {
        self.files.insert(&record.id, record.clone()).await?;
        info!("[RESOLVE] registered file {}", record.id);
        Ok(self.spawn_publish(IndexEntry::File(record), self.files.clone(), |r, loc| {
            r.remote_locator = Some(loc)
        }))
    }

    pub async fn register_batch(&self, batch: BatchRecord) -> Result<PublishHandle> {
        self.batches.insert(&batch.id, batch.clone()).await?;
        info!(
            "[RESOLVE] registered batch {} ({} members)",
            batch.id,
            batch.member_ids.len()
        );
        Ok(self.spawn_publish(IndexEntry::Batch(batch), self.batches.clone(), |b, loc| {
            b.remote_locator = Some(loc)
        }))
    }

    /// Search the local tier. Purged records are only reachable by id.
    pub async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>> {
        let files = self.files.entries().await?;
        let batches = self.batches.entries().await?;
        let hits = search::run(query, &files, &batches);
        info!("[SEARCH] {} -> {} hits", query.describe(), hits.len());
        Ok(hits)
    }

    /// Drop the local copy of every record the remote index already holds.
    /// Records without a locator (publish failed or still running) are the
    /// only copy and stay.
    pub async fn purge_local(&self) -> Result<PurgeReport> {
        let files = self.files.retain(|_, r| r.remote_locator.is_none()).await?;
        let batches = self.batches.retain(|_, b| b.remote_locator.is_none()).await?;
        let kept_local_only = self.files.len().await? + self.batches.len().await?;
        info!(
            "[RESOLVE] purged local index: {files} files, {batches} batches, {kept_local_only} local-only kept"
        );
        Ok(PurgeReport {
            files,
            batches,
            kept_local_only,
        })
    }

    fn spawn_publish<V, F>(
        &self,
        entry: IndexEntry,
        local: Arc<Collection<V>>,
        attach: F,
    ) -> PublishHandle
    where
        V: serde::Serialize + serde::de::DeserializeOwned + Clone + Send + 'static,
        F: FnOnce(&mut V, Locator) + Send + 'static,
    {
        let Some(remote) = self.remote.clone() else {
            return PublishHandle { task: None };
        };

        let task = tokio::spawn(async move {
            let id = entry.id().to_string();
            let locator = match remote.publish(&entry).await {
                Ok(loc) => loc,
                Err(e) => {
                    warn!("[RESOLVE] publish of {id} failed, local copy stays valid: {e}");
                    return None;
                }
            };

            let attached = locator.clone();
            // A purge may have removed the local copy meanwhile; leave it gone.
            let res = local
                .upsert(&id, move |cur| {
                    cur.map(|mut v| {
                        attach(&mut v, attached);
                        v
                    })
                })
                .await;
            match res {
                Ok(_) => debug!("[RESOLVE] {id} published as {locator}"),
                Err(e) => warn!("[RESOLVE] could not attach locator to {id}: {e}"),
            }
            Some(locator)
        });
        PublishHandle { task: Some(task) }
    }

    async fn local_file(&self, id: &str) -> Option<ContentRecord> {
        match self.files.get(id).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!("[RESOLVE] local file lookup for {id} failed: {e}");
                None
            }
        }
    }

    async fn local_batch(&self, id: &str) -> Option<BatchRecord> {
        match self.batches.get(id).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!("[RESOLVE] local batch lookup for {id} failed: {e}");
                None
            }
        }
    }

    async fn remote_file(&self, id: &str) -> Option<ContentRecord> {
        let remote = self.remote.as_ref()?;
        let record = match remote.search_by_id(id).await {
            Ok(hit) => hit?,
            Err(e) => {
                warn!("[RESOLVE] remote search for {id} failed: {e}");
                return None;
            }
        };
        info!("[RESOLVE] {id} recovered from remote index");
        write_back(&self.files, id, record.clone()).await;
        Some(record)
    }

    async fn remote_batch(&self, id: &str) -> Option<BatchRecord> {
        let remote = self.remote.as_ref()?;
        let batch = match remote.search_batch_by_id(id).await {
            Ok(hit) => hit?,
            Err(e) => {
                warn!("[RESOLVE] remote batch search for {id} failed: {e}");
                return None;
            }
        };
        info!("[RESOLVE] batch {id} recovered from remote index");
        write_back(&self.batches, id, batch.clone()).await;
        Some(batch)
    }
}

// Opportunistic; a concurrent local write wins.
async fn write_back<V>(local: &Collection<V>, id: &str, value: V)
where
    V: serde::Serialize + serde::de::DeserializeOwned + Clone + Send,
{
    if let Err(e) = local.upsert(id, move |cur| cur.or(Some(value))).await {
        warn!("[RESOLVE] write-back of {id} failed: {e}");
    }
}
