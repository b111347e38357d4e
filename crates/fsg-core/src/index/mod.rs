//! Remote index: the durable, audit-readable tier behind the local record store.

pub mod journal;

use async_trait::async_trait;

use crate::{
    records::{BatchRecord, ContentRecord, IndexEntry, Locator},
    Result,
};

/// Append-only index that can also be searched to recover lost local records.
///
/// Files and batches are told apart by the tag convention of `IndexEntry::tag`.
#[async_trait]
pub trait RemoteIndex: Send + Sync {
    async fn publish(&self, entry: &IndexEntry) -> Result<Locator>;

    async fn search_by_id(&self, id: &str) -> Result<Option<ContentRecord>>;

    async fn search_batch_by_id(&self, id: &str) -> Result<Option<BatchRecord>>;
}
