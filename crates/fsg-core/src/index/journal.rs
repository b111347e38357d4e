//! JSON-lines journal implementation of the remote index.
//!
//! One line per publication, never rewritten:
//! `{"seq":3,"tag":"#file_…","published_at":1700000000,"entry":{…}}`.
//! Searches scan from the end so the newest publication of an id wins.

use std::{
    fs::{self, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{
    clock::Clock,
    errors::Error,
    index::RemoteIndex,
    records::{batch_tag, file_tag, BatchRecord, ContentRecord, IndexEntry, Locator},
    Result,
};

#[derive(Debug, Serialize, Deserialize)]
struct JournalLine {
    seq: u64,
    tag: String,
    published_at: i64,
    entry: IndexEntry,
}

pub struct JournalIndex {
    path: PathBuf,
    clock: Arc<dyn Clock>,
    append_lock: Mutex<()>,
}

impl JournalIndex {
    pub fn open(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            path: path.into(),
            clock,
            append_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(txt) => Ok(txt),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(Error::storage(&self.path, e)),
        }
    }

    // Tags are lossy (`-` and `_` collide), so the entry id is matched too.
    fn find_latest(&self, tag: &str, id: &str) -> Result<Option<IndexEntry>> {
        let txt = self.read_all()?;
        for line in txt.lines().rev() {
            // Cheap pre-filter before parsing.
            if !line.contains(tag) {
                continue;
            }
            match serde_json::from_str::<JournalLine>(line) {
                Ok(parsed) if parsed.tag == tag && parsed.entry.id() == id => {
                    return Ok(Some(parsed.entry));
                }
                Ok(_) => {}
                Err(e) => debug!("[INDEX] skipping malformed journal line: {e}"),
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl RemoteIndex for JournalIndex {
    async fn publish(&self, entry: &IndexEntry) -> Result<Locator> {
        let _guard = self.append_lock.lock().await;

        let seq = self.read_all()?.lines().count() as u64 + 1;
        let line = JournalLine {
            seq,
            tag: entry.tag(),
            published_at: self.clock.unix_now(),
            entry: entry.clone(),
        };
        let mut txt = serde_json::to_string(&line)?;
        txt.push('\n');

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::storage(parent, e))?;
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| Error::RemotePublish(format!("{}: {e}", self.path.display())))?;
        f.write_all(txt.as_bytes())
            .and_then(|_| f.sync_data())
            .map_err(|e| Error::RemotePublish(format!("{}: {e}", self.path.display())))?;

        Ok(Locator(format!("journal:{seq}")))
    }

    async fn search_by_id(&self, id: &str) -> Result<Option<ContentRecord>> {
        match self.find_latest(&file_tag(id), id)? {
            Some(IndexEntry::File(r)) => Ok(Some(r)),
            Some(_) => {
                warn!("[INDEX] tag for {id} points at a mismatched entry");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn search_batch_by_id(&self, id: &str) -> Result<Option<BatchRecord>> {
        match self.find_latest(&batch_tag(id), id)? {
            Some(IndexEntry::Batch(b)) => Ok(Some(b)),
            Some(_) => {
                warn!("[INDEX] tag for batch {id} points at a mismatched entry");
                Ok(None)
            }
            None => Ok(None),
        }
    }
}
