//! Shared fakes for unit tests.

use std::{
    collections::{HashMap, HashSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;

use crate::{
    config::{Config, ConfigHandle},
    delivery::port::DeliveryPort,
    domain::{ChatId, MessageRef},
    errors::Error,
    index::RemoteIndex,
    notify::{Notifier, TokenNotice},
    records::{BatchRecord, ContentRecord, IndexEntry, Locator},
    Result,
};

pub fn tmp_dir(prefix: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let dir = std::env::temp_dir().join(format!("{prefix}-{}-{nanos}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Minimal valid config rooted at `dir`, with `vars` layered on top.
pub fn test_config(dir: &Path, vars: &[(&str, &str)]) -> Config {
    let mut map: HashMap<String, String> = [
        ("BOT_TOKEN", "1:test"),
        ("ADMINS", "1"),
        ("DATABASE_CHANNEL", "-100"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    map.insert("DATA_DIR".to_string(), dir.display().to_string());
    for (k, v) in vars {
        map.insert(k.to_string(), v.to_string());
    }
    Config::from_vars(&map, dir.join(".env")).unwrap()
}

pub fn config_handle(dir: &Path, vars: &[(&str, &str)]) -> Arc<ConfigHandle> {
    Arc::new(ConfigHandle::new(test_config(dir, vars)))
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivered {
    pub location: MessageRef,
    pub destination: ChatId,
    pub caption: Option<String>,
    pub copy: MessageRef,
}

/// Delivery fake: records every call and hands out increasing message ids.
pub struct RecordingDelivery {
    next_id: AtomicI32,
    delivered: Mutex<Vec<Delivered>>,
    notices: Mutex<Vec<(ChatId, String, MessageRef)>>,
    removals: Mutex<Vec<MessageRef>>,
    failing_locations: Mutex<HashSet<MessageRef>>,
    fail_removals: AtomicBool,
}

impl Default for RecordingDelivery {
    fn default() -> Self {
        Self {
            next_id: AtomicI32::new(1000),
            delivered: Mutex::new(Vec::new()),
            notices: Mutex::new(Vec::new()),
            removals: Mutex::new(Vec::new()),
            failing_locations: Mutex::new(HashSet::new()),
            fail_removals: AtomicBool::new(false),
        }
    }
}

impl RecordingDelivery {
    pub fn delivered(&self) -> Vec<Delivered> {
        lock(&self.delivered).clone()
    }

    pub fn notices(&self) -> Vec<(ChatId, String, MessageRef)> {
        lock(&self.notices).clone()
    }

    pub fn removals(&self) -> Vec<MessageRef> {
        lock(&self.removals).clone()
    }

    pub fn fail_location(&self, location: MessageRef) {
        lock(&self.failing_locations).insert(location);
    }

    pub fn fail_removals(&self, on: bool) {
        self.fail_removals.store(on, Ordering::SeqCst);
    }

    fn next(&self, chat: ChatId) -> MessageRef {
        MessageRef::new(chat.0, self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl DeliveryPort for RecordingDelivery {
    async fn deliver(
        &self,
        location: MessageRef,
        destination: ChatId,
        caption: Option<&str>,
    ) -> Result<MessageRef> {
        if lock(&self.failing_locations).contains(&location) {
            return Err(Error::Delivery(format!("cannot copy {location}")));
        }
        let copy = self.next(destination);
        lock(&self.delivered).push(Delivered {
            location,
            destination,
            caption: caption.map(str::to_string),
            copy,
        });
        Ok(copy)
    }

    async fn send_notice(&self, destination: ChatId, text: &str) -> Result<MessageRef> {
        let msg = self.next(destination);
        lock(&self.notices).push((destination, text.to_string(), msg));
        Ok(msg)
    }

    async fn remove(&self, delivered: MessageRef) -> Result<()> {
        lock(&self.removals).push(delivered);
        if self.fail_removals.load(Ordering::SeqCst) {
            return Err(Error::Delivery("message to delete not found".into()));
        }
        Ok(())
    }
}

/// Remote index fake keyed by tag.
#[derive(Default)]
pub struct MemoryIndex {
    entries: Mutex<HashMap<String, IndexEntry>>,
    published: AtomicUsize,
    searches: AtomicUsize,
    fail_publishes: AtomicBool,
}

impl MemoryIndex {
    pub fn seed(&self, entry: IndexEntry) {
        lock(&self.entries).insert(entry.tag(), entry);
    }

    pub fn fail_publishes(&self, on: bool) {
        self.fail_publishes.store(on, Ordering::SeqCst);
    }

    pub fn published(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    pub fn searches(&self) -> usize {
        self.searches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteIndex for MemoryIndex {
    async fn publish(&self, entry: &IndexEntry) -> Result<Locator> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(Error::RemotePublish("index offline".into()));
        }
        let n = self.published.fetch_add(1, Ordering::SeqCst) + 1;
        self.seed(entry.clone());
        Ok(Locator(format!("mem:{n}")))
    }

    async fn search_by_id(&self, id: &str) -> Result<Option<ContentRecord>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        Ok(match lock(&self.entries).get(&crate::records::file_tag(id)) {
            Some(IndexEntry::File(r)) => Some(r.clone()),
            _ => None,
        })
    }

    async fn search_batch_by_id(&self, id: &str) -> Result<Option<BatchRecord>> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        Ok(match lock(&self.entries).get(&crate::records::batch_tag(id)) {
            Some(IndexEntry::Batch(b)) => Some(b.clone()),
            _ => None,
        })
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<TokenNotice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<TokenNotice> {
        lock(&self.notices).clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, notice: &TokenNotice) -> Result<()> {
        lock(&self.notices).push(notice.clone());
        Ok(())
    }
}
