//! Durable record store.
//!
//! Each collection is one JSON object (`key -> record`) in its own file. Every
//! operation runs under the collection's async mutex, so a read-modify-write of
//! any key is a full read-current-state, apply-delta, write-back cycle and two
//! writers never lose each other's update. Writes land in a temp file that is
//! renamed over the target.
//!
//! The file is re-read on every operation: the local tier may be purged or
//! restored from backup behind the process's back and must be observed as-is.

use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    marker::PhantomData,
    path::{Path, PathBuf},
};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::warn;

use crate::{errors::Error, Result};

type RawMap = BTreeMap<String, Value>;

pub struct Collection<V> {
    name: &'static str,
    path: PathBuf,
    lock: Mutex<()>,
    _marker: PhantomData<fn() -> V>,
}

impl<V> Collection<V>
where
    V: Serialize + DeserializeOwned + Clone + Send,
{
    /// Open (lazily) the collection `<dir>/<name>.json`.
    pub fn open(dir: &Path, name: &'static str) -> Self {
        Self {
            name,
            path: dir.join(format!("{name}.json")),
            lock: Mutex::new(()),
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &str) -> Result<Option<V>> {
        let _guard = self.lock.lock().await;
        let map = self.load()?;
        Ok(map.get(key).and_then(|raw| self.decode(key, raw)))
    }

    /// Atomic read-modify-write of one key.
    ///
    /// `f` receives the current record (or `None`) and returns the new one;
    /// returning `None` removes the key. The new value is returned.
    pub async fn upsert<F>(&self, key: &str, f: F) -> Result<Option<V>>
    where
        F: FnOnce(Option<V>) -> Option<V>,
    {
        let _guard = self.lock.lock().await;
        let mut map = self.load()?;
        let current = map.get(key).and_then(|raw| self.decode(key, raw));
        let had_entry = map.contains_key(key);

        let next = f(current);
        match &next {
            Some(v) => {
                map.insert(key.to_string(), serde_json::to_value(v)?);
            }
            None if had_entry => {
                map.remove(key);
            }
            None => return Ok(None),
        }

        self.save(&map)?;
        Ok(next)
    }

    pub async fn insert(&self, key: &str, value: V) -> Result<()> {
        self.upsert(key, move |_| Some(value)).await?;
        Ok(())
    }

    /// Remove a key, returning the record it held (if it decoded).
    pub async fn remove(&self, key: &str) -> Result<Option<V>> {
        let _guard = self.lock.lock().await;
        let mut map = self.load()?;
        let Some(raw) = map.remove(key) else {
            return Ok(None);
        };
        self.save(&map)?;
        Ok(self.decode(key, &raw))
    }

    /// All decodable records, in key order.
    pub async fn entries(&self) -> Result<Vec<(String, V)>> {
        let _guard = self.lock.lock().await;
        let map = self.load()?;
        Ok(map
            .iter()
            .filter_map(|(k, raw)| self.decode(k, raw).map(|v| (k.clone(), v)))
            .collect())
    }

    pub async fn len(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        Ok(self.load()?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Keep only the records for which `keep` returns true. Entries that fail to
    /// decode are kept untouched. Returns the number removed.
    pub async fn retain<F>(&self, mut keep: F) -> Result<usize>
    where
        F: FnMut(&str, &V) -> bool,
    {
        let _guard = self.lock.lock().await;
        let mut map = self.load()?;
        let before = map.len();
        map.retain(|k, raw| match self.decode(k.as_str(), raw) {
            Some(v) => keep(k.as_str(), &v),
            None => true,
        });
        let removed = before - map.len();
        if removed > 0 {
            self.save(&map)?;
        }
        Ok(removed)
    }

    /// Drop every record. Returns the number removed.
    pub async fn clear(&self) -> Result<usize> {
        let _guard = self.lock.lock().await;
        let map = self.load()?;
        if map.is_empty() {
            return Ok(0);
        }
        self.save(&RawMap::new())?;
        Ok(map.len())
    }

    /// Copy the current file into `dir` as `<name>.json`. `None` when there is
    /// nothing on disk yet.
    pub async fn backup_to(&self, dir: &Path) -> Result<Option<PathBuf>> {
        let _guard = self.lock.lock().await;
        if !self.path.exists() {
            return Ok(None);
        }
        fs::create_dir_all(dir).map_err(|e| Error::storage(dir, e))?;
        let target = dir.join(format!("{}.json", self.name));
        fs::copy(&self.path, &target).map_err(|e| Error::storage(&target, e))?;
        Ok(Some(target))
    }

    fn load(&self) -> Result<RawMap> {
        let txt = match fs::read_to_string(&self.path) {
            Ok(txt) => txt,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(RawMap::new()),
            Err(e) => return Err(Error::storage(&self.path, e)),
        };
        if txt.trim().is_empty() {
            return Ok(RawMap::new());
        }
        // Never fall back to "empty" on a corrupt file: the next write would
        // silently erase every record in it.
        serde_json::from_str::<RawMap>(&txt).map_err(|e| Error::storage(&self.path, e))
    }

    fn save(&self, map: &RawMap) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::storage(parent, e))?;
        }
        let txt = serde_json::to_string_pretty(map)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, txt).map_err(|e| Error::storage(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| Error::storage(&self.path, e))?;
        Ok(())
    }

    fn decode(&self, key: &str, raw: &Value) -> Option<V> {
        match serde_json::from_value::<V>(raw.clone()) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!("[STORE] {}: skipping undecodable entry {key}: {e}", self.name);
                None
            }
        }
    }
}
