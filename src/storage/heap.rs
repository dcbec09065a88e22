use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;

use crate::body::Body;
use crate::cache::entry::StoredEntry;
use crate::cache::key::CacheKey;

use super::{EntityStore, MetaStore, WrittenEntity, upsert_entry};

/// In-process metadata store bounded by key count; least recently used keys
/// fall out when the bound is hit.
#[derive(Debug)]
pub struct HeapMetaStore {
    entries: Mutex<LruCache<String, Vec<StoredEntry>>>,
}

impl HeapMetaStore {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }
}

#[async_trait]
impl MetaStore for HeapMetaStore {
    async fn lookup(&self, key: &CacheKey) -> Result<Vec<StoredEntry>> {
        let mut guard = self.entries.lock();
        Ok(guard.get(key.text()).cloned().unwrap_or_default())
    }

    async fn store(&self, key: &CacheKey, entry: StoredEntry) -> Result<()> {
        let mut guard = self.entries.lock();
        match guard.get_mut(key.text()) {
            Some(entries) => upsert_entry(entries, entry),
            None => {
                guard.push(key.text().to_string(), vec![entry]);
            }
        }
        Ok(())
    }

    async fn purge(&self, key: &CacheKey) -> Result<()> {
        self.entries.lock().pop(key.text());
        Ok(())
    }

    async fn snapshot(&self) -> Result<BTreeMap<String, Vec<StoredEntry>>> {
        let guard = self.entries.lock();
        Ok(guard
            .iter()
            .map(|(key, entries)| (key.clone(), entries.clone()))
            .collect())
    }
}

/// In-process content-addressed body store.
#[derive(Debug, Default)]
pub struct HeapEntityStore {
    bodies: Mutex<HashMap<String, Bytes>>,
}

impl HeapEntityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for HeapEntityStore {
    async fn write(&self, body: &mut Body) -> Result<WrittenEntity> {
        let mut hasher = blake3::Hasher::new();
        let mut collected = Vec::new();
        while let Some(chunk) = body.chunk().await? {
            hasher.update(&chunk);
            collected.extend_from_slice(&chunk);
        }
        let digest = hasher.finalize().to_hex().to_string();
        let length = collected.len() as u64;
        self.bodies
            .lock()
            .entry(digest.clone())
            .or_insert_with(|| Bytes::from(collected));
        Ok(WrittenEntity { digest, length })
    }

    async fn read(&self, digest: &str) -> Result<Option<Bytes>> {
        Ok(self.bodies.lock().get(digest).cloned())
    }

    async fn purge(&self, digest: &str) -> Result<()> {
        self.bodies.lock().remove(digest);
        Ok(())
    }
}
