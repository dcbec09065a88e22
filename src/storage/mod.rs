use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};

use crate::body::Body;
use crate::cache::entry::StoredEntry;
use crate::cache::key::CacheKey;

pub mod disk;
pub mod heap;

/// Receipt for a body persisted in an entity store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenEntity {
    pub digest: String,
    pub length: u64,
}

/// Metadata store: cache key → ordered variant list, newest first. Writes to
/// the same key serialize, so the prepend order is well-defined across
/// concurrent requests.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// All stored variants for the key, newest first.
    async fn lookup(&self, key: &CacheKey) -> Result<Vec<StoredEntry>>;

    /// Prepends a variant, replacing any older entry covering the same vary
    /// combination.
    async fn store(&self, key: &CacheKey, entry: StoredEntry) -> Result<()>;

    /// Removes every variant stored under the key.
    async fn purge(&self, key: &CacheKey) -> Result<()>;

    /// Diagnostic dump of the entire store contents, keyed by cache key text.
    async fn snapshot(&self) -> Result<BTreeMap<String, Vec<StoredEntry>>>;
}

/// Content-addressed body store. The digest of the bytes is the key, so
/// writes are idempotent.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Consumes the body chunk-by-chunk through a digesting writer. The
    /// entry becomes visible only once every byte has been digested.
    async fn write(&self, body: &mut Body) -> Result<WrittenEntity>;

    /// A fresh copy of the stored bytes, or `None` when the digest is
    /// unknown.
    async fn read(&self, digest: &str) -> Result<Option<Bytes>>;

    /// Removes the body; absent digests are not an error.
    async fn purge(&self, digest: &str) -> Result<()>;
}

pub fn digest_hex(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Prepend-and-replace shared by the meta store backends: one entry per vary
/// combination, newest first.
pub(crate) fn upsert_entry(entries: &mut Vec<StoredEntry>, entry: StoredEntry) {
    entries.retain(|existing| !existing.same_variant(&entry));
    entries.insert(0, entry);
}

/// Flattens a header map into serializable pairs. Values that are not valid
/// UTF-8 have no JSON representation here and are dropped.
pub(crate) fn headers_to_pairs(map: &HeaderMap) -> Vec<(String, String)> {
    map.iter()
        .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
        .collect()
}

/// Rebuilds a header map from persisted pairs, appending so repeated names
/// (`Set-Cookie` and friends) keep every value. Pairs that no longer parse
/// as header material are dropped.
pub(crate) fn pairs_to_headers(pairs: &[(String, String)]) -> HeaderMap {
    let parsed = pairs.iter().filter_map(|(name, value)| {
        let name = HeaderName::from_bytes(name.as_bytes()).ok()?;
        let value = HeaderValue::from_str(value).ok()?;
        Some((name, value))
    });

    let mut map = HeaderMap::with_capacity(pairs.len());
    for (name, value) in parsed {
        map.append(name, value);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderValue, StatusCode};

    fn entry(variant: Option<(&'static str, &'static str)>, marker: &'static str) -> StoredEntry {
        let mut request_headers = HeaderMap::new();
        let mut response_headers = HeaderMap::new();
        if let Some((name, value)) = variant {
            request_headers.insert(name, HeaderValue::from_static(value));
            response_headers.insert(http::header::VARY, HeaderValue::from_static("user-agent"));
        }
        response_headers.insert("x-marker", HeaderValue::from_static(marker));
        StoredEntry {
            request_headers,
            status: StatusCode::OK,
            response_headers,
        }
    }

    #[test]
    fn upsert_replaces_same_variant() {
        let mut entries = vec![entry(None, "old")];
        upsert_entry(&mut entries, entry(None, "new"));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].response_headers["x-marker"], "new");
    }

    #[test]
    fn upsert_keeps_distinct_variants_newest_first() {
        let mut entries = vec![entry(Some(("user-agent", "mobile")), "mobile")];
        upsert_entry(&mut entries, entry(Some(("user-agent", "desktop")), "desktop"));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].response_headers["x-marker"], "desktop");
        assert_eq!(entries[1].response_headers["x-marker"], "mobile");
    }

    #[test]
    fn header_pairs_round_trip() {
        let mut map = HeaderMap::new();
        map.insert("content-type", HeaderValue::from_static("text/plain"));
        map.append("set-cookie", HeaderValue::from_static("a=1"));
        map.append("set-cookie", HeaderValue::from_static("b=2"));
        let restored = pairs_to_headers(&headers_to_pairs(&map));
        assert_eq!(restored.get("content-type").unwrap(), "text/plain");
        assert_eq!(restored.get_all("set-cookie").iter().count(), 2);
    }
}
