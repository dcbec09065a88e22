use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::fs as async_fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use crate::body::Body;
use crate::cache::entry::StoredEntry;
use crate::cache::key::CacheKey;

use super::{
    EntityStore, MetaStore, WrittenEntity, headers_to_pairs, pairs_to_headers, upsert_entry,
};

const TEMP_PREFIX: &str = "tmp_";
const META_EXTENSION: &str = "meta";

#[derive(Debug, Serialize, Deserialize)]
struct PersistedRecord {
    key: String,
    entries: Vec<PersistedEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    status: u16,
    request_headers: Vec<(String, String)>,
    response_headers: Vec<(String, String)>,
}

impl PersistedEntry {
    fn from_entry(entry: &StoredEntry) -> Self {
        Self {
            status: entry.status.as_u16(),
            request_headers: headers_to_pairs(&entry.request_headers),
            response_headers: headers_to_pairs(&entry.response_headers),
        }
    }

    fn into_entry(self) -> StoredEntry {
        StoredEntry {
            request_headers: pairs_to_headers(&self.request_headers),
            status: http::StatusCode::from_u16(self.status).unwrap_or(http::StatusCode::OK),
            response_headers: pairs_to_headers(&self.response_headers),
        }
    }
}

/// `ab/cd/<name>` fan-out so no directory collects every entry.
fn shard_path(dir: &Path, name: &str) -> PathBuf {
    let (first, remainder) = name.split_at(2);
    let (second, _) = remainder.split_at(2);
    dir.join(first).join(second).join(name)
}

fn valid_address(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

async fn prepare_dir(dir: &Path) -> Result<()> {
    async_fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create store dir {}", dir.display()))?;
    remove_temp_files(dir).await
}

/// Orphaned temp files are leftovers from interrupted writes; they are never
/// referenced and can go at startup.
async fn remove_temp_files(dir: &Path) -> Result<()> {
    let mut entries = match async_fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        if entry.file_type().await?.is_file()
            && name.to_string_lossy().starts_with(TEMP_PREFIX)
        {
            let _ = async_fs::remove_file(entry.path()).await;
        }
    }
    Ok(())
}

async fn open_temp_file(path: &Path) -> Result<async_fs::File> {
    let mut options = async_fs::OpenOptions::new();
    options.create(true).truncate(true).write(true);
    #[cfg(unix)]
    {
        options.mode(0o600);
    }
    options
        .open(path)
        .await
        .with_context(|| format!("failed to open temp file {}", path.display()))
}

/// Metadata store persisting one JSON record per cache key. A single lock
/// serializes the read-modify-write cycles so prepend order stays defined.
#[derive(Debug)]
pub struct DiskMetaStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

impl DiskMetaStore {
    pub async fn open(dir: PathBuf) -> Result<Self> {
        prepare_dir(&dir).await?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
        })
    }

    fn record_path(&self, key: &CacheKey) -> PathBuf {
        let mut path = shard_path(&self.dir, key.address());
        path.set_extension(META_EXTENSION);
        path
    }

    /// Reads the record for a key, purging anything malformed: a metadata
    /// file the store cannot parse is treated as if it never existed.
    async fn read_record(&self, key: &CacheKey) -> Vec<StoredEntry> {
        let path = self.record_path(key);
        let data = match async_fs::read(&path).await {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                warn!(error = %err, path = %path.display(), "failed to read cache metadata");
                return Vec::new();
            }
        };
        let record: PersistedRecord = match serde_json::from_slice(&data) {
            Ok(record) => record,
            Err(err) => {
                warn!(error = %err, path = %path.display(), "malformed cache metadata; purging");
                let _ = async_fs::remove_file(&path).await;
                return Vec::new();
            }
        };
        if record.key != key.text() {
            warn!(
                expected = key.text(),
                actual = %record.key,
                "cache metadata key mismatch; purging"
            );
            let _ = async_fs::remove_file(&path).await;
            return Vec::new();
        }
        record
            .entries
            .into_iter()
            .map(PersistedEntry::into_entry)
            .collect()
    }

    async fn write_record(&self, key: &CacheKey, entries: &[StoredEntry]) -> Result<()> {
        let record = PersistedRecord {
            key: key.text().to_string(),
            entries: entries.iter().map(PersistedEntry::from_entry).collect(),
        };
        let data = serde_json::to_vec(&record)?;

        let temp_path = self.dir.join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()));
        let mut file = open_temp_file(&temp_path).await?;
        if let Err(err) = async {
            file.write_all(&data).await?;
            file.flush().await?;
            Ok::<(), std::io::Error>(())
        }
        .await
        {
            let _ = async_fs::remove_file(&temp_path).await;
            return Err(err).context("failed to write cache metadata");
        }
        drop(file);

        let final_path = self.record_path(key);
        if let Some(parent) = final_path.parent() {
            async_fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create shard {}", parent.display()))?;
        }
        if let Err(err) = async_fs::rename(&temp_path, &final_path).await {
            let _ = async_fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!("failed to publish cache metadata {}", final_path.display())
            });
        }
        Ok(())
    }
}

#[async_trait]
impl MetaStore for DiskMetaStore {
    async fn lookup(&self, key: &CacheKey) -> Result<Vec<StoredEntry>> {
        Ok(self.read_record(key).await)
    }

    async fn store(&self, key: &CacheKey, entry: StoredEntry) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut entries = self.read_record(key).await;
        upsert_entry(&mut entries, entry);
        self.write_record(key, &entries).await
    }

    async fn purge(&self, key: &CacheKey) -> Result<()> {
        let _guard = self.lock.lock().await;
        match async_fs::remove_file(self.record_path(key)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn snapshot(&self) -> Result<BTreeMap<String, Vec<StoredEntry>>> {
        let mut contents = BTreeMap::new();
        let mut shard1_entries = match async_fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(contents),
            Err(err) => return Err(err.into()),
        };
        while let Some(shard1) = shard1_entries.next_entry().await? {
            if !shard1.file_type().await?.is_dir() {
                continue;
            }
            let mut shard2_entries = async_fs::read_dir(shard1.path()).await?;
            while let Some(shard2) = shard2_entries.next_entry().await? {
                if !shard2.file_type().await?.is_dir() {
                    continue;
                }
                let mut files = async_fs::read_dir(shard2.path()).await?;
                while let Some(file) = files.next_entry().await? {
                    let path = file.path();
                    if path.extension().and_then(|ext| ext.to_str()) != Some(META_EXTENSION) {
                        continue;
                    }
                    let data = match async_fs::read(&path).await {
                        Ok(data) => data,
                        Err(_) => continue,
                    };
                    let Ok(record) = serde_json::from_slice::<PersistedRecord>(&data) else {
                        continue;
                    };
                    contents.insert(
                        record.key,
                        record
                            .entries
                            .into_iter()
                            .map(PersistedEntry::into_entry)
                            .collect(),
                    );
                }
            }
        }
        Ok(contents)
    }
}

/// Content-addressed body store on disk: one file per digest under the
/// sharded layout, written via temp file + rename so partial writes never
/// become visible.
#[derive(Debug)]
pub struct DiskEntityStore {
    dir: PathBuf,
}

impl DiskEntityStore {
    pub async fn open(dir: PathBuf) -> Result<Self> {
        prepare_dir(&dir).await?;
        Ok(Self { dir })
    }

    fn body_path(&self, digest: &str) -> Result<PathBuf> {
        if !valid_address(digest) {
            bail!("invalid entity digest {digest:?}");
        }
        Ok(shard_path(&self.dir, digest))
    }
}

#[async_trait]
impl EntityStore for DiskEntityStore {
    async fn write(&self, body: &mut Body) -> Result<WrittenEntity> {
        let temp_path = self.dir.join(format!("{TEMP_PREFIX}{}", uuid::Uuid::new_v4()));
        let mut file = open_temp_file(&temp_path).await?;

        let written = async {
            let mut hasher = blake3::Hasher::new();
            let mut length = 0u64;
            while let Some(chunk) = body.chunk().await? {
                hasher.update(&chunk);
                file.write_all(&chunk).await?;
                length = length.saturating_add(chunk.len() as u64);
            }
            file.flush().await?;
            Ok::<WrittenEntity, anyhow::Error>(WrittenEntity {
                digest: hasher.finalize().to_hex().to_string(),
                length,
            })
        }
        .await;

        let written = match written {
            Ok(written) => written,
            Err(err) => {
                let _ = async_fs::remove_file(&temp_path).await;
                return Err(err).context("failed to write entity body");
            }
        };
        drop(file);

        let final_path = self.body_path(&written.digest)?;
        if let Some(parent) = final_path.parent() {
            async_fs::create_dir_all(parent).await?;
        }
        match async_fs::metadata(&final_path).await {
            // Same digest, same bytes: keep the existing file.
            Ok(_) => {
                let _ = async_fs::remove_file(&temp_path).await;
            }
            Err(_) => {
                if let Err(err) = async_fs::rename(&temp_path, &final_path).await {
                    let _ = async_fs::remove_file(&temp_path).await;
                    return Err(err).with_context(|| {
                        format!("failed to publish entity body {}", final_path.display())
                    });
                }
            }
        }
        Ok(written)
    }

    async fn read(&self, digest: &str) -> Result<Option<Bytes>> {
        let path = self.body_path(digest)?;
        match async_fs::read(&path).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("failed to read entity {digest}")),
        }
    }

    async fn purge(&self, digest: &str) -> Result<()> {
        let path = self.body_path(digest)?;
        match async_fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
