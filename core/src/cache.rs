//! Bulk payload cache: a durable store plus a small metadata store.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use time::format_description::well_known::Rfc3339;

use crate::error::CacheError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Vec<u8>,
    /// RFC 3339
    pub stored_at: String,
    /// sha1 of `payload`, hex.
    pub digest: String,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, payload: Vec<u8>) -> Self {
        let digest = digest(&payload);
        Self { key: key.into(), payload, stored_at: now_rfc3339(), digest }
    }

    pub fn is_intact(&self) -> bool { digest(&self.payload) == self.digest }
}

/// Freshness record kept next to each bulk entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedMetadata {
    pub version: String,
    pub generated_at: String,
    pub cached_at: String,
    /// ETag or Last-Modified the payload was served with.
    #[serde(default)]
    pub validator: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
}

pub fn digest(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub(crate) fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

#[async_trait]
pub trait BulkStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;
    /// Replaces any previous entry for the key, or fails leaving it untouched.
    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError>;
    async fn invalidate(&self, key: &str) -> Result<(), CacheError>;
}

pub trait MetadataStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<CachedMetadata>, CacheError>;
    fn put(&self, key: &str, meta: &CachedMetadata) -> Result<(), CacheError>;
    fn remove(&self, key: &str) -> Result<(), CacheError>;
}

// --- sled ---

/// Durable bulk store on sled. Blocking sled calls run on the blocking pool.
#[derive(Clone)]
pub struct SledBulkStore {
    db: sled::Db,
    max_bytes: Option<usize>,
}

impl SledBulkStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let db = sled::open(path)?;
        Ok(Self { db, max_bytes: None })
    }

    /// Reject writes that would grow the stored payloads past `max_bytes`.
    pub fn with_quota(mut self, max_bytes: usize) -> Self {
        self.max_bytes = Some(max_bytes);
        self
    }
}

async fn blocking<T, F>(f: F) -> Result<T, CacheError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CacheError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CacheError::Unavailable(e.to_string()))?
}

#[async_trait]
impl BulkStore for SledBulkStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let db = self.db.clone();
        let key = key.to_string();
        blocking(move || match db.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        })
        .await
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let db = self.db.clone();
        let max_bytes = self.max_bytes;
        blocking(move || {
            let bytes = bincode::serialize(&entry)?;
            if let Some(limit) = max_bytes {
                let mut others = 0usize;
                for item in db.iter() {
                    let (k, v) = item?;
                    if k.as_ref() != entry.key.as_bytes() {
                        others += v.len();
                    }
                }
                if others + bytes.len() > limit {
                    return Err(CacheError::QuotaExceeded { needed: others + bytes.len(), limit });
                }
            }
            db.insert(entry.key.as_bytes(), bytes)?;
            Ok(())
        })
        .await?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        let db = self.db.clone();
        let key = key.to_string();
        blocking(move || {
            db.remove(key.as_bytes())?;
            Ok(())
        })
        .await?;
        self.db.flush_async().await?;
        Ok(())
    }
}

// --- in memory ---

/// Bulk store held in memory, with an optional quota and an off switch.
#[derive(Default)]
pub struct MemoryBulkStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
    max_bytes: Option<usize>,
    unavailable: AtomicBool,
}

impl MemoryBulkStore {
    pub fn new() -> Self { Self::default() }

    pub fn with_quota(max_bytes: usize) -> Self {
        Self { max_bytes: Some(max_bytes), ..Self::default() }
    }

    /// While set, every operation fails with [`CacheError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) { self.unavailable.store(unavailable, Ordering::SeqCst) }

    /// Flip a payload byte without touching the digest.
    pub fn tamper(&self, key: &str) -> bool {
        match self.entries.write().get_mut(key) {
            Some(entry) if !entry.payload.is_empty() => {
                entry.payload[0] ^= 0xff;
                true
            }
            _ => false,
        }
    }

    pub fn contains(&self, key: &str) -> bool { self.entries.read().contains_key(key) }

    fn check(&self) -> Result<(), CacheError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CacheError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl BulkStore for MemoryBulkStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        self.check()?;
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, entry: CacheEntry) -> Result<(), CacheError> {
        self.check()?;
        let mut entries = self.entries.write();
        if let Some(limit) = self.max_bytes {
            let others: usize = entries.iter().filter(|(k, _)| **k != entry.key).map(|(_, e)| e.payload.len()).sum();
            let needed = others + entry.payload.len();
            if needed > limit {
                return Err(CacheError::QuotaExceeded { needed, limit });
            }
        }
        entries.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn invalidate(&self, key: &str) -> Result<(), CacheError> {
        self.check()?;
        self.entries.write().remove(key);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryMetadataStore {
    entries: RwLock<HashMap<String, CachedMetadata>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self { Self::default() }
}

impl MetadataStore for MemoryMetadataStore {
    fn get(&self, key: &str) -> Result<Option<CachedMetadata>, CacheError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, meta: &CachedMetadata) -> Result<(), CacheError> {
        self.entries.write().insert(key.to_string(), meta.clone());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries.write().remove(key);
        Ok(())
    }
}

// --- json file ---

/// All metadata records in one small JSON file, replaced atomically on write.
pub struct JsonMetadataStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonMetadataStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf(), lock: Mutex::new(()) }
    }

    fn read_all(&self) -> Result<BTreeMap<String, CachedMetadata>, CacheError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, all: &BTreeMap<String, CachedMetadata>) -> Result<(), CacheError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&serde_json::to_vec_pretty(all)?)?;
        f.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl MetadataStore for JsonMetadataStore {
    fn get(&self, key: &str) -> Result<Option<CachedMetadata>, CacheError> {
        let _guard = self.lock.lock();
        Ok(self.read_all()?.remove(key))
    }

    fn put(&self, key: &str, meta: &CachedMetadata) -> Result<(), CacheError> {
        let _guard = self.lock.lock();
        let mut all = self.read_all().unwrap_or_default();
        all.insert(key.to_string(), meta.clone());
        self.write_all(&all)
    }

    fn remove(&self, key: &str) -> Result<(), CacheError> {
        let _guard = self.lock.lock();
        let mut all = self.read_all().unwrap_or_default();
        if all.remove(key).is_some() {
            self.write_all(&all)?;
        }
        Ok(())
    }
}

// --- facade ---

/// Bulk and metadata stores behind one interface that never fails: store
/// errors are logged and reported as misses.
#[derive(Clone)]
pub struct PersistentCache {
    bulk: Arc<dyn BulkStore>,
    meta: Arc<dyn MetadataStore>,
}

impl PersistentCache {
    pub fn new(bulk: Arc<dyn BulkStore>, meta: Arc<dyn MetadataStore>) -> Self { Self { bulk, meta } }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBulkStore::new()), Arc::new(MemoryMetadataStore::new()))
    }

    /// sled database under `dir/bulk` and metadata file `dir/meta.json`.
    pub fn open_dir<P: AsRef<Path>>(dir: P) -> Result<Self, CacheError> {
        let dir = dir.as_ref();
        let bulk = SledBulkStore::open(dir.join("bulk"))?;
        Ok(Self::new(Arc::new(bulk), Arc::new(JsonMetadataStore::new(dir.join("meta.json")))))
    }

    pub fn metadata(&self, key: &str) -> Option<CachedMetadata> {
        match self.meta.get(key) {
            Ok(meta) => meta,
            Err(e) => {
                tracing::warn!(key, error = %e, "metadata store read failed; treating as miss");
                None
            }
        }
    }

    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        match self.bulk.get(key).await {
            Ok(Some(entry)) if entry.is_intact() => Some(entry),
            Ok(Some(_)) => {
                tracing::warn!(key, error = %CacheError::Corrupted(key.to_string()), "discarding cache entry");
                None
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(key, error = %e, "bulk store read failed; treating as miss");
                None
            }
        }
    }

    /// Store `payload` and its metadata. The metadata record is only written
    /// once the payload is in place.
    pub async fn put(&self, key: &str, payload: Vec<u8>, meta: CachedMetadata) -> bool {
        let size = payload.len();
        if let Err(e) = self.bulk.put(CacheEntry::new(key, payload)).await {
            tracing::warn!(key, size, error = %e, "bulk store write failed; payload not cached");
            if let Err(e) = self.meta.remove(key) {
                tracing::warn!(key, error = %e, "metadata cleanup failed");
            }
            return false;
        }
        if let Err(e) = self.meta.put(key, &meta) {
            tracing::warn!(key, error = %e, "metadata store write failed");
            return false;
        }
        tracing::debug!(key, size, "cached payload");
        true
    }

    pub async fn invalidate(&self, key: &str) {
        if let Err(e) = self.meta.remove(key) {
            tracing::warn!(key, error = %e, "metadata remove failed");
        }
        if let Err(e) = self.bulk.invalidate(key).await {
            tracing::warn!(key, error = %e, "bulk invalidate failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(version: &str) -> CachedMetadata {
        CachedMetadata {
            version: version.into(),
            generated_at: "2020-01-01T00:00:00Z".into(),
            cached_at: now_rfc3339(),
            validator: Some("\"etag-1\"".into()),
            last_modified: None,
        }
    }

    #[tokio::test]
    async fn put_then_get_replaces_whole_entry() {
        let cache = PersistentCache::in_memory();
        assert!(cache.put("k", b"first".to_vec(), meta("v1")).await);
        assert!(cache.put("k", b"second".to_vec(), meta("v2")).await);
        assert_eq!(cache.get("k").await.unwrap().payload, b"second");
        assert_eq!(cache.metadata("k").unwrap().version, "v2");
        cache.invalidate("k").await;
        assert!(cache.get("k").await.is_none());
        assert!(cache.metadata("k").is_none());
    }

    #[tokio::test]
    async fn quota_failure_is_a_miss_not_an_error() {
        let bulk = Arc::new(MemoryBulkStore::with_quota(8));
        let cache = PersistentCache::new(bulk.clone(), Arc::new(MemoryMetadataStore::new()));
        assert!(!cache.put("k", vec![0u8; 64], meta("v1")).await);
        assert!(cache.get("k").await.is_none());
        assert!(cache.metadata("k").is_none());
        assert!(!bulk.contains("k"));
    }

    #[tokio::test]
    async fn unavailable_store_degrades_to_miss() {
        let bulk = Arc::new(MemoryBulkStore::new());
        let cache = PersistentCache::new(bulk.clone(), Arc::new(MemoryMetadataStore::new()));
        assert!(cache.put("k", b"data".to_vec(), meta("v1")).await);
        bulk.set_unavailable(true);
        assert!(cache.get("k").await.is_none());
        bulk.set_unavailable(false);
        assert!(cache.get("k").await.is_some());
    }

    #[tokio::test]
    async fn tampered_entry_is_discarded() {
        let bulk = Arc::new(MemoryBulkStore::new());
        let cache = PersistentCache::new(bulk.clone(), Arc::new(MemoryMetadataStore::new()));
        cache.put("k", b"data".to_vec(), meta("v1")).await;
        assert!(bulk.tamper("k"));
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn sled_backed_cache_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::open_dir(dir.path()).unwrap();
        assert!(cache.put("index", b"payload".to_vec(), meta("v1")).await);
        let entry = cache.get("index").await.unwrap();
        assert_eq!(entry.payload, b"payload");
        assert_eq!(entry.digest, digest(b"payload"));
        let stored = cache.metadata("index").unwrap();
        assert_eq!(stored.version, "v1");
        assert_eq!(stored.validator.as_deref(), Some("\"etag-1\""));
        assert!(dir.path().join("meta.json").exists());
        cache.invalidate("index").await;
        assert!(cache.get("index").await.is_none());
    }

    #[tokio::test]
    async fn sled_quota_rejects_oversized_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledBulkStore::open(dir.path()).unwrap().with_quota(16);
        let err = store.put(CacheEntry::new("k", vec![1u8; 1024])).await.unwrap_err();
        assert!(matches!(err, CacheError::QuotaExceeded { .. }));
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[test]
    fn json_metadata_store_survives_corrupt_file_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("meta.json");
        fs::write(&path, b"{not json").unwrap();
        let store = JsonMetadataStore::new(&path);
        assert!(store.get("k").is_err());
        store.put("k", &meta("v1")).unwrap();
        assert_eq!(store.get("k").unwrap().unwrap().version, "v1");
        store.remove("k").unwrap();
        assert!(store.get("k").unwrap().is_none());
    }
}
