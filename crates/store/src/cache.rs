//! Directory-backed model cache.
//!
//! One blob file plus one JSON metadata file per entry, both staged to
//! `*.tmp` and renamed into place. The metadata rename is the commit point:
//! an entry is visible only once its bytes are fully written (and, for
//! checksummed entries, verified by the writer). Entries under the
//! `__temp_<id>` keyspace are invisible to lookups of the final id.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Prefix of the temp keyspace used for staged downloads.
pub const TEMP_PREFIX: &str = "__temp_";

/// Metadata persisted next to each blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntryMeta {
    /// Model id (the cache key).
    pub model_id: String,
    /// Unix timestamp of the commit.
    pub committed_at: i64,
    /// Blob length in bytes. Always equals the blob file's size.
    pub size_bytes: u64,
    /// File format tag (e.g. "gguf").
    pub format: String,
    /// Precision tag (e.g. "q4_k_m").
    pub precision: String,
    /// SHA-256 as lower-case hex, when declared by the descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// A cached entry, copied out of the store.
#[derive(Debug, Clone)]
pub struct CachedModel {
    /// Entry metadata.
    pub meta: CacheEntryMeta,
    /// Blob bytes.
    pub data: Vec<u8>,
}

/// Filesystem quota estimate for the cache volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaEstimate {
    /// Bytes used by committed cache entries.
    pub used_bytes: u64,
    /// Volume capacity; 0 when the platform reports nothing.
    pub total_bytes: u64,
    /// Bytes available to this process; 0 when unknown.
    pub available_bytes: u64,
}

/// Key -> blob store for model bytes.
#[derive(Debug, Clone)]
pub struct ModelCache {
    root: PathBuf,
}

/// Encode an id into a filesystem-safe file stem. One-way; the real id lives
/// in the metadata file.
fn file_key(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for b in id.bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' => out.push(b as char),
            other => {
                use std::fmt::Write as _;
                let _ = write!(out, "%{other:02X}");
            }
        }
    }
    out
}

fn xdg_data_home() -> Result<PathBuf, StoreError> {
    if let Some(dir) = std::env::var_os("XDG_DATA_HOME") {
        let dir = PathBuf::from(dir);
        if !dir.as_os_str().is_empty() {
            return Ok(dir);
        }
    }
    let home = std::env::var_os("HOME").ok_or_else(|| {
        StoreError::CacheWrite(std::io::Error::other("HOME is not set"))
    })?;
    Ok(PathBuf::from(home).join(".local").join("share"))
}

impl ModelCache {
    /// Open (creating if needed) the cache for `namespace` under the user
    /// data directory.
    pub fn open(namespace: &str) -> Result<Self, StoreError> {
        let root = xdg_data_home()?
            .join("edgerun")
            .join(namespace)
            .join("models");
        Self::open_at(root)
    }

    /// Open a cache rooted at an explicit directory.
    pub fn open_at(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Directory this cache stores entries in.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The temp-keyspace id for `id`.
    pub fn temp_id(id: &str) -> String {
        format!("{TEMP_PREFIX}{id}")
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.bin", file_key(id)))
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.json", file_key(id)))
    }

    /// Store an entry atomically under `meta.model_id`.
    ///
    /// A concurrent `get` of the same id sees either the full prior entry or
    /// the full new one, never a partial blob.
    pub async fn put(&self, mut meta: CacheEntryMeta, data: Vec<u8>) -> Result<(), StoreError> {
        meta.size_bytes = data.len() as u64;
        let blob_path = self.blob_path(&meta.model_id);
        let meta_path = self.meta_path(&meta.model_id);

        tokio::task::spawn_blocking(move || write_entry(&blob_path, &meta_path, &meta, &data))
            .await
            .map_err(|err| StoreError::CacheWrite(std::io::Error::other(err)))?
    }

    /// Load an entry. Returns `None` for unknown ids and for entries whose
    /// blob no longer matches its metadata (those are scrubbed).
    pub async fn get(&self, id: &str) -> Result<Option<CachedModel>, StoreError> {
        let blob_path = self.blob_path(id);
        let meta_path = self.meta_path(id);
        let id = id.to_string();

        tokio::task::spawn_blocking(move || read_entry(&id, &blob_path, &meta_path))
            .await
            .map_err(|err| StoreError::CacheWrite(std::io::Error::other(err)))?
    }

    /// Remove an entry. Returns whether anything was removed.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let blob_path = self.blob_path(id);
        let meta_path = self.meta_path(id);

        tokio::task::spawn_blocking(move || {
            let had_meta = remove_if_exists(&meta_path)?;
            let had_blob = remove_if_exists(&blob_path)?;
            Ok(had_meta || had_blob)
        })
        .await
        .map_err(|err| StoreError::CacheWrite(std::io::Error::other(err)))?
    }

    /// Metadata of all committed entries, temp keyspace excluded.
    pub async fn list(&self) -> Result<Vec<CacheEntryMeta>, StoreError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || list_entries(&root))
            .await
            .map_err(|err| StoreError::CacheWrite(std::io::Error::other(err)))?
    }

    /// Remove every entry, temp keyspace included.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            for entry in std::fs::read_dir(&root)? {
                let path = entry?.path();
                if path.is_file() {
                    remove_if_exists(&path)?;
                }
            }
            Ok(())
        })
        .await
        .map_err(|err| StoreError::CacheWrite(std::io::Error::other(err)))?
    }

    /// Total bytes held by committed entries.
    pub async fn total_size(&self) -> Result<u64, StoreError> {
        Ok(self.list().await?.iter().map(|m| m.size_bytes).sum())
    }

    /// Quota estimate for the volume holding the cache.
    pub async fn estimate_quota(&self) -> Result<QuotaEstimate, StoreError> {
        let used_bytes = self.total_size().await?;
        let (total_bytes, available_bytes) = volume_stats(&self.root)?;
        Ok(QuotaEstimate {
            used_bytes,
            total_bytes,
            available_bytes,
        })
    }
}

fn remove_if_exists(path: &Path) -> Result<bool, StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

fn write_entry(
    blob_path: &Path,
    meta_path: &Path,
    meta: &CacheEntryMeta,
    data: &[u8],
) -> Result<(), StoreError> {
    let blob_tmp = blob_path.with_extension("bin.tmp");
    let meta_tmp = meta_path.with_extension("json.tmp");

    std::fs::write(&blob_tmp, data)?;
    std::fs::write(&meta_tmp, serde_json::to_string_pretty(meta)?)?;

    // Blob first, metadata last: the metadata rename is the commit point.
    std::fs::rename(&blob_tmp, blob_path)?;
    std::fs::rename(&meta_tmp, meta_path)?;
    Ok(())
}

fn read_entry(
    id: &str,
    blob_path: &Path,
    meta_path: &Path,
) -> Result<Option<CachedModel>, StoreError> {
    let raw = match std::fs::read_to_string(meta_path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let meta: CacheEntryMeta = match serde_json::from_str(&raw) {
        Ok(meta) => meta,
        Err(err) => {
            tracing::warn!(id, error = %err, "scrubbing cache entry with unreadable metadata");
            remove_if_exists(meta_path)?;
            remove_if_exists(blob_path)?;
            return Ok(None);
        }
    };

    let data = match std::fs::read(blob_path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(id, "scrubbing cache metadata with no blob");
            remove_if_exists(meta_path)?;
            return Ok(None);
        }
        Err(err) => return Err(err.into()),
    };

    if data.len() as u64 != meta.size_bytes {
        tracing::warn!(
            id,
            expected = meta.size_bytes,
            actual = data.len(),
            "scrubbing cache entry with mismatched blob length"
        );
        remove_if_exists(meta_path)?;
        remove_if_exists(blob_path)?;
        return Ok(None);
    }

    Ok(Some(CachedModel { meta, data }))
}

fn list_entries(root: &Path) -> Result<Vec<CacheEntryMeta>, StoreError> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };
        let meta: CacheEntryMeta = match serde_json::from_str(&raw) {
            Ok(meta) => meta,
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "skipping unreadable cache metadata");
                continue;
            }
        };
        if meta.model_id.starts_with(TEMP_PREFIX) {
            continue;
        }
        out.push(meta);
    }
    out.sort_by(|a, b| a.model_id.cmp(&b.model_id));
    Ok(out)
}

#[cfg(unix)]
fn volume_stats(path: &Path) -> Result<(u64, u64), StoreError> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|err| StoreError::CacheWrite(std::io::Error::other(err)))?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is a valid NUL-terminated path and stat is a valid
    // out-pointer for the duration of the call.
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } != 0 {
        return Err(StoreError::CacheWrite(std::io::Error::last_os_error()));
    }
    let frsize = stat.f_frsize as u64;
    Ok((stat.f_blocks as u64 * frsize, stat.f_bavail as u64 * frsize))
}

#[cfg(not(unix))]
fn volume_stats(_path: &Path) -> Result<(u64, u64), StoreError> {
    // Unknown; callers treat 0 as "no estimate".
    Ok((0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(id: &str, size: u64) -> CacheEntryMeta {
        CacheEntryMeta {
            model_id: id.to_string(),
            committed_at: 1_700_000_000,
            size_bytes: size,
            format: "gguf".to_string(),
            precision: "q4_0".to_string(),
            sha256: None,
        }
    }

    fn cache() -> (tempfile::TempDir, ModelCache) {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = ModelCache::open_at(dir.path().join("models")).expect("open");
        (dir, cache)
    }

    #[tokio::test]
    async fn put_get_round_trip() {
        let (_dir, cache) = cache();
        let data = vec![7u8; 1024];

        cache.put(meta("m1", 0), data.clone()).await.expect("put");
        let entry = cache.get("m1").await.expect("get").expect("present");
        assert_eq!(entry.data, data);
        assert_eq!(entry.meta.size_bytes, 1024);

        assert!(cache.get("missing").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn temp_entries_are_invisible_to_final_lookups() {
        let (_dir, cache) = cache();
        let temp = ModelCache::temp_id("m1");

        cache.put(meta(&temp, 0), vec![1, 2, 3]).await.expect("put temp");

        assert!(cache.get("m1").await.expect("get").is_none());
        assert!(cache.get(&temp).await.expect("get temp").is_some());
        assert!(cache.list().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn list_and_total_size_cover_committed_entries_only() {
        let (_dir, cache) = cache();
        cache.put(meta("a", 0), vec![0; 10]).await.expect("put");
        cache.put(meta("b", 0), vec![0; 20]).await.expect("put");
        cache
            .put(meta(&ModelCache::temp_id("c"), 0), vec![0; 40])
            .await
            .expect("put temp");

        let listed = cache.list().await.expect("list");
        assert_eq!(
            listed.iter().map(|m| m.model_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(cache.total_size().await.expect("size"), 30);
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let (_dir, cache) = cache();
        cache.put(meta("a", 0), vec![0; 10]).await.expect("put");
        cache
            .put(meta(&ModelCache::temp_id("a"), 0), vec![0; 10])
            .await
            .expect("put temp");

        assert!(cache.delete("a").await.expect("delete"));
        assert!(!cache.delete("a").await.expect("delete again"));
        assert!(cache.get("a").await.expect("get").is_none());

        cache.clear().await.expect("clear");
        assert!(
            cache
                .get(&ModelCache::temp_id("a"))
                .await
                .expect("get temp")
                .is_none()
        );
    }

    #[tokio::test]
    async fn overwrite_replaces_the_entry_atomically() {
        let (_dir, cache) = cache();
        cache.put(meta("m", 0), vec![1; 8]).await.expect("put");
        cache.put(meta("m", 0), vec![2; 16]).await.expect("overwrite");

        let entry = cache.get("m").await.expect("get").expect("present");
        assert_eq!(entry.data, vec![2; 16]);
    }

    #[tokio::test]
    async fn mismatched_blob_length_is_scrubbed() {
        let (_dir, cache) = cache();
        cache.put(meta("m", 0), vec![1; 8]).await.expect("put");

        // Corrupt the blob behind the cache's back.
        std::fs::write(cache.root().join("m.bin"), vec![1; 4]).expect("truncate");

        assert!(cache.get("m").await.expect("get").is_none());
        // Both files are gone after the scrub.
        assert!(cache.get("m").await.expect("get").is_none());
        assert!(cache.list().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn staged_tmp_files_are_not_visible() {
        let (_dir, cache) = cache();
        // Simulate a crash between staging and rename.
        std::fs::write(cache.root().join("m.bin.tmp"), vec![9; 8]).expect("stage blob");
        std::fs::write(
            cache.root().join("m.json.tmp"),
            serde_json::to_string(&meta("m", 8)).expect("json"),
        )
        .expect("stage meta");

        assert!(cache.get("m").await.expect("get").is_none());
        assert!(cache.list().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn ids_with_path_characters_are_stored_safely() {
        let (_dir, cache) = cache();
        let id = "org/model:v1";
        cache.put(meta(id, 0), vec![3; 6]).await.expect("put");

        let entry = cache.get(id).await.expect("get").expect("present");
        assert_eq!(entry.meta.model_id, id);
        assert!(cache.get("org").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn quota_reports_cache_usage() {
        let (_dir, cache) = cache();
        cache.put(meta("m", 0), vec![0; 100]).await.expect("put");

        let quota = cache.estimate_quota().await.expect("quota");
        assert_eq!(quota.used_bytes, 100);
        #[cfg(unix)]
        assert!(quota.total_bytes > 0);
    }
}
