//! Streaming model downloader.
//!
//! Fetches a descriptor's bytes with progress, retries transient network
//! faults with exponential backoff, verifies the declared checksum, and
//! commits to the cache through the temp keyspace.

use std::time::Duration;

use tokio::time::Instant;

use edgerun_core::{CancelToken, ModelDescriptor};

use crate::cache::{CacheEntryMeta, ModelCache};
use crate::error::StoreError;
use crate::sha256_hex;

/// Progress of a single download.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DownloadProgress {
    /// Total bytes expected; 0 when the server does not say.
    pub total_bytes: u64,
    /// Bytes received so far.
    pub downloaded_bytes: u64,
    /// Rolling average speed since the attempt started.
    pub speed_bytes_per_second: f64,
    /// Remaining seconds at the current speed; `None` until speed is known.
    pub estimated_seconds_remaining: Option<f64>,
    /// Completion percentage. Capped at 99 until the cache commit; 100 is
    /// emitted exactly once, after commit.
    pub percentage: u8,
}

/// Downloader tunables.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Attempts per download, transient faults only.
    pub max_attempts: u32,
    /// Delay before retry `n` is `initial_retry_delay * 2^(n - 1)`.
    pub initial_retry_delay: Duration,
    /// Connect timeout for the HTTP client.
    pub connect_timeout: Duration,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            initial_retry_delay: Self::DEFAULT_INITIAL_RETRY_DELAY,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl DownloaderConfig {
    /// Default attempt budget.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    /// Default first retry delay.
    pub const DEFAULT_INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
}

/// Fetches model bytes into the cache.
pub struct ModelDownloader {
    http: reqwest::Client,
    cache: ModelCache,
    config: DownloaderConfig,
}

impl ModelDownloader {
    /// Downloader with default tunables.
    pub fn new(cache: ModelCache) -> Self {
        Self::with_config(cache, DownloaderConfig::default())
    }

    /// Downloader with explicit tunables.
    pub fn with_config(cache: ModelCache, config: DownloaderConfig) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http, cache, config }
    }

    /// The cache this downloader commits into.
    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    /// Return the model's bytes, downloading on a cache miss.
    ///
    /// A cached entry whose checksum no longer matches the descriptor is
    /// scrubbed and re-downloaded. Progress is reported after every received
    /// chunk; the 100% event fires once, after the cache commit (or
    /// immediately for a cache hit).
    pub async fn ensure(
        &self,
        descriptor: &ModelDescriptor,
        mut on_progress: impl FnMut(DownloadProgress),
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, StoreError> {
        if let Some(entry) = self.cache.get(&descriptor.id).await? {
            let checksum_ok = match &descriptor.sha256 {
                Some(expected) => sha256_hex(&entry.data) == *expected,
                None => true,
            };
            if checksum_ok {
                let len = entry.data.len() as u64;
                on_progress(DownloadProgress {
                    total_bytes: len,
                    downloaded_bytes: len,
                    speed_bytes_per_second: 0.0,
                    estimated_seconds_remaining: Some(0.0),
                    percentage: 100,
                });
                return Ok(entry.data);
            }
            tracing::warn!(
                id = %descriptor.id,
                "cached entry failed checksum verification; re-downloading"
            );
            self.cache.delete(&descriptor.id).await?;
        }

        let bytes = self.fetch_with_retry(descriptor, &mut on_progress, cancel).await?;

        if let Some(expected) = &descriptor.sha256 {
            let actual = sha256_hex(&bytes);
            if actual != *expected {
                self.cleanup_temp(&descriptor.id).await;
                return Err(StoreError::ChecksumMismatch {
                    id: descriptor.id.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        self.commit(descriptor, &bytes).await?;

        let len = bytes.len() as u64;
        on_progress(DownloadProgress {
            total_bytes: len,
            downloaded_bytes: len,
            speed_bytes_per_second: 0.0,
            estimated_seconds_remaining: Some(0.0),
            percentage: 100,
        });

        Ok(bytes)
    }

    async fn fetch_with_retry(
        &self,
        descriptor: &ModelDescriptor,
        on_progress: &mut impl FnMut(DownloadProgress),
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, StoreError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_err: Option<reqwest::Error> = None;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                self.cleanup_temp(&descriptor.id).await;
                return Err(StoreError::Cancelled);
            }

            match self.fetch_once(descriptor, on_progress, cancel).await {
                Ok(bytes) => return Ok(bytes),
                Err(AttemptError::Cancelled) => {
                    self.cleanup_temp(&descriptor.id).await;
                    return Err(StoreError::Cancelled);
                }
                Err(AttemptError::Fatal(err)) => {
                    self.cleanup_temp(&descriptor.id).await;
                    return Err(err);
                }
                Err(AttemptError::Transient(err)) => {
                    tracing::warn!(
                        id = %descriptor.id,
                        attempt,
                        max_attempts,
                        error = %err,
                        "download attempt failed"
                    );
                    last_err = Some(err);
                }
            }

            if attempt < max_attempts {
                let delay = self.config.initial_retry_delay * 2u32.pow(attempt - 1);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        self.cleanup_temp(&descriptor.id).await;
                        return Err(StoreError::Cancelled);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        self.cleanup_temp(&descriptor.id).await;
        Err(StoreError::NetworkTransient {
            attempts: max_attempts,
            // max_attempts >= 1, so at least one attempt recorded an error.
            source: last_err.expect("transient failure with no recorded error"),
        })
    }

    async fn fetch_once(
        &self,
        descriptor: &ModelDescriptor,
        on_progress: &mut impl FnMut(DownloadProgress),
        cancel: &CancelToken,
    ) -> Result<Vec<u8>, AttemptError> {
        let send = self.http.get(descriptor.url.as_str()).send();
        let mut response = tokio::select! {
            _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
            res = send => res.map_err(AttemptError::Transient)?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(AttemptError::Fatal(StoreError::Http {
                status: status.as_u16(),
                url: descriptor.url.clone(),
            }));
        }

        let total_bytes = response.content_length().unwrap_or(descriptor.size_bytes);
        let started = Instant::now();
        let mut buf: Vec<u8> = Vec::with_capacity(total_bytes.min(64 * 1024 * 1024) as usize);

        loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
                chunk = response.chunk() => chunk,
            };

            match chunk {
                Ok(Some(bytes)) => {
                    buf.extend_from_slice(&bytes);
                    on_progress(attempt_progress(total_bytes, buf.len() as u64, started));
                }
                Ok(None) => break,
                Err(err) => {
                    if cancel.is_cancelled() {
                        return Err(AttemptError::Cancelled);
                    }
                    return Err(AttemptError::Transient(err));
                }
            }
        }

        Ok(buf)
    }

    async fn commit(&self, descriptor: &ModelDescriptor, bytes: &[u8]) -> Result<(), StoreError> {
        let temp_id = ModelCache::temp_id(&descriptor.id);
        let now = chrono::Utc::now().timestamp();

        // Stage under the temp key, then write the final entry, then purge
        // the temp. A crash leaves either nothing or a committed entry plus
        // a stale temp, never a partially visible final entry.
        self.cache
            .put(entry_meta(descriptor, &temp_id, now), bytes.to_vec())
            .await?;
        self.cache
            .put(entry_meta(descriptor, &descriptor.id, now), bytes.to_vec())
            .await?;
        self.cache.delete(&temp_id).await?;

        tracing::info!(id = %descriptor.id, bytes = bytes.len(), "model committed to cache");
        Ok(())
    }

    async fn cleanup_temp(&self, id: &str) {
        if let Err(err) = self.cache.delete(&ModelCache::temp_id(id)).await {
            tracing::warn!(id, error = %err, "failed to clean temp cache entry");
        }
    }
}

fn entry_meta(descriptor: &ModelDescriptor, id: &str, now: i64) -> CacheEntryMeta {
    CacheEntryMeta {
        model_id: id.to_string(),
        committed_at: now,
        size_bytes: 0,
        format: descriptor.format.clone(),
        precision: descriptor.quantization.clone(),
        sha256: descriptor.sha256.clone(),
    }
}

fn attempt_progress(total_bytes: u64, downloaded_bytes: u64, started: Instant) -> DownloadProgress {
    let elapsed = started.elapsed().as_secs_f64();
    let speed = if elapsed > 0.0 {
        downloaded_bytes as f64 / elapsed
    } else {
        0.0
    };

    let estimated_seconds_remaining = if speed > 0.0 && total_bytes >= downloaded_bytes {
        Some((total_bytes - downloaded_bytes) as f64 / speed)
    } else {
        None
    };

    let percentage = if total_bytes > 0 {
        ((downloaded_bytes * 100 / total_bytes) as u8).min(99)
    } else {
        0
    };

    DownloadProgress {
        total_bytes,
        downloaded_bytes,
        speed_bytes_per_second: speed,
        estimated_seconds_remaining,
        percentage,
    }
}

enum AttemptError {
    Cancelled,
    Transient(reqwest::Error),
    Fatal(StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn descriptor(id: &str, url: String, sha256: Option<String>) -> ModelDescriptor {
        ModelDescriptor {
            id: id.to_string(),
            name: "Test".to_string(),
            size_bytes: 0,
            url,
            sha256,
            format: "gguf".to_string(),
            quantization: "q4_0".to_string(),
            category: edgerun_core::ModelCategory::Text,
        }
    }

    fn downloader(dir: &tempfile::TempDir) -> ModelDownloader {
        let cache = ModelCache::open_at(dir.path().join("models")).expect("cache");
        ModelDownloader::with_config(
            cache,
            DownloaderConfig {
                max_attempts: 3,
                initial_retry_delay: Duration::from_millis(20),
                connect_timeout: Duration::from_secs(5),
            },
        )
    }

    #[tokio::test]
    async fn download_commits_and_reports_100_once() {
        let mut server = mockito::Server::new_async().await;
        let body = vec![42u8; 4096];
        let mock = server
            .mock("GET", "/model.gguf")
            .with_status(200)
            .with_body(body.clone())
            .create_async()
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let dl = downloader(&dir);
        let desc = descriptor(
            "m1",
            format!("{}/model.gguf", server.url()),
            Some(sha256_hex(&body)),
        );

        let mut events: Vec<DownloadProgress> = Vec::new();
        let bytes = dl
            .ensure(&desc, |p| events.push(p), &CancelToken::new())
            .await
            .expect("download");
        mock.assert_async().await;

        assert_eq!(bytes, body);
        let hundreds = events.iter().filter(|p| p.percentage == 100).count();
        assert_eq!(hundreds, 1);
        assert_eq!(events.last().expect("events").percentage, 100);
        // Everything before the commit stays capped at 99.
        assert!(events[..events.len() - 1].iter().all(|p| p.percentage <= 99));

        let entry = dl.cache().get("m1").await.expect("get").expect("cached");
        assert_eq!(entry.data, body);
        assert_eq!(entry.meta.sha256, desc.sha256);
        // Temp key purged after commit.
        assert!(
            dl.cache()
                .get(&ModelCache::temp_id("m1"))
                .await
                .expect("get temp")
                .is_none()
        );
    }

    #[tokio::test]
    async fn cache_hit_skips_the_network() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dl = downloader(&dir);
        let body = b"cached bytes".to_vec();

        dl.cache()
            .put(
                CacheEntryMeta {
                    model_id: "m1".to_string(),
                    committed_at: 0,
                    size_bytes: 0,
                    format: "gguf".to_string(),
                    precision: "q4_0".to_string(),
                    sha256: Some(sha256_hex(&body)),
                },
                body.clone(),
            )
            .await
            .expect("seed");

        // URL points nowhere; a network call would fail loudly.
        let desc = descriptor(
            "m1",
            "http://127.0.0.1:9/unreachable".to_string(),
            Some(sha256_hex(&body)),
        );

        let mut events = Vec::new();
        let bytes = dl
            .ensure(&desc, |p| events.push(p), &CancelToken::new())
            .await
            .expect("cache hit");
        assert_eq!(bytes, body);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].percentage, 100);
    }

    #[tokio::test]
    async fn one_transient_failure_then_success_retries_once() {
        let mut server = mockito::Server::new_async().await;
        let body = vec![7u8; 2048];
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = Arc::clone(&calls);
        let body_clone = body.clone();

        let mock = server
            .mock("GET", "/model.gguf")
            .with_status(200)
            .with_chunked_body(move |w| {
                if calls_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                    // Abort mid-body: an opaque network fault, not an HTTP error.
                    w.write_all(&body_clone[..128])?;
                    return Err(std::io::Error::other("injected fault"));
                }
                w.write_all(&body_clone)
            })
            .expect(2)
            .create_async()
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let dl = downloader(&dir);
        let desc = descriptor(
            "m1",
            format!("{}/model.gguf", server.url()),
            Some(sha256_hex(&body)),
        );

        let bytes = dl
            .ensure(&desc, |_| {}, &CancelToken::new())
            .await
            .expect("retried download");
        mock.assert_async().await;

        assert_eq!(bytes, body);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_with_network_transient() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dl = downloader(&dir);
        // Nothing listens on discard; connections fail fast.
        let desc = descriptor("m1", "http://127.0.0.1:9/m.gguf".to_string(), None);

        let err = dl
            .ensure(&desc, |_| {}, &CancelToken::new())
            .await
            .expect_err("unreachable");
        match err {
            StoreError::NetworkTransient { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected NetworkTransient, got {other:?}"),
        }
        assert!(dl.cache().get("m1").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn http_error_fails_immediately_without_retry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/model.gguf")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let dl = downloader(&dir);
        let desc = descriptor("m1", format!("{}/model.gguf", server.url()), None);

        let err = dl
            .ensure(&desc, |_| {}, &CancelToken::new())
            .await
            .expect_err("404");
        mock.assert_async().await;
        match err {
            StoreError::Http { status, .. } => assert_eq!(status, 404),
            other => panic!("expected Http, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn checksum_mismatch_fails_and_leaves_no_entry() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/model.gguf")
            .with_status(200)
            .with_body(b"wrong bytes".to_vec())
            .create_async()
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let dl = downloader(&dir);
        let desc = descriptor(
            "m1",
            format!("{}/model.gguf", server.url()),
            Some("a".repeat(64)),
        );

        let err = dl
            .ensure(&desc, |_| {}, &CancelToken::new())
            .await
            .expect_err("bad checksum");
        assert!(matches!(err, StoreError::ChecksumMismatch { .. }));

        assert!(dl.cache().get("m1").await.expect("get").is_none());
        assert!(
            dl.cache()
                .get(&ModelCache::temp_id("m1"))
                .await
                .expect("get temp")
                .is_none()
        );
        assert!(dl.cache().list().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn corrupted_cache_entry_is_scrubbed_and_redownloaded() {
        let mut server = mockito::Server::new_async().await;
        let body = vec![5u8; 512];
        let mock = server
            .mock("GET", "/model.gguf")
            .with_status(200)
            .with_body(body.clone())
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let dl = downloader(&dir);

        // Seed the cache with bytes that no longer match the descriptor.
        dl.cache()
            .put(
                CacheEntryMeta {
                    model_id: "m1".to_string(),
                    committed_at: 0,
                    size_bytes: 0,
                    format: "gguf".to_string(),
                    precision: "q4_0".to_string(),
                    sha256: None,
                },
                b"stale".to_vec(),
            )
            .await
            .expect("seed");

        let desc = descriptor(
            "m1",
            format!("{}/model.gguf", server.url()),
            Some(sha256_hex(&body)),
        );
        let bytes = dl
            .ensure(&desc, |_| {}, &CancelToken::new())
            .await
            .expect("redownload");
        mock.assert_async().await;
        assert_eq!(bytes, body);
    }

    #[tokio::test]
    async fn cancellation_is_distinguishable_from_network_faults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let dl = downloader(&dir);
        let desc = descriptor("m1", "http://127.0.0.1:9/m.gguf".to_string(), None);

        let cancel = CancelToken::new();
        cancel.cancel();
        let err = dl.ensure(&desc, |_| {}, &cancel).await.expect_err("cancelled");
        assert!(matches!(err, StoreError::Cancelled));
    }

    #[test]
    fn progress_percentage_caps_at_99_before_commit() {
        let started = Instant::now();
        let p = attempt_progress(100, 100, started);
        assert_eq!(p.percentage, 99);

        let p = attempt_progress(100, 50, started);
        assert_eq!(p.percentage, 50);

        // Unknown total: percentage stays at 0, ETA unknown.
        let p = attempt_progress(0, 50, started);
        assert_eq!(p.percentage, 0);
    }
}
