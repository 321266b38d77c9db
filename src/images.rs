//! Image fetching, validation, and the content-addressed image cache.
//!
//! An image is accepted when the fetch succeeds, the response declares an
//! `image/*` content type, and the leading bytes match a known format
//! (JPEG, PNG, GIF, WEBP, BMP). Accepted bytes are cached on disk under
//! `images.cache_dir/<sha256(url)>`.
//!
//! Cache entries are never invalidated implicitly: a cached URL is served
//! from disk until [`ImageProcessor::evict`] or [`ImageProcessor::clear`]
//! removes it.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use sha2::{Digest, Sha256};

use profile_fusion_core::error::ImageRejection;
use profile_fusion_core::retry::RetryPolicy;
use profile_fusion_core::FusionError;

use crate::retry::retry;

/// Raw response of an image download.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedImage {
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Downloads image URLs. One call is one attempt.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, FusionError>;
}

pub struct HttpImageFetcher {
    http: Client,
    max_bytes: usize,
}

impl HttpImageFetcher {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            http: Client::new(),
            max_bytes,
        }
    }
}

fn rejected(url: &str, reason: ImageRejection) -> FusionError {
    FusionError::InvalidImageUrl {
        url: url.to_string(),
        reason,
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedImage, FusionError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| rejected(url, ImageRejection::Unreachable(e.to_string())))?;

        let status = response.status();
        if !status.is_success() {
            return Err(rejected(url, ImageRejection::HttpStatus(status.as_u16())));
        }
        if let Some(len) = response.content_length() {
            if len as usize > self.max_bytes {
                return Err(rejected(url, ImageRejection::TooLarge(self.max_bytes)));
            }
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| rejected(url, ImageRejection::Unreachable(e.to_string())))?;
        if bytes.len() > self.max_bytes {
            return Err(rejected(url, ImageRejection::TooLarge(self.max_bytes)));
        }

        Ok(FetchedImage {
            content_type,
            bytes: bytes.to_vec(),
        })
    }
}

/// Identify an image format from its leading bytes.
pub fn sniff_format(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("jpeg")
    } else if bytes.starts_with(&[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]) {
        Some("png")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("gif")
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("webp")
    } else if bytes.starts_with(b"BM") {
        Some("bmp")
    } else {
        None
    }
}

/// Check a downloaded body against the declared type and the magic bytes.
pub fn check_image(url: &str, image: &FetchedImage) -> Result<(), FusionError> {
    let declared = image.content_type.as_deref().unwrap_or("");
    let media_type = declared.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    if !media_type.starts_with("image/") {
        let shown = if declared.is_empty() { "<missing>" } else { declared };
        return Err(rejected(url, ImageRejection::NotAnImage(shown.to_string())));
    }
    if sniff_format(&image.bytes).is_none() {
        return Err(rejected(url, ImageRejection::Corrupt));
    }
    Ok(())
}

/// Cache key for a URL: lowercase hex SHA-256.
pub fn cache_key(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

pub struct ImageProcessor {
    fetcher: Arc<dyn ImageFetcher>,
    cache_dir: PathBuf,
    resolved: Mutex<HashSet<String>>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl ImageProcessor {
    pub fn new(
        fetcher: Arc<dyn ImageFetcher>,
        cache_dir: impl Into<PathBuf>,
        policy: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            cache_dir: cache_dir.into(),
            resolved: Mutex::new(HashSet::new()),
            policy,
            timeout,
        }
    }

    pub fn cache_path(&self, url: &str) -> PathBuf {
        self.cache_dir.join(cache_key(url))
    }

    /// Return the image bytes for `url`, from cache when present.
    ///
    /// Transient download failures are retried per the policy; after that
    /// the typed rejection is returned and nothing is cached.
    pub async fn resolve(&self, url: &str) -> Result<Vec<u8>, FusionError> {
        let path = self.cache_path(url);
        if let Ok(bytes) = tokio::fs::read(&path).await {
            self.remember(url);
            return Ok(bytes);
        }

        let fetcher = self.fetcher.as_ref();
        let image = retry(&self.policy, "image fetch", self.timeout, move || {
            fetcher.fetch(url)
        })
        .await?;
        check_image(url, &image)?;

        if let Err(e) = write_atomic(&self.cache_dir, &path, &image.bytes).await {
            tracing::warn!(url, error = %e, "failed to cache image");
        } else {
            self.remember(url);
        }
        Ok(image.bytes)
    }

    /// Whether `url` resolves to a valid image. Never fails.
    pub async fn validate(&self, url: &str) -> bool {
        match self.resolve(url).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!(url, error = %e, "image rejected");
                false
            }
        }
    }

    pub fn is_cached(&self, url: &str) -> bool {
        self.cache_path(url).exists()
    }

    /// Drop one cache entry. Returns whether anything was removed.
    pub async fn evict(&self, url: &str) -> std::io::Result<bool> {
        if let Ok(mut resolved) = self.resolved.lock() {
            resolved.remove(&cache_key(url));
        }
        match tokio::fs::remove_file(self.cache_path(url)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Drop every cache entry. Returns the number of files removed.
    pub async fn clear(&self) -> std::io::Result<usize> {
        if let Ok(mut resolved) = self.resolved.lock() {
            resolved.clear();
        }
        let mut removed = 0;
        let mut entries = match tokio::fs::read_dir(&self.cache_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Number of distinct URLs resolved by this processor.
    pub fn resolved_count(&self) -> usize {
        self.resolved.lock().map(|r| r.len()).unwrap_or(0)
    }

    fn remember(&self, url: &str) {
        if let Ok(mut resolved) = self.resolved.lock() {
            resolved.insert(cache_key(url));
        }
    }
}

async fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];

    struct FakeFetcher {
        responses: HashMap<String, Result<FetchedImage, FusionError>>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ImageFetcher for FakeFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedImage, FusionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.responses
                .get(url)
                .cloned()
                .unwrap_or_else(|| Err(rejected(url, ImageRejection::HttpStatus(404))))
        }
    }

    fn image(ct: &str, bytes: &[u8]) -> Result<FetchedImage, FusionError> {
        Ok(FetchedImage {
            content_type: Some(ct.to_string()),
            bytes: bytes.to_vec(),
        })
    }

    fn processor(
        dir: &TempDir,
        responses: Vec<(&str, Result<FetchedImage, FusionError>)>,
    ) -> (Arc<FakeFetcher>, ImageProcessor) {
        let fetcher = Arc::new(FakeFetcher {
            responses: responses
                .into_iter()
                .map(|(u, r)| (u.to_string(), r))
                .collect(),
            calls: AtomicU32::new(0),
        });
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let p = ImageProcessor::new(fetcher.clone(), dir.path(), policy, Duration::from_secs(1));
        (fetcher, p)
    }

    #[test]
    fn test_sniff_formats() {
        assert_eq!(sniff_format(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("jpeg"));
        assert_eq!(sniff_format(PNG), Some("png"));
        assert_eq!(sniff_format(b"GIF89a...."), Some("gif"));
        assert_eq!(sniff_format(b"RIFF\0\0\0\0WEBPVP8 "), Some("webp"));
        assert_eq!(sniff_format(b"<html>"), None);
    }

    #[test]
    fn test_cache_key_is_stable_hex() {
        let k = cache_key("https://cdn.example.com/a.jpg");
        assert_eq!(k.len(), 64);
        assert_eq!(k, cache_key("https://cdn.example.com/a.jpg"));
        assert_ne!(k, cache_key("https://cdn.example.com/b.jpg"));
    }

    #[tokio::test]
    async fn test_resolve_caches_on_disk() {
        let dir = TempDir::new().unwrap();
        let (fetcher, p) = processor(&dir, vec![("u1", image("image/png", PNG))]);

        assert_eq!(p.resolve("u1").await.unwrap(), PNG);
        assert!(p.is_cached("u1"));
        assert_eq!(p.resolve("u1").await.unwrap(), PNG);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(p.resolved_count(), 1);
    }

    #[tokio::test]
    async fn test_evict_forces_refetch() {
        let dir = TempDir::new().unwrap();
        let (fetcher, p) = processor(&dir, vec![("u1", image("image/png", PNG))]);
        p.resolve("u1").await.unwrap();
        assert!(p.evict("u1").await.unwrap());
        assert!(!p.evict("u1").await.unwrap());
        p.resolve("u1").await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(p.clear().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_wrong_content_type_rejected_without_retry() {
        let dir = TempDir::new().unwrap();
        let (fetcher, p) = processor(&dir, vec![("u1", image("text/html; charset=utf-8", PNG))]);
        match p.resolve("u1").await {
            Err(FusionError::InvalidImageUrl {
                reason: ImageRejection::NotAnImage(ct),
                ..
            }) => assert!(ct.starts_with("text/html")),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(!p.is_cached("u1"));
    }

    #[tokio::test]
    async fn test_corrupt_bytes_rejected() {
        let dir = TempDir::new().unwrap();
        let (_fetcher, p) = processor(&dir, vec![("u1", image("image/jpeg", b"not an image"))]);
        assert!(!p.validate("u1").await);
    }

    #[tokio::test]
    async fn test_unreachable_is_retried_then_reported() {
        let dir = TempDir::new().unwrap();
        let (fetcher, p) = processor(
            &dir,
            vec![(
                "u1",
                Err(rejected("u1", ImageRejection::Unreachable("connection refused".into()))),
            )],
        );
        let err = p.resolve("u1").await.unwrap_err();
        assert!(matches!(
            err,
            FusionError::InvalidImageUrl {
                reason: ImageRejection::Unreachable(_),
                ..
            }
        ));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let (fetcher, p) = processor(&dir, vec![]);
        assert!(!p.validate("missing").await);
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
