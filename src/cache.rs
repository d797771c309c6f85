//! Content-addressed response cache with TTL, ported from the original
//! `ProxyCache` (app/cache.py) onto an atomic, file-per-key JSON store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::error::{ProxyError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub url: String,
    pub timestamp: DateTime<Utc>,
    pub status_code: u16,
    pub headers: HashMap<String, String>,
    /// UTF-8 lossy transcription when the body is binary; callers that need
    /// exact bytes back should treat this as `content.into_bytes()`.
    pub content: String,
    pub content_type: Option<String>,
}

impl CacheEntry {
    pub fn content_bytes(&self) -> Vec<u8> {
        self.content.clone().into_bytes()
    }
}

pub struct ResponseCache {
    cache_dir: PathBuf,
    max_age: chrono::Duration,
}

impl ResponseCache {
    /// `max_age_seconds = 0` disables the cache: `get` always misses and
    /// `set` is a no-op.
    pub fn new(cache_dir: impl Into<PathBuf>, max_age_seconds: i64) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            max_age: chrono::Duration::seconds(max_age_seconds),
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.max_age <= chrono::Duration::zero()
    }

    pub fn fingerprint(url: &str, user_agent: Option<&str>, accept: Option<&str>) -> String {
        let mut hasher = Md5::new();
        hasher.update(url.as_bytes());
        hasher.update(user_agent.unwrap_or("").as_bytes());
        hasher.update(accept.unwrap_or("").as_bytes());
        format!("{:x}", hasher.finalize())
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{key}.json"))
    }

    /// Returns a non-expired entry or `None`, removing the file on a miss
    /// caused by expiry or corruption.
    pub async fn get(&self, url: &str, user_agent: Option<&str>, accept: Option<&str>) -> Option<CacheEntry> {
        if self.is_disabled() {
            return None;
        }
        let key = Self::fingerprint(url, user_agent, accept);
        let path = self.path_for(&key);

        let raw = fs::read(&path).await.ok()?;
        let entry: CacheEntry = match serde_json::from_slice(&raw) {
            Ok(entry) => entry,
            Err(_) => {
                let _ = fs::remove_file(&path).await;
                return None;
            }
        };

        if Utc::now() - entry.timestamp < self.max_age {
            Some(entry)
        } else {
            let _ = fs::remove_file(&path).await;
            None
        }
    }

    pub async fn set(
        &self,
        url: &str,
        user_agent: Option<&str>,
        accept: Option<&str>,
        status_code: u16,
        headers: HashMap<String, String>,
        content: &[u8],
        content_type: Option<String>,
    ) -> Result<()> {
        if self.is_disabled() {
            return Ok(());
        }

        fs::create_dir_all(&self.cache_dir)
            .await
            .map_err(|e| ProxyError::CacheError(e.to_string()))?;

        let key = Self::fingerprint(url, user_agent, accept);
        let entry = CacheEntry {
            url: url.to_string(),
            timestamp: Utc::now(),
            status_code,
            headers,
            content: String::from_utf8_lossy(content).into_owned(),
            content_type,
        };

        let body = serde_json::to_vec(&entry).map_err(|e| ProxyError::CacheError(e.to_string()))?;
        atomic_write(&self.path_for(&key), &body)
            .await
            .map_err(|e| ProxyError::CacheError(e.to_string()))
    }
}

async fn atomic_write(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, contents).await?;
    fs::rename(&tmp_path, path).await
}
