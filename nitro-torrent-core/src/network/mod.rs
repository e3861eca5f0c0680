//! Session-wide bandwidth limiting.
//!
//! All torrents share one [`BandwidthLimiter`]. Each direction is either
//! unlimited or backed by a [`TokenBucket`]; callers reserve bytes and sleep
//! for the returned debt before moving data.

pub mod token_bucket;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
pub use token_bucket::{TokenBucket, TokenBucketError};

use crate::config::NetworkConfig;

/// Optional global upload and download caps.
#[derive(Debug, Clone, Default)]
pub struct BandwidthLimiter {
    download: Option<Arc<Mutex<TokenBucket>>>,
    upload: Option<Arc<Mutex<TokenBucket>>>,
}

impl BandwidthLimiter {
    pub fn new(download_limit: Option<u64>, upload_limit: Option<u64>) -> Self {
        let bucket = |limit: u64| Arc::new(Mutex::new(TokenBucket::new(limit)));
        Self {
            download: download_limit.map(bucket),
            upload: upload_limit.map(bucket),
        }
    }

    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(config.download_limit, config.upload_limit)
    }

    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn is_limited(&self) -> bool {
        self.download.is_some() || self.upload.is_some()
    }

    /// Waits until `bytes` of download budget is available.
    pub async fn acquire_download(&self, bytes: usize) {
        acquire(self.download.as_ref(), bytes).await;
    }

    /// Waits until `bytes` of upload budget is available.
    pub async fn acquire_upload(&self, bytes: usize) {
        acquire(self.upload.as_ref(), bytes).await;
    }

    /// Download bytes available right now, `None` when unlimited.
    pub fn download_budget(&self) -> Option<u64> {
        self.download
            .as_ref()
            .map(|bucket| bucket.lock().available_at(Instant::now()))
    }
}

async fn acquire(bucket: Option<&Arc<Mutex<TokenBucket>>>, bytes: usize) {
    let Some(bucket) = bucket else {
        return;
    };
    let wait = bucket.lock().reserve_at(bytes as u64, Instant::now());
    if wait > Duration::ZERO {
        tokio::time::sleep(wait).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let limiter = BandwidthLimiter::unlimited();
        assert!(!limiter.is_limited());
        assert_eq!(limiter.download_budget(), None);

        let started = Instant::now();
        limiter.acquire_upload(10 * 1024 * 1024).await;
        limiter.acquire_download(10 * 1024 * 1024).await;
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_upload_cap_delays_over_budget() {
        let limiter = BandwidthLimiter::new(None, Some(1000));
        assert!(limiter.is_limited());

        let started = Instant::now();
        limiter.acquire_upload(1000).await;
        assert!(started.elapsed() < Duration::from_millis(100));

        limiter.acquire_upload(300).await;
        assert!(started.elapsed() >= Duration::from_millis(250));
    }

    #[test]
    fn test_from_config_reads_caps() {
        let config = NetworkConfig {
            download_limit: Some(2048),
            ..NetworkConfig::default()
        };
        let limiter = BandwidthLimiter::from_config(&config);
        assert_eq!(limiter.download_budget(), Some(2048));
    }
}
