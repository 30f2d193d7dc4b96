//! JWKS caching with background refresh
//!
//! Fetches JSON Web Key Sets over HTTP and keeps them fresh autonomously so
//! that key rotation at the identity provider propagates without validation
//! outages. Callers always see the currently-known key set; transient fetch
//! failures are absorbed as long as any keys have been cached for the URL.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::jwk::JwkSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Default background refresh window (15 minutes)
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(900);

/// Timeout on each JWKS fetch
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Cached key set for one JWKS URL
#[derive(Debug, Clone)]
struct CachedKeys {
    keys: JwkSet,
    fetched_at: Instant,
}

/// JWKS cache keyed by endpoint URL
#[derive(Debug)]
pub struct JwksCache {
    entries: DashMap<String, CachedKeys>,
    http: reqwest::Client,
    refresh_interval: Duration,
}

impl Default for JwksCache {
    fn default() -> Self {
        Self::new()
    }
}

impl JwksCache {
    /// Create a cache with the default 15-minute refresh window
    #[must_use]
    pub fn new() -> Self {
        Self::with_refresh_interval(DEFAULT_REFRESH_INTERVAL)
    }

    /// Create a cache with a custom refresh window
    #[must_use]
    pub fn with_refresh_interval(refresh_interval: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            http: reqwest::Client::builder()
                .timeout(FETCH_TIMEOUT)
                .build()
                .unwrap_or_default(),
            refresh_interval,
        }
    }

    /// Register a URL for autonomous refresh
    ///
    /// Spawns a background task that fetches immediately and then once per
    /// refresh window for the lifetime of the process. A failed refresh
    /// keeps the previously cached keys installed.
    pub fn register(self: &Arc<Self>, url: &str) {
        let cache = Arc::clone(self);
        let url = url.to_string();
        let interval = self.refresh_interval;

        info!(url = %url, interval_secs = interval.as_secs(), "JWKS cache registered");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = cache.refresh(&url).await {
                    warn!(url = %url, error = %e, "JWKS refresh failed, keeping cached keys");
                }
            }
        });
    }

    /// Current key set for `url`, fetching on first use
    ///
    /// # Errors
    ///
    /// Returns an error only when no keys have ever been cached for the
    /// URL and the fetch fails.
    pub async fn get(&self, url: &str) -> Result<JwkSet> {
        if let Some(entry) = self.entries.get(url) {
            return Ok(entry.keys.clone());
        }

        self.refresh(url).await?;

        self.entries
            .get(url)
            .map(|e| e.keys.clone())
            .ok_or_else(|| Error::jwks_fetch(url, "no keys cached after refresh"))
    }

    /// Force a fetch and return the fresh key set
    ///
    /// Used when a token carries a key id the cached set does not contain,
    /// which usually means the provider rotated keys inside the refresh
    /// window.
    pub async fn get_refreshed(&self, url: &str) -> Result<JwkSet> {
        self.refresh(url).await?;
        self.get(url).await
    }

    /// Fetch the key set at `url` and install it
    ///
    /// # Errors
    ///
    /// Returns an error on network failure, non-2xx status, or an
    /// unparseable body. A previously cached entry stays installed.
    pub async fn refresh(&self, url: &str) -> Result<()> {
        debug!(url = %url, "Fetching JWKS");

        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| Error::jwks_fetch(url, format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::jwks_fetch(url, format!("HTTP {}", response.status())));
        }

        let keys: JwkSet = response
            .json()
            .await
            .map_err(|e| Error::jwks_fetch(url, format!("invalid JSON: {e}")))?;

        info!(url = %url, key_count = keys.keys.len(), "JWKS fetched");

        self.entries.insert(
            url.to_string(),
            CachedKeys {
                keys,
                fetched_at: Instant::now(),
            },
        );

        Ok(())
    }

    /// Time since the last successful fetch for `url`
    #[must_use]
    pub fn age(&self, url: &str) -> Option<Duration> {
        self.entries.get(url).map(|e| e.fetched_at.elapsed())
    }
}
