//! Owned service object: upstream pool, metadata cache and their lifecycle.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use http::HeaderValue;
use tokio::task::JoinHandle;

use crate::cache::MetadataCache;
use crate::config::ProxyConfig;
use crate::proxy::upstream::UpstreamClient;
use crate::server::{self, AppState};

/// Everything a request handler needs, built once at startup.
pub struct AudioService {
    state: Arc<AppState>,
    sweeper: Option<JoinHandle<()>>,
}

impl AudioService {
    /// Build the connection pool and cache and start the cache sweeper.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: ProxyConfig) -> anyhow::Result<Self> {
        let upstream = UpstreamClient::new(&config.upstream)?;
        let cache = MetadataCache::new(
            Duration::from_secs(config.cache.ttl_secs),
            config.cache.max_entries,
        );
        let cache_control = HeaderValue::from_str(&config.audio.cache_control)
            .map_err(|e| anyhow::anyhow!("invalid audio.cache_control: {e}"))?;
        let sweeper = cache.spawn_sweeper(Duration::from_secs(config.cache.sweep_interval_secs.max(1)));

        if !config.upstream.has_credentials() {
            tracing::warn!("No upstream credential configured; audio endpoints will return 500");
        }

        tracing::info!(
            upstream = %config.upstream.base_url,
            max_connections = upstream.max_connections(),
            cache_ttl_secs = config.cache.ttl_secs,
            cache_max_entries = config.cache.max_entries,
            "Audio service started"
        );

        Ok(Self {
            state: Arc::new(AppState {
                config,
                upstream,
                cache,
                cache_control,
            }),
            sweeper: Some(sweeper),
        })
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    pub fn router(&self) -> Router {
        server::router(self.state.clone())
    }

    /// Stop the sweeper, close the pool to new calls and drop cached metadata.
    pub fn shutdown(mut self) {
        self.stop();
        tracing::info!(
            in_flight = self.state.upstream.in_use(),
            "Audio service stopped"
        );
    }

    fn stop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        self.state.upstream.close();
        self.state.cache.clear();
    }
}

impl Drop for AudioService {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_closes_pool_and_cache() {
        let mut config = ProxyConfig::default();
        config.upstream.api_key = Some("sk-test".to_string());
        let service = AudioService::start(config).unwrap();
        let state = service.state().clone();

        state
            .cache
            .put("conv12345", crate::proxy::headers::RelayHeaders::default());
        assert_eq!(state.cache.len(), 1);

        service.shutdown();

        assert!(state.cache.is_empty());
        assert!(state.upstream.fetch_metadata("conv12345").await.is_err());
    }

    #[tokio::test]
    async fn test_rejects_bad_cache_control() {
        let mut config = ProxyConfig::default();
        config.audio.cache_control = "public\nmax-age=1".to_string();
        assert!(AudioService::start(config).is_err());
    }
}
