//! Configuration types and loading logic.

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use relay_tracing::TracingConfig;
use serde::Deserialize;

/// Environment variable holding the listen port.
pub const PORT_ENV: &str = "PORT";

/// Environment variable holding the upstream API credential.
pub const API_KEY_ENV: &str = "ELEVENLABS_API_KEY";

/// Top-level proxy configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProxyConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
}

/// Server listen configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Allowed CORS origins. Empty (or containing `*`) allows any origin.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Upstream audio provider configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Provider credential. Usually supplied through `ELEVENLABS_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Per-read timeout; resets after every chunk received.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Upper bound on concurrently held upstream connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

/// Metadata cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_cache_max_entries")]
    pub max_entries: usize,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Audio endpoint policy.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_min_id_length")]
    pub min_id_length: usize,

    /// Value of the `Cache-Control` header on relayed audio.
    #[serde(default = "default_cache_control")]
    pub cache_control: String,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_base_url() -> String {
    "https://api.elevenlabs.io/v1".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_read_timeout() -> u64 {
    300
}

fn default_max_connections() -> usize {
    64
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_cache_max_entries() -> usize {
    1024
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_min_id_length() -> usize {
    5
}

fn default_cache_control() -> String {
    "public, max-age=1800".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            max_connections: default_max_connections(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_cache_ttl(),
            max_entries: default_cache_max_entries(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            min_id_length: default_min_id_length(),
            cache_control: default_cache_control(),
        }
    }
}

impl UpstreamConfig {
    /// Whether a usable credential is configured.
    pub fn has_credentials(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.trim().is_empty())
    }
}

impl ProxyConfig {
    /// Load configuration from TOML file and environment variables.
    ///
    /// Priority (highest to lowest):
    /// 1. `PORT` and `ELEVENLABS_API_KEY`
    /// 2. Environment variables (AUDIO_RELAY_ prefix, __ for nesting)
    /// 3. TOML config file (optional)
    /// 4. Defaults
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        let mut config: ProxyConfig = Figment::new()
            .merge(Toml::file(config_path))
            .merge(Env::prefixed("AUDIO_RELAY_").split("__"))
            .extract()?;

        config.apply_overrides(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply the unprefixed deployment variables from `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup(PORT_ENV) {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid {PORT_ENV} value {port:?}: {e}"))?;
        }
        if let Some(key) = lookup(API_KEY_ENV) {
            self.upstream.api_key = Some(key).filter(|k| !k.trim().is_empty());
        }
        Ok(())
    }

    /// `host:port` string for the listener.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
