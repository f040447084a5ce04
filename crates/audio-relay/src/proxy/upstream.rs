//! Pooled HTTP client for the upstream audio provider.
//!
//! A single `reqwest::Client` is shared by every request. The number of
//! connections held at once is bounded by a semaphore: each call takes a
//! [`ConnectionLease`], and for streaming GETs the lease travels with the body
//! so it is only returned once the relay lets go of the upstream stream.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use http::header::{ACCEPT, RANGE};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use reqwest::Url;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::Instrument;

use crate::config::UpstreamConfig;
use crate::error::UpstreamError;

/// Credential header expected by the provider.
const API_KEY_HEADER: &str = "xi-api-key";

/// Upstream body: finite, single-pass sequence of chunks.
pub type UpstreamBody = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

/// One held slot of the upstream connection budget. Released on drop.
pub struct ConnectionLease {
    _permit: OwnedSemaphorePermit,
}

impl ConnectionLease {
    pub(crate) fn new(permit: OwnedSemaphorePermit) -> Self {
        Self { _permit: permit }
    }
}

impl fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectionLease")
    }
}

/// An open upstream response whose body has not been read yet.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
    pub lease: ConnectionLease,
}

impl fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Cheap to clone; all clones share the pool and the connection budget.
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    base_url: Url,
    api_key: Option<String>,
    slots: Arc<Semaphore>,
    max_connections: usize,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> anyhow::Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| anyhow::anyhow!("invalid upstream base_url {:?}: {e}", config.base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("upstream base_url {:?} cannot carry a path", config.base_url);
        }
        let max_connections = config.max_connections.max(1);

        // No total timeout: audio bodies can take minutes. The read timeout
        // resets on every chunk, so only a stalled upstream trips it.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.read_timeout_secs))
            .pool_max_idle_per_host(max_connections)
            .pool_idle_timeout(Duration::from_secs(config.pool_idle_timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url,
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            slots: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        })
    }

    /// Open a streaming GET, forwarding `range` byte-for-byte.
    ///
    /// Non-2xx statuses are returned as errors and their bodies dropped unread.
    pub async fn fetch(
        &self,
        resource_id: &str,
        range: Option<&HeaderValue>,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let span = relay_tracing::upstream_fetch_span!(resource_id, Method::GET);
        if let Some(range) = range {
            span.record("range", &*String::from_utf8_lossy(range.as_bytes()));
        }

        async {
            let lease = self.acquire().await?;
            let start = Instant::now();

            let mut request = self.request(Method::GET, resource_id)?;
            if let Some(range) = range {
                request = request.header(RANGE, range.clone());
            }

            let response = request.send().await.inspect_err(|e| {
                log_transport_error(e, start);
            })?;
            record_status(response.status(), start);
            UpstreamError::check_status(response.status())?;

            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes_stream().map(|r| r.map_err(UpstreamError::from));

            Ok(UpstreamResponse {
                status,
                headers,
                body: Box::pin(body),
                lease,
            })
        }
        .instrument(span)
        .await
    }

    /// HEAD the resource and return its headers.
    pub async fn fetch_metadata(&self, resource_id: &str) -> Result<HeaderMap, UpstreamError> {
        let span = relay_tracing::upstream_fetch_span!(resource_id, Method::HEAD);

        async {
            let _lease = self.acquire().await?;
            let start = Instant::now();

            let response = self
                .request(Method::HEAD, resource_id)?
                .send()
                .await
                .inspect_err(|e| log_transport_error(e, start))?;
            record_status(response.status(), start);
            UpstreamError::check_status(response.status())?;

            Ok(response.headers().clone())
        }
        .instrument(span)
        .await
    }

    /// Number of connection slots currently held.
    pub fn in_use(&self) -> usize {
        self.max_connections - self.slots.available_permits()
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Refuse new upstream calls. Leases already handed out stay valid.
    pub fn close(&self) {
        self.slots.close();
    }

    /// `{base}/convai/conversations/{id}/audio`, id encoded as one segment.
    pub fn audio_url(&self, resource_id: &str) -> Result<Url, UpstreamError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| UpstreamError::InvalidRequest("base url cannot carry a path".into()))?
            .pop_if_empty()
            .extend(["convai", "conversations", resource_id, "audio"]);
        Ok(url)
    }

    async fn acquire(&self) -> Result<ConnectionLease, UpstreamError> {
        // Suspends while every slot is in use.
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| UpstreamError::ConnectionFailed("upstream client is shut down".into()))?;
        Ok(ConnectionLease::new(permit))
    }

    fn request(&self, method: Method, resource_id: &str) -> Result<reqwest::RequestBuilder, UpstreamError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| UpstreamError::InvalidRequest("no upstream credential".into()))?;

        Ok(self
            .http
            .request(method, self.audio_url(resource_id)?)
            .header(API_KEY_HEADER, api_key)
            .header(ACCEPT, "audio/mpeg"))
    }
}

fn record_status(status: StatusCode, start: Instant) {
    let latency = start.elapsed().as_millis() as u64;
    let span = tracing::Span::current();
    span.record("status", status.as_u16());
    span.record("latency_ms", latency);
    tracing::info!(status = status.as_u16(), latency_ms = latency, "Upstream responded");
}

fn log_transport_error(e: &reqwest::Error, start: Instant) {
    let latency = start.elapsed().as_millis() as u64;
    tracing::Span::current().record("latency_ms", latency);
    if e.is_timeout() {
        tracing::error!(error = %e, latency_ms = latency, "Upstream timeout");
    } else {
        tracing::error!(error = %e, latency_ms = latency, "Upstream connection error");
    }
}
