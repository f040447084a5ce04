//! Streaming relay from an upstream response to the client.
//!
//! The upstream body is wrapped in a [`RelayBody`] and handed to axum as the
//! response body. Chunks are pulled only when hyper asks for them, so the relay
//! never reads ahead of the client. The wrapper owns the upstream stream and its
//! [`ConnectionLease`] and releases both exactly once, whichever way the
//! transfer ends:
//!
//! - upstream reaches end of body
//! - upstream read fails mid-stream
//! - the client goes away and hyper drops the body
//!
//! Each exit emits one summary event with byte and chunk counts.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures_util::Stream;
use http::HeaderValue;

use super::headers::RelayHeaders;
use super::upstream::{ConnectionLease, UpstreamBody, UpstreamResponse};
use crate::error::{ProxyError, UpstreamError};

/// Per-transfer counters.
#[derive(Debug, Clone)]
pub struct StreamMetrics {
    pub bytes_transferred: u64,
    pub chunk_count: u64,
    pub started: Instant,
    pub finished: Option<Instant>,
}

impl StreamMetrics {
    pub fn new(started: Instant) -> Self {
        Self {
            bytes_transferred: 0,
            chunk_count: 0,
            started,
            finished: None,
        }
    }

    fn record(&mut self, chunk: &Bytes) {
        self.bytes_transferred += chunk.len() as u64;
        self.chunk_count += 1;
    }

    pub fn elapsed(&self) -> Duration {
        self.finished
            .unwrap_or_else(Instant::now)
            .duration_since(self.started)
    }
}

/// How a transfer ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    UpstreamFailed(String),
    ClientDisconnected,
}

/// Upstream side of a live transfer. Dropping it closes the connection.
struct OpenUpstream {
    body: UpstreamBody,
    _lease: ConnectionLease,
}

/// Response body that forwards upstream chunks as they are pulled.
pub struct RelayBody {
    upstream: Option<OpenUpstream>,
    metrics: StreamMetrics,
    expected_len: Option<u64>,
    resource_id: String,
    span: tracing::Span,
    on_finish: Option<Box<dyn FnOnce(&StreamOutcome, &StreamMetrics) + Send>>,
}

impl RelayBody {
    pub fn new(
        body: UpstreamBody,
        lease: ConnectionLease,
        resource_id: impl Into<String>,
        expected_len: Option<u64>,
        started: Instant,
    ) -> Self {
        Self {
            upstream: Some(OpenUpstream { body, _lease: lease }),
            metrics: StreamMetrics::new(started),
            expected_len,
            resource_id: resource_id.into(),
            span: tracing::Span::current(),
            on_finish: None,
        }
    }

    /// Register a callback run once with the final outcome and counters.
    #[cfg(test)]
    pub fn on_finish<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&StreamOutcome, &StreamMetrics) + Send + 'static,
    {
        self.on_finish = Some(Box::new(f));
        self
    }

    #[cfg(test)]
    pub fn metrics(&self) -> &StreamMetrics {
        &self.metrics
    }

    /// Release the upstream and log the summary. No-op after the first call.
    fn finish(&mut self, outcome: StreamOutcome) {
        let Some(upstream) = self.upstream.take() else {
            return;
        };
        drop(upstream);
        self.metrics.finished = Some(Instant::now());

        let _enter = self.span.enter();
        let bytes = self.metrics.bytes_transferred;
        let chunks = self.metrics.chunk_count;
        let elapsed_ms = self.metrics.elapsed().as_millis() as u64;
        let resource_id = self.resource_id.as_str();

        match &outcome {
            StreamOutcome::Completed => match self.expected_len {
                Some(expected) if bytes < expected => tracing::warn!(
                    resource_id,
                    bytes,
                    expected,
                    chunks,
                    elapsed_ms,
                    "Stream ended short of declared length"
                ),
                _ => tracing::info!(resource_id, bytes, chunks, elapsed_ms, "Stream completed"),
            },
            StreamOutcome::UpstreamFailed(error) => tracing::error!(
                resource_id,
                bytes,
                chunks,
                elapsed_ms,
                error = %error,
                "Stream aborted: upstream read failed"
            ),
            StreamOutcome::ClientDisconnected => tracing::warn!(
                resource_id,
                bytes,
                chunks,
                elapsed_ms,
                "Stream aborted: client disconnected"
            ),
        }

        if let Some(f) = self.on_finish.take() {
            f(&outcome, &self.metrics);
        }
    }
}

impl std::fmt::Debug for RelayBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayBody")
            .field("resource_id", &self.resource_id)
            .field("open", &self.upstream.is_some())
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl Stream for RelayBody {
    type Item = Result<Bytes, UpstreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let Some(upstream) = self.upstream.as_mut() else {
            return Poll::Ready(None);
        };

        match upstream.body.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.metrics.record(&chunk);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                // Headers are already out; the error makes hyper cut the
                // connection instead of ending the body cleanly.
                self.finish(StreamOutcome::UpstreamFailed(e.to_string()));
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.finish(StreamOutcome::Completed);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for RelayBody {
    fn drop(&mut self) {
        self.finish(StreamOutcome::ClientDisconnected);
    }
}

/// Turn an open upstream response into the client response.
///
/// 2xx statuses (200, 206) pass through with translated headers and a
/// streaming body. Anything else is mapped to a proxy error and the upstream
/// body is dropped unread.
pub fn relay(
    upstream: UpstreamResponse,
    resource_id: &str,
    cache_control: &HeaderValue,
    started: Instant,
) -> Result<RelayedResponse, ProxyError> {
    UpstreamError::check_status(upstream.status)?;

    let headers = RelayHeaders::from_upstream(&upstream.headers);
    let body = RelayBody::new(
        upstream.body,
        upstream.lease,
        resource_id,
        headers.content_length(),
        started,
    );

    Ok(RelayedResponse {
        status: upstream.status,
        headers: headers.to_header_map(cache_control),
        body,
    })
}

/// Status, headers and body of a relay before it becomes an axum response.
#[derive(Debug)]
pub struct RelayedResponse {
    pub status: http::StatusCode,
    pub headers: http::HeaderMap,
    pub body: RelayBody,
}

impl RelayedResponse {
    pub fn into_response(self) -> Result<Response, ProxyError> {
        let mut builder = Response::builder().status(self.status);
        if let Some(map) = builder.headers_mut() {
            map.extend(self.headers);
        }
        builder
            .body(Body::from_stream(self.body))
            .map_err(|e| ProxyError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use futures_util::StreamExt;
    use http::{HeaderMap, StatusCode};
    use tokio::sync::Semaphore;

    use super::*;

    /// Upstream stand-in that records when it is dropped.
    struct TrackedStream {
        chunks: std::vec::IntoIter<Result<Bytes, UpstreamError>>,
        then_pending: bool,
        dropped: Arc<AtomicBool>,
    }

    impl Stream for TrackedStream {
        type Item = Result<Bytes, UpstreamError>;

        fn poll_next(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            match self.chunks.next() {
                Some(item) => Poll::Ready(Some(item)),
                None if self.then_pending => Poll::Pending,
                None => Poll::Ready(None),
            }
        }
    }

    impl Drop for TrackedStream {
        fn drop(&mut self) {
            self.dropped.store(true, Ordering::SeqCst);
        }
    }

    struct Fixture {
        slots: Arc<Semaphore>,
        dropped: Arc<AtomicBool>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                slots: Arc::new(Semaphore::new(1)),
                dropped: Arc::new(AtomicBool::new(false)),
            }
        }

        fn upstream(
            &self,
            status: StatusCode,
            headers: HeaderMap,
            chunks: Vec<Result<Bytes, UpstreamError>>,
            then_pending: bool,
        ) -> UpstreamResponse {
            let permit = self.slots.clone().try_acquire_owned().unwrap();
            UpstreamResponse {
                status,
                headers,
                body: Box::pin(TrackedStream {
                    chunks: chunks.into_iter(),
                    then_pending,
                    dropped: self.dropped.clone(),
                }),
                lease: ConnectionLease::new(permit),
            }
        }

        fn released(&self) -> bool {
            self.dropped.load(Ordering::SeqCst) && self.slots.available_permits() == 1
        }
    }

    fn cache_control() -> HeaderValue {
        HeaderValue::from_static("public, max-age=1800")
    }

    fn chunked(data: &[u8], sizes: &[usize]) -> Vec<Result<Bytes, UpstreamError>> {
        let mut out = Vec::new();
        let mut offset = 0;
        for size in sizes {
            out.push(Ok(Bytes::copy_from_slice(&data[offset..offset + size])));
            offset += size;
        }
        assert_eq!(offset, data.len());
        out
    }

    #[tokio::test]
    async fn test_bytes_identical_across_chunkings() {
        let data: Vec<u8> = (0..1000u32).map(|i| (i * 7 % 251) as u8).collect();

        for sizes in [vec![1000], vec![400, 400, 200], vec![1, 998, 1], vec![250; 4]] {
            let fx = Fixture::new();
            let upstream = fx.upstream(StatusCode::OK, HeaderMap::new(), chunked(&data, &sizes), false);

            let resp = relay(upstream, "conv12345", &cache_control(), Instant::now())
                .unwrap()
                .into_response()
                .unwrap();
            let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();

            assert_eq!(body.as_ref(), data.as_slice(), "chunking {sizes:?}");
            assert!(fx.released());
        }
    }

    #[tokio::test]
    async fn test_counters_and_completion_outcome() {
        let fx = Fixture::new();
        let upstream = fx.upstream(
            StatusCode::OK,
            HeaderMap::new(),
            chunked(&[0u8; 1000], &[500, 300, 200]),
            false,
        );
        let seen = Arc::new(Mutex::new(None));
        let seen_cb = seen.clone();

        let relayed = relay(upstream, "conv12345", &cache_control(), Instant::now()).unwrap();
        let mut body = relayed.body.on_finish(move |outcome, metrics| {
            *seen_cb.lock().unwrap() =
                Some((outcome.clone(), metrics.bytes_transferred, metrics.chunk_count));
        });
        while let Some(chunk) = body.next().await {
            chunk.unwrap();
        }

        assert_eq!(
            *seen.lock().unwrap(),
            Some((StreamOutcome::Completed, 1000, 3))
        );
        assert!(fx.released());
    }

    #[tokio::test]
    async fn test_partial_content_passthrough() {
        let fx = Fixture::new();
        let mut headers = HeaderMap::new();
        headers.insert("content-range", HeaderValue::from_static("bytes 100-199/1000"));
        headers.insert("content-length", HeaderValue::from_static("100"));
        let upstream = fx.upstream(
            StatusCode::PARTIAL_CONTENT,
            headers,
            chunked(&[9u8; 100], &[60, 40]),
            false,
        );

        let resp = relay(upstream, "conv12345", &cache_control(), Instant::now())
            .unwrap()
            .into_response()
            .unwrap();

        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers()["content-range"], "bytes 100-199/1000");
        assert_eq!(resp.headers()["content-length"], "100");
        assert_eq!(resp.headers()["content-type"], "audio/mpeg");
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.len(), 100);
    }

    #[tokio::test]
    async fn test_error_status_discards_body() {
        for (status, expected) in [
            (StatusCode::NOT_FOUND, StatusCode::NOT_FOUND),
            (StatusCode::INTERNAL_SERVER_ERROR, StatusCode::BAD_GATEWAY),
        ] {
            let fx = Fixture::new();
            let upstream = fx.upstream(status, HeaderMap::new(), chunked(b"oops!", &[5]), false);

            let err = relay(upstream, "conv12345", &cache_control(), Instant::now()).unwrap_err();
            assert_eq!(err.status(), expected);
            assert!(fx.released());
        }
    }

    #[tokio::test]
    async fn test_client_disconnect_releases_upstream() {
        let fx = Fixture::new();
        // 100 bytes arrive, then upstream stalls with 900 still to come.
        let upstream = fx.upstream(
            StatusCode::OK,
            HeaderMap::new(),
            chunked(&[1u8; 100], &[100]),
            true,
        );
        let outcome = Arc::new(Mutex::new(None));
        let outcome_cb = outcome.clone();

        let relayed = relay(upstream, "conv12345", &cache_control(), Instant::now()).unwrap();
        let mut body = relayed.body.on_finish(move |o, m| {
            *outcome_cb.lock().unwrap() = Some((o.clone(), m.bytes_transferred));
        });

        let first = body.next().await.unwrap().unwrap();
        assert_eq!(first.len(), 100);
        assert!(!fx.released());

        drop(body);

        assert!(fx.released());
        assert_eq!(
            *outcome.lock().unwrap(),
            Some((StreamOutcome::ClientDisconnected, 100))
        );
    }

    #[tokio::test]
    async fn test_upstream_failure_mid_stream() {
        let fx = Fixture::new();
        let mut chunks = chunked(&[3u8; 300], &[300]);
        chunks.push(Err(UpstreamError::ConnectionFailed("connection reset".into())));
        chunks.push(Ok(Bytes::from_static(b"never")));
        let upstream = fx.upstream(StatusCode::OK, HeaderMap::new(), chunks, false);
        let outcome = Arc::new(Mutex::new(None));
        let outcome_cb = outcome.clone();

        let relayed = relay(upstream, "conv12345", &cache_control(), Instant::now()).unwrap();
        let mut body = relayed.body.on_finish(move |o, _| {
            *outcome_cb.lock().unwrap() = Some(o.clone());
        });

        assert_eq!(body.next().await.unwrap().unwrap().len(), 300);
        assert!(body.next().await.unwrap().is_err());
        assert!(fx.released());
        // Upstream is gone; nothing further is forwarded.
        assert!(body.next().await.is_none());
        assert_eq!(body.metrics().bytes_transferred, 300);

        drop(body);
        assert!(matches!(
            *outcome.lock().unwrap(),
            Some(StreamOutcome::UpstreamFailed(_))
        ));
    }
}
