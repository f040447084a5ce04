//! Span builder helpers for audio-relay instrumentation.

/// Create the top-level span for one client request.
///
/// Usage: `let span = audio_request_span!(request_id, resource_id, "stream");`
///
/// Recorded later by the handler:
/// - `status`: client-visible status code
/// - `elapsed_ms`: time until the response head was ready
#[macro_export]
macro_rules! audio_request_span {
    ($request_id:expr, $resource_id:expr, $route:expr) => {
        tracing::info_span!(
            "audio_request",
            request_id = %$request_id,
            resource_id = %$resource_id,
            route = %$route,
            status = tracing::field::Empty,
            elapsed_ms = tracing::field::Empty,
        )
    };
}

/// Create a span for one upstream call (GET or HEAD).
#[macro_export]
macro_rules! upstream_fetch_span {
    ($resource_id:expr, $method:expr) => {
        tracing::info_span!(
            "upstream_fetch",
            resource_id = %$resource_id,
            method = %$method,
            range = tracing::field::Empty,
            status = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
        )
    };
}
