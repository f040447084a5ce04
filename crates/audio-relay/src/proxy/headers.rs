//! Outbound header policy for relayed audio.
//!
//! Upstream headers are whitelisted, not filtered: only the three entity
//! headers below are ever copied, so credentials, cookies and provider
//! routing headers cannot leak to the client.

use http::header::{
    ACCEPT_RANGES, ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_RANGE,
    CONTENT_TYPE, LAST_MODIFIED,
};
use http::{HeaderMap, HeaderValue};

pub const AUDIO_CONTENT_TYPE: &str = "audio/mpeg";

/// Upstream headers that survive the relay.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayHeaders {
    pub content_length: Option<HeaderValue>,
    pub content_range: Option<HeaderValue>,
    pub last_modified: Option<HeaderValue>,
}

impl RelayHeaders {
    pub fn from_upstream(headers: &HeaderMap) -> Self {
        Self {
            content_length: headers.get(CONTENT_LENGTH).cloned(),
            content_range: headers.get(CONTENT_RANGE).cloned(),
            last_modified: headers.get(LAST_MODIFIED).cloned(),
        }
    }

    /// Declared body length, if upstream sent a parseable one.
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
            .as_ref()
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse().ok())
    }

    /// Full outbound header set: fixed policy headers plus forwarded ones.
    pub fn to_header_map(&self, cache_control: &HeaderValue) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(7);
        map.insert(CONTENT_TYPE, HeaderValue::from_static(AUDIO_CONTENT_TYPE));
        map.insert(ACCEPT_RANGES, HeaderValue::from_static("bytes"));
        map.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        map.insert(CACHE_CONTROL, cache_control.clone());

        if let Some(v) = &self.content_length {
            map.insert(CONTENT_LENGTH, v.clone());
        }
        if let Some(v) = &self.content_range {
            map.insert(CONTENT_RANGE, v.clone());
        }
        if let Some(v) = &self.last_modified {
            map.insert(LAST_MODIFIED, v.clone());
        }
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(*k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn test_policy_headers_always_set() {
        let cc = HeaderValue::from_static("public, max-age=1800");
        let map = RelayHeaders::default().to_header_map(&cc);

        assert_eq!(map[CONTENT_TYPE], "audio/mpeg");
        assert_eq!(map[ACCEPT_RANGES], "bytes");
        assert_eq!(map[ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert_eq!(map[CACHE_CONTROL], "public, max-age=1800");
        assert!(map.get(CONTENT_LENGTH).is_none());
        assert!(map.get(CONTENT_RANGE).is_none());
    }

    #[test]
    fn test_entity_headers_forwarded_verbatim() {
        let headers = RelayHeaders::from_upstream(&upstream(&[
            ("content-length", "100"),
            ("content-range", "bytes 100-199/1000"),
            ("last-modified", "Wed, 21 Oct 2026 07:28:00 GMT"),
            ("content-type", "application/octet-stream"),
        ]));
        let map = headers.to_header_map(&HeaderValue::from_static("no-store"));

        assert_eq!(map[CONTENT_LENGTH], "100");
        assert_eq!(map[CONTENT_RANGE], "bytes 100-199/1000");
        assert_eq!(map[LAST_MODIFIED], "Wed, 21 Oct 2026 07:28:00 GMT");
        assert_eq!(map[CONTENT_TYPE], "audio/mpeg");
        assert_eq!(headers.content_length(), Some(100));
    }

    #[test]
    fn test_internal_headers_dropped() {
        let headers = RelayHeaders::from_upstream(&upstream(&[
            ("xi-api-key", "sk-secret"),
            ("set-cookie", "session=1"),
            ("x-region", "us-east"),
            ("accept-ranges", "none"),
        ]));
        let map = headers.to_header_map(&HeaderValue::from_static("no-store"));

        assert!(map.get("xi-api-key").is_none());
        assert!(map.get("set-cookie").is_none());
        assert!(map.get("x-region").is_none());
        assert_eq!(map[ACCEPT_RANGES], "bytes");
        assert_eq!(map.len(), 4);
    }

    #[test]
    fn test_unparseable_length() {
        let headers = RelayHeaders::from_upstream(&upstream(&[("content-length", "lots")]));
        assert_eq!(headers.content_length(), None);
    }
}
