//! Pre-flight checks run before any upstream call.

use crate::config::ProxyConfig;
use crate::error::ProxyError;

/// Check the resource id and that upstream credentials exist.
///
/// The id is opaque: only emptiness and length are checked. Credentials are
/// checked first so a misconfigured deployment reports 500 for every id.
pub fn validate_request<'a>(config: &ProxyConfig, resource_id: &'a str) -> Result<&'a str, ProxyError> {
    if !config.upstream.has_credentials() {
        return Err(ProxyError::Misconfigured);
    }
    validate_resource_id(resource_id, config.audio.min_id_length)
}

pub fn validate_resource_id(resource_id: &str, min_length: usize) -> Result<&str, ProxyError> {
    if resource_id.trim().is_empty() || resource_id.chars().count() < min_length {
        return Err(ProxyError::InvalidId);
    }
    Ok(resource_id)
}
