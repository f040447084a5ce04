//! Upstream access and the streaming relay.

pub mod headers;
pub mod relay;
pub mod upstream;
