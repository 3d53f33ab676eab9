use axum::http::{HeaderMap, HeaderName};
use std::net::IpAddr;

// Shared bucket for requests with no resolvable address
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Pick the identity a request is rate limited under.
///
/// Order: first entry of the trusted proxy header (only when one is
/// configured), then the transport peer address, then [`UNKNOWN_CLIENT`].
pub fn resolve_client_key(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    trusted_header: Option<&HeaderName>,
) -> String {
    let forwarded = trusted_header
        .and_then(|name| headers.get(name))
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    if let Some(address) = forwarded {
        return address.to_string();
    }

    match peer {
        Some(ip) => ip.to_string(),
        None => UNKNOWN_CLIENT.to_string(),
    }
}
