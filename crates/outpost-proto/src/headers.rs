//! Hop-by-hop header sanitization
//!
//! Headers crossing the control channel must not carry HTTP/1.1 hop-by-hop
//! fields: they describe the connection they arrived on, not the request,
//! and forwarding them corrupts framing on the other side.

/// The eight hop-by-hop header names, lowercase
pub const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Check whether a header name is hop-by-hop (case-insensitive)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| name.eq_ignore_ascii_case(h))
}

/// Drop hop-by-hop headers, passing everything else through verbatim
pub fn sanitize_headers(headers: Vec<(String, String)>) -> Vec<(String, String)> {
    headers
        .into_iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .collect()
}
