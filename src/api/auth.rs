// =============================================================================
// Intake Authentication — shared secret and IP allow-list
// =============================================================================
//
// The charting platform cannot send arbitrary headers from every alert type,
// so the shared secret is accepted from any of: `Authorization: Bearer`,
// the `X-Webhook-Token` header, a `token`/`secret` query parameter, or a
// `token`/`secret` field in the JSON body. Comparison is constant time.
//
// The optional IP allow-list is evaluated before authentication. The
// platform's published webhook egress addresses are always allowed.
// =============================================================================

use std::collections::HashMap;
use std::net::IpAddr;

use axum::http::HeaderMap;

/// Published egress addresses of the charting platform's alert infrastructure.
const BUILTIN_ALLOWED_IPS: &[&str] = &[
    "52.89.214.238",
    "34.212.75.30",
    "54.218.53.128",
    "52.32.178.7",
];

/// Compare two byte slices in constant time. Every byte is examined even
/// after a mismatch so the comparison leaks no position information.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Check the shared secret against every accepted carrier.
///
/// An empty configured secret rejects everything; an unconfigured deployment
/// must not accept trades.
pub fn secret_matches(
    expected: &str,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    body_token: Option<&str>,
) -> bool {
    if expected.is_empty() {
        return false;
    }
    let expected = expected.as_bytes();

    if let Some(value) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            if constant_time_eq(token.as_bytes(), expected) {
                return true;
            }
        }
    }

    if let Some(token) = headers.get("X-Webhook-Token").and_then(|v| v.to_str().ok()) {
        if constant_time_eq(token.as_bytes(), expected) {
            return true;
        }
    }

    for key in ["token", "secret"] {
        if let Some(token) = query.get(key) {
            if constant_time_eq(token.as_bytes(), expected) {
                return true;
            }
        }
    }

    if let Some(token) = body_token {
        if constant_time_eq(token.as_bytes(), expected) {
            return true;
        }
    }

    false
}

/// Evaluate the allow-list. An empty configured list admits any source; a
/// non-empty list admits only its entries plus the built-in addresses.
pub fn ip_allowed(ip: IpAddr, configured: &[String]) -> bool {
    if configured.is_empty() {
        return true;
    }
    let ip_str = ip.to_string();
    BUILTIN_ALLOWED_IPS.contains(&ip_str.as_str())
        || configured.iter().any(|allowed| allowed == &ip_str)
}
