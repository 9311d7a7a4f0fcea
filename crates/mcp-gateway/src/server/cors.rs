//! Per-router CORS and cookie identity extraction.
//!
//! Router CORS policies are config-driven and swap at runtime, so they
//! cannot be installed as a static tower layer; handlers resolve the policy
//! from the runtime snapshot and emit the headers themselves. Preflight
//! OPTIONS requests are answered from the same policy.

use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use base64::Engine;

use crate::model::CorsPolicy;

/// Append the response headers mandated by `policy` for a request from
/// `origin`. Does nothing when the origin is not allowed.
pub fn apply_cors(headers: &mut HeaderMap, policy: &CorsPolicy, origin: Option<&str>) {
    let Some(origin) = origin else { return };
    if !policy.allows_origin(origin) {
        return;
    }

    let allow_origin = if policy.allow_credentials {
        // Credentials forbid the wildcard; echo the caller's origin.
        origin.to_string()
    } else if policy.allow_origins.iter().any(|o| o == "*") {
        "*".to_string()
    } else {
        origin.to_string()
    };

    if let Ok(value) = HeaderValue::from_str(&allow_origin) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    if policy.allow_credentials {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
    }
    if !policy.expose_headers.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&policy.expose_headers.join(", ")) {
            headers.insert(header::ACCESS_CONTROL_EXPOSE_HEADERS, value);
        }
    }
}

/// Answer an OPTIONS preflight for a router.
#[must_use]
pub fn preflight(policy: &CorsPolicy, origin: Option<&str>) -> Response {
    let mut headers = HeaderMap::new();
    apply_cors(&mut headers, policy, origin);

    let methods = if policy.allow_methods.is_empty() {
        "GET, POST, OPTIONS".to_string()
    } else {
        policy.allow_methods.join(", ")
    };
    if let Ok(value) = HeaderValue::from_str(&methods) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, value);
    }

    let allow_headers = if policy.allow_headers.is_empty() {
        "Content-Type, Mcp-Session-Id".to_string()
    } else {
        policy.allow_headers.join(", ")
    };
    if let Ok(value) = HeaderValue::from_str(&allow_headers) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, value);
    }

    (StatusCode::NO_CONTENT, headers).into_response()
}

/// Decode a session-cookie value into a caller identity. Base64-encoded
/// values are decoded; anything else is used verbatim.
#[must_use]
pub fn decode_identity(raw: &str) -> Option<String> {
    if raw.is_empty() {
        return None;
    }
    if let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(raw) {
        if let Ok(text) = String::from_utf8(decoded) {
            return Some(text);
        }
    }
    Some(raw.to_string())
}

/// Extract the caller identity from a captured cookie map.
#[must_use]
pub fn identity_from_cookie(
    cookies: &std::collections::HashMap<String, String>,
    cookie_name: &str,
) -> Option<String> {
    decode_identity(cookies.get(cookie_name)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn policy(origins: &[&str], credentials: bool) -> CorsPolicy {
        CorsPolicy {
            allow_origins: origins.iter().map(|s| (*s).to_string()).collect(),
            allow_credentials: credentials,
            allow_methods: vec![],
            allow_headers: vec![],
            expose_headers: vec![],
        }
    }

    #[test]
    fn test_disallowed_origin_gets_no_headers() {
        let mut headers = HeaderMap::new();
        apply_cors(&mut headers, &policy(&["https://ok.example"], false), Some("https://evil.example"));
        assert!(headers.is_empty());
    }

    #[test]
    fn test_wildcard_without_credentials() {
        let mut headers = HeaderMap::new();
        apply_cors(&mut headers, &policy(&["*"], false), Some("https://app.example"));
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(), "*");
        assert!(headers.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).is_none());
    }

    #[test]
    fn test_credentials_echo_origin() {
        let mut headers = HeaderMap::new();
        apply_cors(&mut headers, &policy(&["*"], true), Some("https://app.example"));
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://app.example"
        );
        assert_eq!(headers.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(), "true");
    }

    #[test]
    fn test_identity_from_cookie_plain_and_base64() {
        let mut cookies = HashMap::new();
        cookies.insert("gateway_session".to_string(), "alice".to_string());
        assert_eq!(
            identity_from_cookie(&cookies, "gateway_session").as_deref(),
            Some("alice")
        );

        let encoded = base64::engine::general_purpose::STANDARD.encode("alice:t1");
        cookies.insert("gateway_session".to_string(), encoded);
        assert_eq!(
            identity_from_cookie(&cookies, "gateway_session").as_deref(),
            Some("alice:t1")
        );

        assert!(identity_from_cookie(&cookies, "other_cookie").is_none());
    }
}
