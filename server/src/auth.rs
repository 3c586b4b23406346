//! HMAC-SHA256 request authentication for the tunnel-creation routes.
//!
//! Signature input is `METHOD + PATH + TIMESTAMP + NONCE + BODY`; the nonce
//! doubles as a replay token checked against [`NonceCache`].

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::warn;

use crate::admin::AdminState;
use crate::config::ServerConfig;
use crate::nonce::NonceCache;

type HmacSha256 = Hmac<Sha256>;

const MAX_SIGNED_BODY: usize = 1024 * 1024;

fn unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

pub struct HmacAuthenticator {
    mac: HmacSha256,
    tolerance_secs: i64,
    nonce_threshold_secs: i64,
    nonce_ttl: Duration,
    nonces: Arc<NonceCache>,
}

impl HmacAuthenticator {
    pub fn new(secret: &str, config: &ServerConfig, nonces: Arc<NonceCache>) -> Self {
        Self {
            mac: HmacSha256::new_from_slice(secret.as_bytes())
                .expect("hmac accepts any key size"),
            tolerance_secs: config.hmac_timestamp_tolerance_secs,
            nonce_threshold_secs: config.hmac_nonce_threshold_secs,
            nonce_ttl: config.hmac_nonce_cache_ttl,
            nonces,
        }
    }

    /// Runs the validation chain; the first failing step names the reason.
    /// The nonce only enters the replay cache after the signature checks out.
    pub fn validate(
        &self,
        method: &str,
        path: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> std::result::Result<(), &'static str> {
        let auth = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or("missing Authorization header")?;
        let tag_hex = parse_authorization(auth).ok_or("malformed Authorization header")?;

        let ts_raw = headers
            .get("x-timestamp")
            .and_then(|v| v.to_str().ok())
            .ok_or("missing timestamp")?;
        let ts: i64 = ts_raw.trim().parse().map_err(|_| "invalid timestamp")?;
        if (unix_secs() - ts).abs() > self.tolerance_secs {
            return Err("timestamp outside tolerance");
        }

        let nonce_raw = headers
            .get("x-nonce")
            .and_then(|v| v.to_str().ok())
            .ok_or("missing nonce")?;
        let nonce: i64 = nonce_raw.trim().parse().map_err(|_| "invalid nonce")?;
        let low = (ts - self.nonce_threshold_secs).saturating_mul(1000);
        let high = (ts + self.tolerance_secs).saturating_mul(1000);
        if nonce < low || nonce > high {
            return Err("nonce outside allowed window");
        }
        if self.nonces.has(nonce_raw) {
            return Err("nonce replayed");
        }

        let tag = hex::decode(tag_hex).map_err(|_| "malformed Authorization header")?;
        let mut mac = self.mac.clone();
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(ts_raw.as_bytes());
        mac.update(nonce_raw.as_bytes());
        mac.update(body);
        mac.verify_slice(&tag).map_err(|_| "signature mismatch")?;

        self.nonces.add(nonce_raw, self.nonce_ttl);
        Ok(())
    }

    /// Lowercase hex signature over the canonical input. Deterministic for
    /// identical inputs.
    pub fn signature_hex(
        &self,
        method: &str,
        path: &str,
        timestamp: &str,
        nonce: &str,
        body: &[u8],
    ) -> String {
        let mut mac = self.mac.clone();
        mac.update(method.as_bytes());
        mac.update(path.as_bytes());
        mac.update(timestamp.as_bytes());
        mac.update(nonce.as_bytes());
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }
}

/// `Authorization: HMAC sha256=<hex>`, whitespace-tolerant between scheme
/// and parameter.
fn parse_authorization(value: &str) -> Option<&str> {
    let rest = value.strip_prefix("HMAC")?;
    let trimmed = rest.trim_start();
    if trimmed.len() == rest.len() {
        return None;
    }
    let tag = trimmed.strip_prefix("sha256=")?;
    (!tag.is_empty() && tag.bytes().all(|b| b.is_ascii_hexdigit())).then_some(tag)
}

/// Middleware for the tunnel-creation routes. A no-op when no secret is
/// configured; `/api/status` never passes through here.
pub async fn require_hmac(State(state): State<AdminState>, req: Request, next: Next) -> Response {
    let Some(auth) = state.auth.clone() else {
        return next.run(req).await;
    };

    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_SIGNED_BODY).await {
        Ok(bytes) => bytes,
        Err(_) => return reject("request body too large"),
    };

    match auth.validate(parts.method.as_str(), parts.uri.path(), &parts.headers, &bytes) {
        Ok(()) => {
            let req = Request::from_parts(parts, Body::from(bytes));
            next.run(req).await
        }
        Err(reason) => {
            warn!(path = %parts.uri.path(), reason, "rejected tunnel-creation request");
            reject(reason)
        }
    }
}

fn reject(reason: &str) -> Response {
    let message = if cfg!(debug_assertions) {
        reason
    } else {
        "request could not be authenticated"
    };
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "error": "Authentication failed",
            "message": message,
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const SECRET: &str = "test-secret-at-least-32-chars-long-12345";

    fn authenticator() -> HmacAuthenticator {
        let config = ServerConfig::default();
        HmacAuthenticator::new(SECRET, &config, Arc::new(NonceCache::new()))
    }

    fn signed_headers(
        auth: &HmacAuthenticator,
        method: &str,
        path: &str,
        body: &[u8],
    ) -> HeaderMap {
        let ts = unix_secs().to_string();
        let nonce = (unix_secs() * 1000).to_string();
        headers_for(auth, method, path, &ts, &nonce, body)
    }

    fn headers_for(
        auth: &HmacAuthenticator,
        method: &str,
        path: &str,
        ts: &str,
        nonce: &str,
        body: &[u8],
    ) -> HeaderMap {
        let sig = auth.signature_hex(method, path, ts, nonce, body);
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("HMAC sha256={sig}")).unwrap(),
        );
        headers.insert("x-timestamp", HeaderValue::from_str(ts).unwrap());
        headers.insert("x-nonce", HeaderValue::from_str(nonce).unwrap());
        headers
    }

    #[test]
    fn test_valid_signature_accepted() {
        let auth = authenticator();
        let headers = signed_headers(&auth, "GET", "/my-tunnel", b"");
        assert_eq!(auth.validate("GET", "/my-tunnel", &headers, b""), Ok(()));
    }

    #[test]
    fn test_replayed_nonce_rejected() {
        let auth = authenticator();
        let headers = signed_headers(&auth, "GET", "/my-tunnel", b"");
        assert_eq!(auth.validate("GET", "/my-tunnel", &headers, b""), Ok(()));
        assert_eq!(
            auth.validate("GET", "/my-tunnel", &headers, b""),
            Err("nonce replayed")
        );
    }

    #[test]
    fn test_skewed_timestamp_rejected() {
        let auth = authenticator();
        let ts = (unix_secs() - 3_600).to_string();
        let nonce = ((unix_secs() - 3_600) * 1000).to_string();
        let headers = headers_for(&auth, "GET", "/my-tunnel", &ts, &nonce, b"");
        assert_eq!(
            auth.validate("GET", "/my-tunnel", &headers, b""),
            Err("timestamp outside tolerance")
        );
    }

    #[test]
    fn test_stale_nonce_rejected() {
        let auth = authenticator();
        let ts = unix_secs().to_string();
        let nonce = ((unix_secs() - 7_200) * 1000).to_string();
        let headers = headers_for(&auth, "GET", "/my-tunnel", &ts, &nonce, b"");
        assert_eq!(
            auth.validate("GET", "/my-tunnel", &headers, b""),
            Err("nonce outside allowed window")
        );
    }

    #[test]
    fn test_tampered_signature_rejected() {
        let auth = authenticator();
        let mut headers = signed_headers(&auth, "GET", "/my-tunnel", b"");
        let ts = unix_secs().to_string();
        let sig = auth.signature_hex("GET", "/other-path", &ts, "1", b"");
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("HMAC sha256={sig}")).unwrap(),
        );
        assert_eq!(
            auth.validate("GET", "/my-tunnel", &headers, b""),
            Err("signature mismatch")
        );
    }

    #[test]
    fn test_malformed_authorization_header() {
        let auth = authenticator();
        for bad in [
            "Bearer abc",
            "HMAC",
            "HMAC sha256=",
            "HMAC sha256=nothex",
            "HMACsha256=abcdef",
            "HMAC md5=abcdef",
        ] {
            let mut headers = signed_headers(&auth, "GET", "/my-tunnel", b"");
            headers.insert(header::AUTHORIZATION, HeaderValue::from_str(bad).unwrap());
            assert_eq!(
                auth.validate("GET", "/my-tunnel", &headers, b""),
                Err("malformed Authorization header"),
                "accepted {bad:?}"
            );
        }
    }

    #[test]
    fn test_missing_headers() {
        let auth = authenticator();
        let headers = HeaderMap::new();
        assert_eq!(
            auth.validate("GET", "/my-tunnel", &headers, b""),
            Err("missing Authorization header")
        );

        let mut headers = signed_headers(&auth, "GET", "/my-tunnel", b"");
        headers.remove("x-timestamp");
        assert_eq!(
            auth.validate("GET", "/my-tunnel", &headers, b""),
            Err("missing timestamp")
        );

        let mut headers = signed_headers(&auth, "GET", "/my-tunnel", b"");
        headers.remove("x-nonce");
        assert_eq!(
            auth.validate("GET", "/my-tunnel", &headers, b""),
            Err("missing nonce")
        );
    }

    #[test]
    fn test_signature_is_deterministic() {
        let auth = authenticator();
        let a = auth.signature_hex("GET", "/my-tunnel", "1700000000", "1700000000000", b"");
        let b = auth.signature_hex("GET", "/my-tunnel", "1700000000", "1700000000000", b"");
        assert_eq!(a, b);
        assert_eq!(a, a.to_lowercase());
        assert_eq!(a.len(), 64);
    }
}
