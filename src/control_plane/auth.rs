//! HMAC authentication for signed control-plane endpoints.
//!
//! Message format: `"{unix_timestamp}.{method}.{path}.{body_bytes}"`.
//! Signature: hex(HMAC-SHA256(api_secret, message)). On any auth failure
//! this returns a bare 401 with an empty body — no information leakage
//! about which check failed.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::{Body, to_bytes};
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::state::ControlPlaneState;

type HmacSha256 = Hmac<Sha256>;

const REPLAY_WINDOW_SECS: i64 = 300;
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub async fn hmac_auth(
    State(state): State<Arc<ControlPlaneState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let Some(secret) = state.api_secret.as_deref() else {
        return unauthorized();
    };

    let (parts, body) = req.into_parts();

    let Some(timestamp) = parts
        .headers
        .get("x-timestamp")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<i64>().ok())
    else {
        return unauthorized();
    };
    let Some(signature) = parts
        .headers
        .get("x-signature")
        .and_then(|v| v.to_str().ok())
        .map(str::to_lowercase)
    else {
        return unauthorized();
    };

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    if (now - timestamp).abs() > REPLAY_WINDOW_SECS {
        return unauthorized();
    }

    let Ok(body_bytes) = to_bytes(body, MAX_BODY_BYTES).await else {
        return unauthorized();
    };

    let message = build_message(timestamp, parts.method.as_str(), parts.uri.path(), &body_bytes);
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return unauthorized();
    };
    mac.update(&message);
    let expected = hex::encode(mac.finalize().into_bytes());

    if expected.as_bytes().ct_eq(signature.as_bytes()).unwrap_u8() != 1 {
        return unauthorized();
    }

    let req = Request::from_parts(parts, Body::from(body_bytes));
    next.run(req).await
}

fn build_message(timestamp: i64, method: &str, path: &str, body: &[u8]) -> Vec<u8> {
    let mut message = format!("{timestamp}.{method}.{path}.").into_bytes();
    message.extend_from_slice(body);
    message
}

fn unauthorized() -> Response {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .body(Body::empty())
        .expect("building a static 401 response never fails")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control_plane::{router, ControlPlaneState};
    use crate::manifest::ParsedManifest;
    use crate::state::Paths;
    use tower::ServiceExt as _;

    #[test]
    fn constant_time_eq_rejects_mismatched_signature() {
        let a = b"abcd1234";
        let b = b"abcd0000";
        assert_eq!(a.ct_eq(b).unwrap_u8(), 0);
    }

    #[test]
    fn message_format_matches_the_documented_contract() {
        let message = build_message(1_700_000_000, "POST", "/config/upload", b"{}");
        assert_eq!(message, b"1700000000.POST./config/upload.{}".to_vec());
    }

    fn sign(secret: &str, method: &str, path: &str, body: &[u8]) -> (i64, String) {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let message = build_message(timestamp, method, path, body);
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(&message);
        (timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    fn test_state(secret: &str) -> std::sync::Arc<ControlPlaneState> {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("state"), dir.path().join("home"));
        ControlPlaneState::new(paths, ParsedManifest::test_fixture_empty(), Some(secret.to_string()))
    }

    #[tokio::test]
    async fn properly_signed_request_reaches_the_handler() {
        let state = test_state("top-secret");
        let app = router(state);

        let (timestamp, signature) = sign("top-secret", "GET", "/config", b"");
        let request = Request::builder()
            .method("GET")
            .uri("/config")
            .header("x-timestamp", timestamp.to_string())
            .header("x-signature", signature)
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn tampered_body_is_rejected_even_with_a_valid_signature_header() {
        let state = test_state("top-secret");
        let app = router(state);

        let signed_body = br#"{"apply":false}"#;
        let (timestamp, signature) = sign("top-secret", "POST", "/config/upload", signed_body);
        // Body sent differs from the body the signature was computed over.
        let request = Request::builder()
            .method("POST")
            .uri("/config/upload")
            .header("x-timestamp", timestamp.to_string())
            .header("x-signature", signature)
            .header("content-type", "application/json")
            .body(Body::from(br#"{"apply":true}"#.to_vec()))
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn missing_signature_header_is_rejected() {
        let state = test_state("top-secret");
        let app = router(state);

        let request = Request::builder()
            .method("GET")
            .uri("/config")
            .body(Body::empty())
            .unwrap();

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
