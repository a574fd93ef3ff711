//! HTTP control plane: signed endpoints for uploading and applying a new
//! manifest, reporting status, and coordinating shutdown.

pub mod auth;
pub mod routes;
pub mod state;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use thiserror::Error;

pub use state::ControlPlaneState;

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("binding to all interfaces requires a configured api_secret")]
    MissingApiSecretForNonLoopbackBind,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ControlPlaneError>;

/// Resolve the bind address: loopback by default, all interfaces only if
/// the manifest opts in, and only ever with a secret configured.
pub fn resolve_bind_addr(
    requested: Option<&str>,
    api_secret: &Option<String>,
    port: u16,
) -> Result<SocketAddr> {
    match requested {
        None | Some("loopback") | Some("127.0.0.1") => {
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
        }
        Some(_all_interfaces) => {
            if api_secret.is_none() {
                return Err(ControlPlaneError::MissingApiSecretForNonLoopbackBind);
            }
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
        }
    }
}

/// Build the full router: unauthenticated endpoints, plus HMAC-guarded
/// endpoints behind `auth::hmac_auth`. Write endpoints additionally
/// serialize on `state.write_lock` inside their own handlers so read
/// endpoints stay unrestricted.
pub fn router(state: Arc<ControlPlaneState>) -> Router {
    let public = Router::new()
        .route("/status", get(routes::status))
        .route("/health", get(routes::health))
        .route("/config/status", get(routes::config_status));

    let signed = Router::new()
        .route("/config", get(routes::config_metadata))
        .route("/stages", get(routes::stages))
        .route("/log", get(routes::log_excerpt))
        .route("/config/upload", post(routes::config_upload))
        .route("/config/apply", post(routes::config_apply))
        .route("/sync", post(routes::sync))
        .route("/prepare-shutdown", post(routes::prepare_shutdown))
        .layer(middleware::from_fn_with_state(state.clone(), auth::hmac_auth));

    public.merge(signed).with_state(state)
}
