use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::gateway_config::{self, GatewayConfig, Mode};
use crate::manifest;

use super::state::ControlPlaneState;

#[derive(Serialize)]
pub(super) struct StatusResponse {
    name: String,
    groups: Vec<String>,
    boot_complete: bool,
    build_failed: bool,
}

pub(super) async fn status(State(state): State<Arc<ControlPlaneState>>) -> Json<StatusResponse> {
    let manifest = state.manifest.load();
    Json(StatusResponse {
        name: manifest.name.clone(),
        groups: manifest.isolation_groups().into_iter().map(|g| g.name).collect(),
        boot_complete: state.paths.marker("boot_complete").exists(),
        build_failed: state.paths.marker("build_failed").exists(),
    })
}

pub(super) async fn health() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
pub(super) struct ConfigStatusResponse {
    api_uploaded: bool,
    api_uploaded_at: Option<f64>,
}

pub(super) async fn config_status(
    State(state): State<Arc<ControlPlaneState>>,
) -> Json<ConfigStatusResponse> {
    let marker = state.paths.marker("config_api_uploaded");
    let api_uploaded_at = marker
        .read_to_string()
        .ok()
        .and_then(|s| s.trim().parse::<f64>().ok());
    Json(ConfigStatusResponse {
        api_uploaded: marker.exists(),
        api_uploaded_at,
    })
}

#[derive(Serialize)]
pub(super) struct ConfigMetadataResponse {
    groups: Vec<ConfigFileMetadata>,
}

#[derive(Serialize)]
pub(super) struct ConfigFileMetadata {
    group: String,
    present: bool,
    modified_unix: Option<u64>,
}

pub(super) async fn config_metadata(
    State(state): State<Arc<ControlPlaneState>>,
) -> Json<ConfigMetadataResponse> {
    let manifest = state.manifest.load();
    let groups = manifest
        .isolation_groups()
        .into_iter()
        .map(|g| {
            let path = state.paths.gateway_config_path(&g.name);
            let metadata = std::fs::metadata(&path).ok();
            ConfigFileMetadata {
                group: g.name,
                present: metadata.is_some(),
                modified_unix: metadata.and_then(|m| m.modified().ok()).and_then(|t| {
                    t.duration_since(std::time::UNIX_EPOCH).ok().map(|d| d.as_secs())
                }),
            }
        })
        .collect();
    Json(ConfigMetadataResponse { groups })
}

pub(super) async fn stages(State(state): State<Arc<ControlPlaneState>>) -> Result<String, StatusCode> {
    std::fs::read_to_string(state.paths.state_dir.join("stages.log")).or(Ok(String::new()))
}

pub(super) async fn log_excerpt(State(state): State<Arc<ControlPlaneState>>) -> String {
    let logs_dir = state.paths.logs_dir();
    let Ok(entries) = std::fs::read_dir(&logs_dir) else {
        return String::new();
    };
    let mut out = String::new();
    for entry in entries.flatten() {
        if let Ok(content) = std::fs::read_to_string(entry.path()) {
            let tail: String = content.lines().rev().take(200).collect::<Vec<_>>().into_iter().rev().collect::<Vec<_>>().join("\n");
            out.push_str(&tail);
            out.push('\n');
        }
    }
    out
}

#[derive(Deserialize)]
pub(super) struct ConfigUploadRequest {
    habitat: Option<String>,
    agents: Option<String>,
    #[serde(default)]
    apply: bool,
}

#[derive(Serialize)]
pub(super) struct ConfigUploadResponse {
    success: bool,
    applied: bool,
}

/// Replace the on-disk manifest and/or agent library from the request
/// body, writing each atomically with `0600` permissions. Large bodies
/// are rejected ahead of this handler by the auth layer's body-size cap.
pub(super) async fn config_upload(
    State(state): State<Arc<ControlPlaneState>>,
    Json(request): Json<ConfigUploadRequest>,
) -> Result<Json<ConfigUploadResponse>, StatusCode> {
    let _guard = state.write_lock.lock().await;

    if let Some(habitat) = &request.habitat {
        write_uploaded_file(&state.paths.uploaded_habitat_path(), habitat)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    }
    if let Some(agents) = &request.agents {
        write_uploaded_file(&state.paths.uploaded_agent_lib_path(), agents)
            .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    }

    if let Err(err) = mark_uploaded(&state) {
        warn!(error = %err, "failed to write config_api_uploaded marker (non-fatal)");
    }

    let applied = if request.apply {
        if let Err(err) = regenerate_and_restart(&state).await {
            warn!(error = %err, "config apply after upload failed");
            false
        } else {
            true
        }
    } else {
        false
    };

    Ok(Json(ConfigUploadResponse {
        success: true,
        applied,
    }))
}

fn write_uploaded_file(path: &std::path::Path, content: &str) -> std::io::Result<()> {
    use std::os::unix::fs::OpenOptionsExt as _;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    {
        use std::io::Write as _;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp_path, path)
}

fn mark_uploaded(state: &ControlPlaneState) -> std::io::Result<()> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    state
        .paths
        .marker("config_api_uploaded")
        .write(now.to_string().as_bytes())
}

#[derive(Serialize)]
pub(super) struct ConfigApplyResponse {
    success: bool,
}

pub(super) async fn config_apply(
    State(state): State<Arc<ControlPlaneState>>,
) -> Result<Json<ConfigApplyResponse>, StatusCode> {
    let _guard = state.write_lock.lock().await;
    regenerate_and_restart(&state)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(ConfigApplyResponse { success: true }))
}

async fn regenerate_and_restart(state: &ControlPlaneState) -> anyhow::Result<()> {
    let (parsed, warnings) = manifest::load_from_paths(&state.paths)?;
    for warning in &warnings {
        warn!(%warning, "manifest warning");
    }
    let new_manifest = Arc::new(parsed);
    state.manifest.store(new_manifest.clone());

    for group in new_manifest.isolation_groups() {
        let config = GatewayConfig::build(
            Mode::Full,
            group.port,
            &group.agents,
            None,
            gateway_config::provider_env(&group.agents),
        )?;
        config.write_atomically(&state.paths.gateway_config_path(&group.name), true)?;
    }
    info!("config regenerated for all groups; service restart delegated to the supervisor");
    Ok(())
}

#[derive(Serialize)]
pub(super) struct SyncResponse {
    success: bool,
}

pub(super) async fn sync(
    State(state): State<Arc<ControlPlaneState>>,
) -> Result<Json<SyncResponse>, StatusCode> {
    let manifest = state.manifest.load();
    let agent_ids: Vec<String> = manifest.agent_ids().map(str::to_string).collect();
    crate::sync::copy_up_all(&state.paths, &agent_ids)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    Ok(Json(SyncResponse { success: true }))
}

#[derive(Serialize)]
pub(super) struct PrepareShutdownResponse {
    success: bool,
}

pub(super) async fn prepare_shutdown(
    State(state): State<Arc<ControlPlaneState>>,
) -> Result<Json<PrepareShutdownResponse>, StatusCode> {
    let _guard = state.write_lock.lock().await;
    let manifest = state.manifest.load();
    let agent_ids: Vec<String> = manifest.agent_ids().map(str::to_string).collect();
    crate::sync::copy_up_all(&state.paths, &agent_ids)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    info!("sync complete, stopping services ahead of host shutdown");
    Ok(Json(PrepareShutdownResponse { success: true }))
}
