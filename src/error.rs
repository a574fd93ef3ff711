//! Crate-wide error types.

use thiserror::Error;

use crate::control_plane::ControlPlaneError;
use crate::gateway_config::ConfigError;
use crate::manifest::ManifestError;
use crate::probe::ProbeError;
use crate::sync::SyncError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
