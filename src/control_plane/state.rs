use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::sync::Mutex;

use crate::manifest::ParsedManifest;
use crate::state::Paths;

/// Shared state for the control plane. `manifest` is swapped (not
/// mutated in place) on a successful `/config/apply`, so concurrent
/// readers never observe a torn update.
pub struct ControlPlaneState {
    pub paths: Paths,
    pub manifest: ArcSwap<ParsedManifest>,
    pub api_secret: Option<String>,
    pub client: reqwest::Client,
    /// Serializes `/config/upload` and `/config/apply` against each
    /// other; read endpoints never take this lock.
    pub write_lock: Mutex<()>,
}

impl ControlPlaneState {
    pub fn new(paths: Paths, manifest: ParsedManifest, api_secret: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            paths,
            manifest: ArcSwap::from_pointee(manifest),
            api_secret,
            client: reqwest::Client::new(),
            write_lock: Mutex::new(()),
        })
    }
}
