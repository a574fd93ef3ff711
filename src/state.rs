//! Filesystem layout and marker-file primitives shared by every component.
//!
//! A marker is a presence-only (or small-content) file used to synchronize
//! independent processes. Writers always go through `Marker::write`, which
//! performs the write-temp/fsync/rename sequence required for every durable
//! state transition.

use std::io::Write as _;
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Resolves the on-disk layout under the state root:
/// `markers/`, `logs/`, and per-agent workspaces under the host home.
#[derive(Debug, Clone)]
pub struct Paths {
    /// System state directory (markers, logs). Owned by the host user.
    pub state_dir: PathBuf,
    /// Host user home directory (workspaces, gateway config subtree).
    pub home_dir: PathBuf,
}

impl Paths {
    /// Resolve from `$OUTPOST_STATE_DIR`/`$OUTPOST_HOME`, falling back to
    /// `~/.outpost/state` and `~/.outpost/home`.
    pub fn from_env() -> Self {
        let base = dirs::data_dir()
            .map(|d| d.join("outpost"))
            .unwrap_or_else(|| PathBuf::from("./.outpost"));

        let state_dir = std::env::var("OUTPOST_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| base.join("state"));
        let home_dir = std::env::var("OUTPOST_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| base.join("home"));

        Self {
            state_dir,
            home_dir,
        }
    }

    pub fn new(state_dir: impl Into<PathBuf>, home_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            home_dir: home_dir.into(),
        }
    }

    pub fn markers_dir(&self) -> PathBuf {
        self.state_dir.join("markers")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    pub fn workspace_dir(&self, agent_id: &str) -> PathBuf {
        self.home_dir.join("workspaces").join(agent_id)
    }

    pub fn safe_mode_workspace_dir(&self) -> PathBuf {
        self.home_dir.join("workspaces").join("safe-mode")
    }

    pub fn gateway_config_dir(&self) -> PathBuf {
        self.home_dir.join("gateway")
    }

    pub fn gateway_config_path(&self, group: &str) -> PathBuf {
        self.gateway_config_dir().join(format!("{group}.json"))
    }

    /// On-disk copy of the last manifest uploaded through the control
    /// plane, superseding the boot-time `HABITAT_B64` env value once present.
    pub fn uploaded_habitat_path(&self) -> PathBuf {
        self.state_dir.join("HABITAT_B64")
    }

    /// On-disk copy of the last agent library uploaded through the control
    /// plane, superseding the boot-time `AGENT_LIB_B64` env value once present.
    pub fn uploaded_agent_lib_path(&self) -> PathBuf {
        self.state_dir.join("AGENT_LIB_B64")
    }

    /// A marker path for a simple, non-grouped marker (e.g. `build_failed`).
    pub fn marker(&self, name: &str) -> Marker {
        Marker::new(self.markers_dir().join(name))
    }

    /// A marker path for a per-group marker (e.g. `unhealthy[<group>]`).
    pub fn group_marker(&self, kind: &str, group: &str) -> Marker {
        Marker::new(self.markers_dir().join(kind).join(group))
    }
}

/// A single presence/content marker file, written atomically.
#[derive(Debug, Clone)]
pub struct Marker {
    path: PathBuf,
}

impl Marker {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Create the marker with empty content if it is absent. Idempotent:
    /// concurrent creates are race-tolerant because callers trigger on
    /// presence, not on which writer won.
    pub fn touch(&self) -> std::io::Result<()> {
        if self.exists() {
            return Ok(());
        }
        self.write(b"")
    }

    /// Write (or replace) the marker's content atomically.
    pub fn write(&self, content: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = self
            .path
            .with_extension(format!("tmp-{}", Uuid::new_v4()));
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(content)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }

    pub fn read(&self) -> std::io::Result<Vec<u8>> {
        std::fs::read(&self.path)
    }

    pub fn read_to_string(&self) -> std::io::Result<String> {
        std::fs::read_to_string(&self.path)
    }

    pub fn remove(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_write_is_atomic_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        let marker = Marker::new(dir.path().join("nested").join("unhealthy"));
        assert!(!marker.exists());
        marker.write(b"group-a").unwrap();
        assert!(marker.exists());
        assert_eq!(marker.read().unwrap(), b"group-a");
        // no stray temp files left behind
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn touch_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let marker = Marker::new(dir.path().join("m"));
        marker.touch().unwrap();
        marker.write(b"keep-me").unwrap();
        marker.touch().unwrap();
        assert_eq!(marker.read().unwrap(), b"keep-me");
    }

    #[test]
    fn group_markers_are_keyed_by_group_name() {
        let paths = Paths::new(tempfile::tempdir().unwrap().keep(), "/tmp/home-unused");
        let a = paths.group_marker("unhealthy", "alpha");
        let b = paths.group_marker("unhealthy", "beta");
        assert_ne!(a.path(), b.path());
    }
}
