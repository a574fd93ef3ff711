//! Workspace sync engine: copy-up/restore against an external object store,
//! accessed only through file-level copy (no real external dependency
//! available in this environment).

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

use crate::state::Paths;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("restore guard file is absent; refusing to copy up (would risk wiping remote state)")]
    RestoreGuardMissing,

    #[error("local generation {local} is older than remote generation {remote}; refusing to copy up")]
    StaleGeneration { local: u64, remote: u64 },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

const MAX_FILE_BYTES: u64 = 1024 * 1024;

/// Abstracts the external object store as file-level copy, so tests run
/// against a local directory instead of a real remote service.
#[async_trait::async_trait]
pub trait SyncTarget: Send + Sync {
    async fn copy_up(&self, local_path: &Path, remote_relative: &Path) -> anyhow::Result<()>;
    async fn restore(&self, remote_relative: &Path, local_path: &Path) -> anyhow::Result<bool>;
    async fn read_generation(&self) -> anyhow::Result<Option<u64>>;
    async fn write_generation(&self, generation: u64) -> anyhow::Result<()>;
    async fn list_remote_relative(&self, prefix: &Path) -> anyhow::Result<Vec<PathBuf>>;
}

/// Production implementation: a directory tree reachable via plain
/// filesystem operations, standing in for whatever remote mount the
/// external sync utility presents. No real object store dependency is
/// in scope here.
pub struct DirectorySyncTarget {
    pub root: PathBuf,
}

#[async_trait::async_trait]
impl SyncTarget for DirectorySyncTarget {
    async fn copy_up(&self, local_path: &Path, remote_relative: &Path) -> anyhow::Result<()> {
        let dest = self.root.join(remote_relative);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(local_path, &dest).await?;
        Ok(())
    }

    async fn restore(&self, remote_relative: &Path, local_path: &Path) -> anyhow::Result<bool> {
        let src = self.root.join(remote_relative);
        if !src.exists() {
            return Ok(false);
        }
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&src, local_path).await?;
        Ok(true)
    }

    async fn read_generation(&self) -> anyhow::Result<Option<u64>> {
        let path = self.root.join(".generation");
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(contents.trim().parse().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_generation(&self, generation: u64) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::write(self.root.join(".generation"), generation.to_string()).await?;
        Ok(())
    }

    async fn list_remote_relative(&self, prefix: &Path) -> anyhow::Result<Vec<PathBuf>> {
        let dir = self.root.join(prefix);
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            out.push(prefix.join(entry.file_name()));
        }
        Ok(out)
    }
}

fn restore_guard(paths: &Paths) -> crate::state::Marker {
    paths.marker("restore_complete")
}

/// Single pass restore: walks the remote's per-agent and shared
/// directories and copies whatever is present down locally. On a fresh
/// host with no remote state, this is a no-op that still sets the guard
/// (there being nothing to overwrite on a later copy-up).
pub async fn restore(paths: &Paths, target: &dyn SyncTarget, agent_ids: &[String]) -> Result<()> {
    for agent_id in agent_ids {
        let remote_dir = PathBuf::from("agents").join(agent_id);
        let local_dir = paths.workspace_dir(agent_id);
        copy_tree_down(target, target.list_remote_relative(&remote_dir).await.unwrap_or_default(), &local_dir).await?;
    }

    let shared_remote = PathBuf::from("shared");
    let shared_local = paths.home_dir.join("shared");
    copy_tree_down(
        target,
        target.list_remote_relative(&shared_remote).await.unwrap_or_default(),
        &shared_local,
    )
    .await?;

    restore_guard(paths).touch()?;
    info!("restore pass complete");
    Ok(())
}

async fn copy_tree_down(target: &dyn SyncTarget, remote_paths: Vec<PathBuf>, local_dir: &Path) -> Result<()> {
    for remote_relative in remote_paths {
        let Some(filename) = remote_relative.file_name() else {
            continue;
        };
        let local_path = local_dir.join(filename);
        let _ = target.restore(&remote_relative, &local_path).await;
    }
    Ok(())
}

/// Copy-up: additive only, skips symlinks, enforces the per-file size
/// cap, and refuses outright unless the restore guard is present and the
/// local generation is at least the remote's.
pub async fn copy_up_all(paths: &Paths, agent_ids: &[String]) -> Result<()> {
    if !restore_guard(paths).exists() {
        return Err(SyncError::RestoreGuardMissing);
    }

    // A fresh DirectorySyncTarget pointed at the conventional remote mount.
    // Production deployments would inject a differently-configured target;
    // tests construct their own DirectorySyncTarget against a temp dir and
    // call `copy_up` directly instead of through this convenience wrapper.
    let target = DirectorySyncTarget {
        root: paths.state_dir.join("remote"),
    };
    copy_up_with_target(paths, &target, agent_ids).await
}

pub async fn copy_up_with_target(paths: &Paths, target: &dyn SyncTarget, agent_ids: &[String]) -> Result<()> {
    if !restore_guard(paths).exists() {
        return Err(SyncError::RestoreGuardMissing);
    }

    let local_generation = host_creation_generation(paths).await?;
    if let Some(remote_generation) = target.read_generation().await.unwrap_or(None) {
        if local_generation < remote_generation {
            return Err(SyncError::StaleGeneration {
                local: local_generation,
                remote: remote_generation,
            });
        }
    }

    for agent_id in agent_ids {
        let local_dir = paths.workspace_dir(agent_id);
        copy_tree_up(target, &local_dir, &PathBuf::from("agents").join(agent_id)).await?;
    }
    let shared_local = paths.home_dir.join("shared");
    copy_tree_up(target, &shared_local, &PathBuf::from("shared")).await?;

    target
        .write_generation(local_generation)
        .await
        .map_err(|e| SyncError::Io(std::io::Error::other(e)))?;
    Ok(())
}

async fn copy_tree_up(target: &dyn SyncTarget, local_dir: &Path, remote_prefix: &Path) -> Result<()> {
    if !local_dir.exists() {
        return Ok(());
    }
    let mut stack = vec![local_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if metadata.is_symlink() {
                continue;
            }
            if metadata.is_dir() {
                stack.push(entry.path());
                continue;
            }
            if metadata.len() > MAX_FILE_BYTES {
                warn!(path = %entry.path().display(), "skipping file over the per-file sync size cap");
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(local_dir) else {
                continue;
            };
            let remote_relative = remote_prefix.join(relative);
            if let Err(err) = target.copy_up(&entry.path(), &remote_relative).await {
                warn!(path = %entry.path().display(), error = %err, "copy-up failed for one file");
            }
        }
    }
    Ok(())
}

/// The host's creation timestamp, persisted once on first boot and
/// reused thereafter so the generation counter is stable across
/// restarts of this process.
async fn host_creation_generation(paths: &Paths) -> Result<u64> {
    let marker = paths.marker("host_generation");
    if let Ok(existing) = marker.read_to_string() {
        if let Ok(parsed) = existing.trim().parse() {
            return Ok(parsed);
        }
    }
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    marker.write(now.to_string().as_bytes())?;
    Ok(now)
}
