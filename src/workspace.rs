//! Workspace generator: creates each agent's exclusive workspace directory
//! and the canned safe-mode workspace.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::manifest::Agent;
use crate::state::Paths;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

const SAFE_MODE_IDENTITY: &str = "\
# Identity

Recovery is in progress. Your regular configuration could not be \
validated at boot, so this instance is running in a temporary, reduced \
capacity. Credential discovery and recovery are being retried \
automatically; normal service will resume once a working configuration \
is restored.
";

/// Create (or refresh) the per-agent workspace tree: identity, persona,
/// boot, bootstrap, and user-context files, plus an `auth/` subtree for
/// per-agent authentication profiles. Directories are created with their
/// final permissions in one `create_dir` call — ownership is never fixed
/// up afterwards by a recursive walk.
pub fn generate_agent_workspace(paths: &Paths, agent: &Agent) -> Result<PathBuf> {
    let dir = paths.workspace_dir(&agent.id);
    create_private_dir_all(&dir)?;

    let auth_dir = dir.join("auth");
    create_private_dir_all(&auth_dir)?;

    write_if_some(&dir.join("IDENTITY.md"), agent.identity.as_deref())?;
    write_if_some(&dir.join("PERSONA.md"), agent.persona.as_deref())?;
    write_if_some(&dir.join("BOOT.md"), agent.boot.as_deref())?;
    write_if_some(&dir.join("BOOTSTRAP.md"), agent.bootstrap.as_deref())?;
    write_if_some(&dir.join("USER.md"), agent.user_context.as_deref())?;

    debug!(agent_id = %agent.id, path = %dir.display(), "generated agent workspace");
    Ok(dir)
}

/// Create every agent's workspace plus the always-present safe-mode
/// workspace. Returns the list of created agent workspace directories.
pub fn generate_all(paths: &Paths, agents: &[Agent]) -> Result<Vec<PathBuf>> {
    let mut created = Vec::with_capacity(agents.len());
    for agent in agents {
        created.push(generate_agent_workspace(paths, agent)?);
    }
    generate_safe_mode_workspace(paths)?;
    Ok(created)
}

/// The safe-mode workspace is always created regardless of whether safe
/// mode is ever entered, populated with a canned identity file explaining
/// that recovery is in progress.
pub fn generate_safe_mode_workspace(paths: &Paths) -> Result<PathBuf> {
    let dir = paths.safe_mode_workspace_dir();
    create_private_dir_all(&dir)?;
    std::fs::write(dir.join("IDENTITY.md"), SAFE_MODE_IDENTITY)?;
    Ok(dir)
}

fn write_if_some(path: &Path, content: Option<&str>) -> Result<()> {
    if let Some(content) = content {
        std::fs::write(path, content)?;
    }
    Ok(())
}

#[cfg(unix)]
fn create_private_dir_all(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt as _;

    if dir.exists() {
        return Ok(());
    }
    if let Some(parent) = dir.parent() {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(parent)?;
    }
    std::fs::DirBuilder::new()
        .mode(0o700)
        .create(dir)
        .or_else(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                Ok(())
            } else {
                Err(e)
            }
        })?;
    Ok(())
}

#[cfg(not(unix))]
fn create_private_dir_all(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Isolation;
    use std::collections::BTreeMap;

    fn agent(id: &str) -> Agent {
        Agent {
            id: id.to_string(),
            isolation_group: id.to_string(),
            isolation: Isolation::None,
            model: "anthropic/claude".to_string(),
            tokens: BTreeMap::new(),
            provider_keys: BTreeMap::new(),
            identity: Some("I am an agent.".to_string()),
            persona: Some("Friendly and terse.".to_string()),
            boot: None,
            bootstrap: None,
            user_context: Some("The user prefers concise answers.".to_string()),
            potentially_unverifiable: false,
        }
    }

    #[test]
    fn writes_only_the_files_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("state"), dir.path().join("home"));
        let workspace = generate_agent_workspace(&paths, &agent("alpha")).unwrap();

        assert!(workspace.join("IDENTITY.md").exists());
        assert!(workspace.join("PERSONA.md").exists());
        assert!(workspace.join("USER.md").exists());
        assert!(!workspace.join("BOOT.md").exists());
        assert!(!workspace.join("BOOTSTRAP.md").exists());
        assert!(workspace.join("auth").is_dir());
    }

    #[test]
    fn safe_mode_workspace_always_has_canned_identity() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("state"), dir.path().join("home"));
        let workspace = generate_safe_mode_workspace(&paths).unwrap();
        let content = std::fs::read_to_string(workspace.join("IDENTITY.md")).unwrap();
        assert!(content.contains("Recovery is in progress"));
    }

    #[test]
    fn generate_all_covers_every_agent_plus_safe_mode() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("state"), dir.path().join("home"));
        let agents = vec![agent("alpha"), agent("beta")];
        let created = generate_all(&paths, &agents).unwrap();
        assert_eq!(created.len(), 2);
        assert!(paths.safe_mode_workspace_dir().join("IDENTITY.md").exists());
    }

    #[cfg(unix)]
    #[test]
    fn workspace_directory_is_private() {
        use std::os::unix::fs::PermissionsExt as _;
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("state"), dir.path().join("home"));
        let workspace = generate_agent_workspace(&paths, &agent("alpha")).unwrap();
        let mode = std::fs::metadata(&workspace).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
    }
}
