//! Safe mode handler: triggered by the appearance of `unhealthy[<group>]`.
//! Runs in a separate unit so recovery is never a self-referential service
//! restart.

use std::collections::BTreeMap;
use std::io::{Read as _, Seek as _, SeekFrom, Write as _};

use fs2::FileExt as _;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::credentials::{self, ChatPlatform};
use crate::gateway_config::{GatewayConfig, Mode};
use crate::manifest::Agent;
use crate::notify_chat;
use crate::state::Paths;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, Error)]
pub enum SafeModeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] crate::gateway_config::ConfigError),
}

pub type Result<T> = std::result::Result<T, SafeModeError>;

/// Outcome of one escalation attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    /// A working credential pair was found, a config was synthesized, and
    /// the gateway was restarted.
    Recovered,
    /// Escalation ladder exhausted; the caller must exit 2.
    Critical,
}

/// Restarts the gateway service for a group. Abstracted so the handler is
/// testable without a real service supervisor.
pub trait GatewayRestarter {
    fn restart(&self, group: &str) -> anyhow::Result<()>;
}

/// Production implementation: `systemctl restart` against the group's
/// gateway unit name (see `services::ServiceUnit::gateway_unit_name`).
pub struct SystemdRestarter;

impl GatewayRestarter for SystemdRestarter {
    fn restart(&self, group: &str) -> anyhow::Result<()> {
        let unit = format!("outpost-gateway@{group}.service");
        let status = std::process::Command::new("systemctl")
            .args(["restart", &unit])
            .status()?;
        anyhow::ensure!(status.success(), "systemctl restart {unit} exited with {status}");
        Ok(())
    }
}

/// Checks whether the just-restarted gateway now passes its probe.
/// Abstracted for the same reason — the handler owns the escalation
/// ladder, not the probe implementation.
#[async_trait::async_trait]
pub trait PostRestartProbe {
    async fn passes(&self, group: &str) -> bool;
}

/// Guards `recovery_attempts[<group>]` with an `fs2` advisory exclusive
/// lock rather than an in-process mutex, since the handler runs as a
/// separate supervised unit per group.
fn recovery_attempts_path(paths: &Paths, group: &str) -> std::path::PathBuf {
    paths.markers_dir().join("recovery_attempts").join(group)
}

fn with_locked_counter<T>(
    paths: &Paths,
    group: &str,
    f: impl FnOnce(&mut u32) -> T,
) -> Result<T> {
    let path = recovery_attempts_path(paths, group);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(&path)?;
    file.lock_exclusive()?;

    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    let mut count: u32 = contents.trim().parse().unwrap_or(0);

    let result = f(&mut count);

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "{count}")?;
    file.sync_all()?;
    fs2::FileExt::unlock(&file)?;
    Ok(result)
}

pub fn clear_recovery_attempts(paths: &Paths, group: &str) -> Result<()> {
    with_locked_counter(paths, group, |count| *count = 0)
}

/// Run one pass of the escalation ladder for `group`. Callers re-invoke
/// this (as a separate unit invocation, per attempt) until it reports
/// `Critical` or `Recovered`.
pub async fn handle_unhealthy(
    paths: &Paths,
    group: &str,
    agents: &[Agent],
    preferred_platform: ChatPlatform,
    preferred_provider: Option<credentials::Provider>,
    client: &reqwest::Client,
    restarter: &dyn GatewayRestarter,
    probe: &dyn PostRestartProbe,
    owner_chat_id: &str,
    max_attempts: u32,
) -> Result<Outcome> {
    let attempt = with_locked_counter(paths, group, |count| {
        *count += 1;
        *count
    })?;

    if attempt > max_attempts {
        error!(group, attempt, "recovery attempts exhausted, escalating to critical");
        send_critical_notification(client, agents, owner_chat_id, preferred_platform, group).await;
        return Ok(Outcome::Critical);
    }

    let chat_token = credentials::find_working_chat_token(client, agents, preferred_platform, group).await;
    let provider_keys: BTreeMap<String, String> = agents
        .iter()
        .flat_map(|a| a.provider_keys.iter())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let provider = credentials::find_working_provider(client, &provider_keys, preferred_provider).await;

    let (Some((agent_id, token, platform)), Some(provider_ctx)) = (chat_token, provider) else {
        warn!(group, "discovery failed, falling back to pre-synthesized emergency config");
        return install_emergency_config(paths, group, agents, restarter, client, owner_chat_id, preferred_platform)
            .await
            .map(|()| Outcome::Critical);
    };

    let safe_mode_agents: Vec<Agent> = agents
        .iter()
        .filter(|a| a.id == agent_id)
        .cloned()
        .collect();
    let config = GatewayConfig::build(
        Mode::SafeMode,
        crate::manifest::BASE_GATEWAY_PORT,
        &safe_mode_agents,
        None,
        BTreeMap::from([(provider_ctx.provider.as_str().to_string(), provider_ctx.key.clone())]),
    )?;
    config.write_atomically(&paths.gateway_config_path(group), true)?;

    restarter
        .restart(group)
        .map_err(|e| SafeModeError::Io(std::io::Error::other(e)))?;

    send_safe_mode_entry_notifications(client, &[(platform, token.to_string())], owner_chat_id, preferred_platform, group)
        .await;

    if probe.passes(group).await {
        info!(group, "post-restart probe passed");
        clear_recovery_attempts(paths, group)?;
        Ok(Outcome::Recovered)
    } else {
        warn!(group, "post-restart probe failed, will retry discovery on next attempt");
        Ok(Outcome::Critical)
    }
}

/// Emergency config: pins agent-1's exact configured credentials with no
/// further fallback logic, to minimize the blast radius of a buggy
/// recovery path.
async fn install_emergency_config(
    paths: &Paths,
    group: &str,
    agents: &[Agent],
    restarter: &dyn GatewayRestarter,
    client: &reqwest::Client,
    owner_chat_id: &str,
    preferred_platform: ChatPlatform,
) -> Result<()> {
    let Some(first_agent) = agents.first() else {
        send_critical_notification(client, agents, owner_chat_id, preferred_platform, group).await;
        return Ok(());
    };

    let config = GatewayConfig::build(
        Mode::Emergency,
        crate::manifest::BASE_GATEWAY_PORT,
        std::slice::from_ref(first_agent),
        None,
        first_agent.provider_keys.clone(),
    )?;
    config.write_atomically(&paths.gateway_config_path(group), true)?;

    if restarter.restart(group).is_err() {
        warn!(group, "emergency config restart failed");
    }
    send_critical_notification(client, agents, owner_chat_id, preferred_platform, group).await;
    Ok(())
}

async fn send_safe_mode_entry_notifications(
    client: &reqwest::Client,
    safe_mode_tokens: &[(ChatPlatform, String)],
    owner_chat_id: &str,
    preferred: ChatPlatform,
    group: &str,
) {
    let _ = notify_chat::notify_owner(
        client,
        &[],
        safe_mode_tokens,
        owner_chat_id,
        preferred,
        group,
        "health check failed, SafeModeBot coming online",
    )
    .await;
}

async fn send_critical_notification(
    client: &reqwest::Client,
    agents: &[Agent],
    owner_chat_id: &str,
    preferred: ChatPlatform,
    group: &str,
) {
    let _ = notify_chat::notify_owner(
        client,
        agents,
        &[],
        owner_chat_id,
        preferred,
        group,
        "critical: recovery attempts exhausted, no bot is available",
    )
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Isolation;
    use std::collections::BTreeMap;

    fn agent(id: &str) -> Agent {
        Agent {
            id: id.to_string(),
            isolation_group: "group-a".to_string(),
            isolation: Isolation::None,
            model: "anthropic/claude".to_string(),
            tokens: BTreeMap::new(),
            provider_keys: BTreeMap::new(),
            identity: None,
            persona: None,
            boot: None,
            bootstrap: None,
            user_context: None,
            potentially_unverifiable: false,
        }
    }

    struct NoopRestarter;
    impl GatewayRestarter for NoopRestarter {
        fn restart(&self, _group: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct AlwaysFailProbe;
    #[async_trait::async_trait]
    impl PostRestartProbe for AlwaysFailProbe {
        async fn passes(&self, _group: &str) -> bool {
            false
        }
    }

    #[test]
    fn counter_increments_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("state"), dir.path().join("home"));
        let first = with_locked_counter(&paths, "group-a", |c| {
            *c += 1;
            *c
        })
        .unwrap();
        assert_eq!(first, 1);
        let second = with_locked_counter(&paths, "group-a", |c| {
            *c += 1;
            *c
        })
        .unwrap();
        assert_eq!(second, 2);
        clear_recovery_attempts(&paths, "group-a").unwrap();
        let after_clear = with_locked_counter(&paths, "group-a", |c| *c).unwrap();
        assert_eq!(after_clear, 0);
    }

    #[tokio::test]
    async fn no_credentials_anywhere_falls_back_to_emergency_config() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("state"), dir.path().join("home"));
        let agents = vec![agent("agent-1")];
        let client = reqwest::Client::new();

        let outcome = handle_unhealthy(
            &paths,
            "group-a",
            &agents,
            ChatPlatform::Telegram,
            None,
            &client,
            &NoopRestarter,
            &AlwaysFailProbe,
            "owner-chat-id",
            DEFAULT_MAX_ATTEMPTS,
        )
        .await
        .unwrap();

        assert_eq!(outcome, Outcome::Critical);
        assert!(paths.gateway_config_path("group-a").exists());
    }

    #[tokio::test]
    async fn exceeding_max_attempts_goes_critical_without_touching_config() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("state"), dir.path().join("home"));
        with_locked_counter(&paths, "group-a", |c| *c = DEFAULT_MAX_ATTEMPTS).unwrap();
        let agents = vec![agent("agent-1")];
        let client = reqwest::Client::new();

        let outcome = handle_unhealthy(
            &paths,
            "group-a",
            &agents,
            ChatPlatform::Telegram,
            None,
            &client,
            &NoopRestarter,
            &AlwaysFailProbe,
            "owner-chat-id",
            DEFAULT_MAX_ATTEMPTS,
        )
        .await
        .unwrap();

        assert_eq!(outcome, Outcome::Critical);
        assert!(!paths.gateway_config_path("group-a").exists());
    }
}
