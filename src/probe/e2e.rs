//! End-to-end probe: a separate oneshot bound to the gateway unit's
//! lifetime.

use std::time::Duration;

use tracing::warn;

use crate::credentials::{self, ChatPlatform, Provider, validate_chat_token};
use crate::manifest::Agent;
use crate::notify_chat;
use crate::state::Paths;

use super::{ProbeError, Result};

pub const HEALTH_CHECK_MARKER: &str = "HEALTH_CHECK_OK";
pub const PROBE_PROMPT: &str = "Reply with exactly: HEALTH_CHECK_OK";
const AGENT_PROBE_TIMEOUT_SECS: u64 = 30;

/// Which agents to probe, and whether this is the gateway's normal
/// operating mode or its reduced safe-mode.
#[derive(Debug, Clone)]
pub enum ProbeMode {
    /// `agent_ids` empty means "discover every agent in the group".
    Normal { agent_ids: Vec<String> },
    SafeMode,
}

/// Sends a deterministic probe prompt to one agent's model and reports
/// whether the literal marker appeared in the reply.
#[async_trait::async_trait]
pub trait AgentProbe: Send + Sync {
    async fn probe(&self, client: &reqwest::Client, agent: &Agent) -> anyhow::Result<String>;
}

/// Sends the real introduction message, with delivery to the agent's own
/// chat account.
#[async_trait::async_trait]
pub trait IntroSender: Send + Sync {
    async fn send_intro(&self, client: &reqwest::Client, agent: &Agent) -> anyhow::Result<()>;
}

/// Normal-mode run. Stage order matters: token validation must precede the
/// agent stage, because the gateway transparently falls back to another
/// account's token, which would otherwise hide a broken one.
pub async fn run_normal(
    paths: &Paths,
    group: &str,
    agents: &[Agent],
    platform: ChatPlatform,
    mode: &ProbeMode,
    client: &reqwest::Client,
    agent_probe: &dyn AgentProbe,
    intro_sender: &dyn IntroSender,
) -> Result<()> {
    let ProbeMode::Normal { agent_ids } = mode else {
        unreachable!("run_normal called with ProbeMode::SafeMode");
    };

    let selected: Vec<&Agent> = if agent_ids.is_empty() {
        agents.iter().collect()
    } else {
        agents.iter().filter(|a| agent_ids.contains(&a.id)).collect()
    };

    // Stage 1: token stage.
    for agent in &selected {
        let Some(token) = agent.tokens.get(platform.as_str()) else {
            continue;
        };
        if validate_chat_token(client, platform, token).await == credentials::Outcome::Invalid {
            warn!(group, agent = %agent.id, "token stage failed, an authoritatively invalid token");
            return fail(paths, group).await;
        }
    }

    // Stage 2: agent stage.
    for agent in &selected {
        let result = tokio::time::timeout(
            Duration::from_secs(AGENT_PROBE_TIMEOUT_SECS),
            agent_probe.probe(client, agent),
        )
        .await;
        let reply = match result {
            Ok(Ok(reply)) => reply,
            _ => {
                warn!(group, agent = %agent.id, "agent stage failed or timed out");
                return fail(paths, group).await;
            }
        };
        if !reply.contains(HEALTH_CHECK_MARKER) {
            warn!(group, agent = %agent.id, "agent stage reply missing health marker");
            return fail(paths, group).await;
        }
    }

    // Stage 3: intro stage, gated to the first successful probe of a fresh boot.
    let intro_marker = paths.group_marker("intro_sent", group);
    if !intro_marker.exists() {
        for agent in &selected {
            if let Err(err) = intro_sender.send_intro(client, agent).await {
                warn!(group, agent = %agent.id, error = %err, "intro send failed (non-fatal)");
            }
        }
        intro_marker.touch().map_err(ProbeError::Io)?;
    }

    paths.group_marker("unhealthy", group).remove().map_err(ProbeError::Io)?;
    Ok(())
}

/// Safe-mode run: probe the single safe-mode agent with the same
/// deterministic prompt; on success, send one AI-generated diagnostic
/// message through it rather than repeating the normal three-stage flow.
pub async fn run_safe_mode(
    paths: &Paths,
    group: &str,
    safe_mode_agent: &Agent,
    client: &reqwest::Client,
    agent_probe: &dyn AgentProbe,
    diagnostic_text: &str,
    safe_mode_tokens: &[(ChatPlatform, String)],
    owner_chat_id: &str,
    preferred: ChatPlatform,
) -> Result<()> {
    let result = tokio::time::timeout(
        Duration::from_secs(AGENT_PROBE_TIMEOUT_SECS),
        agent_probe.probe(client, safe_mode_agent),
    )
    .await;

    let reply = match result {
        Ok(Ok(reply)) if reply.contains(HEALTH_CHECK_MARKER) => reply,
        _ => {
            warn!(group, "safe mode agent failed to respond to probe");
            return fail(paths, group).await;
        }
    };
    let _ = reply;

    if notify_chat::notify_owner(
        client,
        &[],
        safe_mode_tokens,
        owner_chat_id,
        preferred,
        group,
        diagnostic_text,
    )
    .await
    .is_err()
    {
        warn!(group, "diagnostic message delivery failed (non-fatal)");
    }

    Ok(())
}

/// Provider-call-backed implementation of `AgentProbe`, sharing the single
/// `Provider`/`auth_header` authentication path used by credential
/// validation.
pub struct ProviderAgentProbe {
    pub provider: Provider,
    pub api_key: String,
}

#[async_trait::async_trait]
impl AgentProbe for ProviderAgentProbe {
    async fn probe(&self, client: &reqwest::Client, _agent: &Agent) -> anyhow::Result<String> {
        let attach = credentials::auth_header(self.provider, &self.api_key);
        let base_url = match self.provider {
            Provider::Anthropic => "https://api.anthropic.com/v1/messages",
            Provider::OpenAi => "https://api.openai.com/v1/chat/completions",
            Provider::Google => "https://generativelanguage.googleapis.com/v1/models/gemini:generateContent",
        };

        let mut request = client.post(base_url).timeout(Duration::from_secs(25)).json(
            &serde_json::json!({ "prompt": PROBE_PROMPT }),
        );
        request = match attach {
            credentials::AuthAttachment::Header { name, value } => request.header(name, value),
            credentials::AuthAttachment::QueryParam { name, value } => {
                request.query(&[(name, value)])
            }
        };

        let resp = request.send().await?;
        anyhow::ensure!(resp.status().is_success(), "probe call failed: {}", resp.status());
        let body: serde_json::Value = resp.json().await?;
        Ok(body.to_string())
    }
}

async fn fail(paths: &Paths, group: &str) -> Result<()> {
    paths.group_marker("unhealthy", group).touch()?;
    Err(ProbeError::Unhealthy(group.to_string()))
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

    struct AlwaysOk;
    #[async_trait::async_trait]
    impl AgentProbe for AlwaysOk {
        async fn probe(&self, _client: &reqwest::Client, _agent: &Agent) -> anyhow::Result<String> {
            Ok(HEALTH_CHECK_MARKER.to_string())
        }
    }

    struct AlwaysWrong;
    #[async_trait::async_trait]
    impl AgentProbe for AlwaysWrong {
        async fn probe(&self, _client: &reqwest::Client, _agent: &Agent) -> anyhow::Result<String> {
            Ok("not the marker".to_string())
        }
    }

    struct NoopIntro;
    #[async_trait::async_trait]
    impl IntroSender for NoopIntro {
        async fn send_intro(&self, _client: &reqwest::Client, _agent: &Agent) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn agent_stage_failure_marks_unhealthy() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("state"), dir.path().join("home"));
        let agents = vec![agent("a")];
        let client = reqwest::Client::new();

        let result = run_normal(
            &paths,
            "group-a",
            &agents,
            ChatPlatform::Telegram,
            &ProbeMode::Normal { agent_ids: vec![] },
            &client,
            &AlwaysWrong,
            &NoopIntro,
        )
        .await;

        assert!(result.is_err());
        assert!(paths.group_marker("unhealthy", "group-a").exists());
    }

    #[tokio::test]
    async fn successful_probe_sends_intro_once_then_skips_on_rerun() {
        let dir = tempfile::tempdir().unwrap();
        let paths = Paths::new(dir.path().join("state"), dir.path().join("home"));
        paths.group_marker("unhealthy", "group-a").touch().unwrap();
        let agents = vec![agent("a")];
        let client = reqwest::Client::new();

        run_normal(
            &paths,
            "group-a",
            &agents,
            ChatPlatform::Telegram,
            &ProbeMode::Normal { agent_ids: vec![] },
            &client,
            &AlwaysOk,
            &NoopIntro,
        )
        .await
        .unwrap();

        assert!(paths.group_marker("intro_sent", "group-a").exists());
        assert!(!paths.group_marker("unhealthy", "group-a").exists());

        // Re-running (e.g. after a config upload) must not repeat the intro;
        // the marker already exists so the intro branch is skipped entirely.
        run_normal(
            &paths,
            "group-a",
            &agents,
            ChatPlatform::Telegram,
            &ProbeMode::Normal { agent_ids: vec![] },
            &client,
            &AlwaysOk,
            &NoopIntro,
        )
        .await
        .unwrap();
    }
}
