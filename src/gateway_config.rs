//! Config generator: the single source of truth for gateway configuration
//! JSON.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use rand::RngCore as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::manifest::Agent;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("generated config failed to round-trip parse: {0}")]
    RoundTripFailed(serde_json::Error),

    #[error("account key `default` is reserved and may never be used as a channel account key")]
    ReservedAccountKey,

    #[error("account key `{0}` is not an agent id present in agents.list[]")]
    DanglingAccountKey(String),

    #[error("duplicate account key `{0}` in a single channel")]
    DuplicateAccountKey(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Which subset of agents/channels/env a generated config covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Full,
    Session,
    SafeMode,
    Minimal,
    Emergency,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayBlock {
    /// Always the loopback interface — non-negotiable.
    pub bind: String,
    pub port: u16,
    pub auth: GatewayAuth,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayAuth {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ChannelsBlock {
    #[serde(default)]
    pub telegram: PlatformAccounts,
    #[serde(default)]
    pub discord: PlatformAccounts,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PlatformAccounts {
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AccountEntry {
    pub bot_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDescriptor {
    pub id: String,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentsBlock {
    pub list: Vec<AgentDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    pub gateway: GatewayBlock,
    pub channels: ChannelsBlock,
    pub agents: AgentsBlock,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

pub const LOOPBACK: &str = "127.0.0.1";

/// Collects every agent's `provider_keys` in a group into the flat map a
/// generated config's `env` field expects, so the gateway process has the
/// provider credentials it needs at runtime. Later agents win on key
/// collision, matching the inheritance-overlay order already used when a
/// manifest's agents resolve their own `provider_keys`.
pub fn provider_env(agents: &[Agent]) -> BTreeMap<String, String> {
    agents
        .iter()
        .flat_map(|a| a.provider_keys.iter())
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl GatewayConfig {
    /// Assemble a config for `mode`, covering `agents` (already filtered by
    /// the caller for `Session`/`SafeMode` modes).
    pub fn build(
        mode: Mode,
        port: u16,
        agents: &[Agent],
        existing_token: Option<String>,
        provider_env: BTreeMap<String, String>,
    ) -> Result<Self> {
        let token = existing_token.unwrap_or_else(generate_auth_token);

        let mut telegram_accounts = BTreeMap::new();
        let mut discord_accounts = BTreeMap::new();
        let mut list = Vec::with_capacity(agents.len());

        for agent in agents {
            list.push(AgentDescriptor {
                id: agent.id.clone(),
                model: agent.model.clone(),
            });

            if let Some(token) = agent.tokens.get("telegram") {
                insert_account(&mut telegram_accounts, &agent.id, token.clone())?;
            }
            if let Some(token) = agent.tokens.get("discord") {
                insert_account(&mut discord_accounts, &agent.id, token.clone())?;
            }
        }

        let config = GatewayConfig {
            gateway: GatewayBlock {
                bind: LOOPBACK.to_string(),
                port,
                auth: GatewayAuth { token },
            },
            channels: ChannelsBlock {
                telegram: PlatformAccounts {
                    accounts: telegram_accounts,
                },
                discord: PlatformAccounts {
                    accounts: discord_accounts,
                },
            },
            agents: AgentsBlock { list },
            env: provider_env,
        };

        config.validate()?;
        let _ = mode; // mode only changes which `agents` slice the caller passes in
        Ok(config)
    }

    /// No `"default"` key, every account key is a known agent id, no
    /// duplicates within a channel, and the serialized form round-trips.
    pub fn validate(&self) -> Result<()> {
        let known_ids: std::collections::BTreeSet<&str> =
            self.agents.list.iter().map(|a| a.id.as_str()).collect();

        for accounts in [&self.channels.telegram.accounts, &self.channels.discord.accounts] {
            for key in accounts.keys() {
                if key == "default" {
                    return Err(ConfigError::ReservedAccountKey);
                }
                if !known_ids.contains(key.as_str()) {
                    return Err(ConfigError::DanglingAccountKey(key.clone()));
                }
            }
        }

        let bytes = serde_json::to_vec(self).map_err(ConfigError::RoundTripFailed)?;
        let reparsed: GatewayConfig =
            serde_json::from_slice(&bytes).map_err(ConfigError::RoundTripFailed)?;
        if reparsed != *self {
            return Err(ConfigError::RoundTripFailed(serde::de::Error::custom(
                "re-parsed config differs from the original",
            )));
        }

        Ok(())
    }

    /// Write-temp/fsync/rename into `path`. If a file already exists there,
    /// it is preserved with a `.pre-recovery` suffix before replacement.
    pub fn write_atomically(&self, path: &Path, preserve_previous: bool) -> Result<()> {
        self.validate()?;
        let bytes = serde_json::to_vec_pretty(self).map_err(ConfigError::RoundTripFailed)?;

        if preserve_previous && path.exists() {
            let backup = backup_path(path);
            std::fs::copy(path, &backup)?;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        {
            let mut file = std::fs::File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(ConfigError::RoundTripFailed)
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".pre-recovery");
    path.with_file_name(name)
}

fn insert_account(
    accounts: &mut BTreeMap<String, AccountEntry>,
    agent_id: &str,
    token: String,
) -> Result<()> {
    if agent_id == "default" {
        return Err(ConfigError::ReservedAccountKey);
    }
    if accounts
        .insert(agent_id.to_string(), AccountEntry { bot_token: token })
        .is_some()
    {
        return Err(ConfigError::DuplicateAccountKey(agent_id.to_string()));
    }
    Ok(())
}

fn generate_auth_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
