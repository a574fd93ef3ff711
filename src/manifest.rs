//! Manifest parsing and env projection.
//!
//! Decodes the opaque `HABITAT_B64` input artifact into a flat, ordered
//! record of typed fields plus a structured agent list.

use std::collections::BTreeMap;

use base64::Engine as _;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("manifest is not valid base64")]
    InvalidBase64(#[source] base64::DecodeError),

    #[error("manifest is not valid JSON")]
    InvalidJson(#[source] serde_json::Error),

    #[error("manifest is missing required field `name`")]
    MissingName,

    #[error("manifest has no agents")]
    EmptyAgents,

    #[error("agent at index {0} is missing `id`")]
    AgentMissingId(usize),

    #[error("agent id `default` is reserved and may not be used literally")]
    ReservedAgentId,

    #[error("duplicate agent id `{0}`")]
    DuplicateAgentId(String),

    #[error("isolation group label `{0}` must be alphanumeric-or-hyphen")]
    InvalidIsolationGroupLabel(String),

    #[error("agent `{agent}` configures isolation `{isolation}` with the top-level isolation `none`")]
    InconsistentIsolationMode { agent: String, isolation: Isolation },

    #[error("no manifest available: neither an uploaded HABITAT_B64 file nor the HABITAT_B64 env var is set")]
    NoHabitatSource,
}

pub type Result<T> = std::result::Result<T, ManifestError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Telegram,
    Discord,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    None,
    Session,
    Container,
}

impl std::fmt::Display for Isolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Isolation::None => "none",
            Isolation::Session => "session",
            Isolation::Container => "container",
        };
        f.write_str(s)
    }
}

/// A soft, non-fatal issue recorded while parsing. Parsing proceeds after
/// recording one; these are surfaced to the external provisioner, not just
/// logged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestWarning {
    UnreachablePlatform { agent_id: String, platform: String },
    MissingProviderSecret { agent_id: String, provider: String },
    UnknownField(String),
}

impl std::fmt::Display for ManifestWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManifestWarning::UnreachablePlatform { agent_id, platform } => write!(
                f,
                "agent `{agent_id}` has no owner_id configured for platform `{platform}`; it will be unreachable for notifications on that platform"
            ),
            ManifestWarning::MissingProviderSecret { agent_id, provider } => write!(
                f,
                "agent `{agent_id}` has no provider key for `{provider}` and none was inherited; marked potentially-unverifiable"
            ),
            ManifestWarning::UnknownField(name) => write!(f, "unknown manifest field `{name}` ignored"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Agent {
    pub id: String,
    pub isolation_group: String,
    pub isolation: Isolation,
    pub model: String,
    pub tokens: BTreeMap<String, String>,
    pub provider_keys: BTreeMap<String, String>,
    pub identity: Option<String>,
    pub persona: Option<String>,
    pub boot: Option<String>,
    pub bootstrap: Option<String>,
    pub user_context: Option<String>,
    /// True if a required provider secret could not be resolved even after
    /// inheriting from the parent manifest.
    pub potentially_unverifiable: bool,
}

#[derive(Debug, Clone)]
pub struct ParsedManifest {
    pub name: String,
    pub platform: Platform,
    pub isolation: Isolation,
    pub shared_paths: Vec<String>,
    pub api_bind_address: Option<String>,
    pub api_secret: Option<String>,
    pub destruct_minutes: Option<u64>,
    pub owner_ids: BTreeMap<String, String>,
    pub agents: Vec<Agent>,
}

/// `{name, port, agents[]}` — derived from the manifest, never read
/// directly from it. Groups are numbered stably by sorted name; port
/// assignments start at `BASE_GATEWAY_PORT` and increment.
#[derive(Debug, Clone)]
pub struct IsolationGroup {
    pub name: String,
    pub port: u16,
    pub agents: Vec<Agent>,
}

pub const BASE_GATEWAY_PORT: u16 = 9000;

impl ParsedManifest {
    pub fn agent_ids(&self) -> impl Iterator<Item = &str> {
        self.agents.iter().map(|a| a.id.as_str())
    }

    /// Every distinct isolation group, sorted stably by name, with ports
    /// assigned in that same order starting at `BASE_GATEWAY_PORT`.
    pub fn isolation_groups(&self) -> Vec<IsolationGroup> {
        let mut names: Vec<&str> = self
            .agents
            .iter()
            .map(|a| a.isolation_group.as_str())
            .collect();
        names.sort_unstable();
        names.dedup();

        names
            .into_iter()
            .enumerate()
            .map(|(idx, name)| IsolationGroup {
                name: name.to_string(),
                port: BASE_GATEWAY_PORT + idx as u16,
                agents: self
                    .agents
                    .iter()
                    .filter(|a| a.isolation_group == name)
                    .cloned()
                    .collect(),
            })
            .collect()
    }

    /// Primary chat transport to try first when discovering credentials,
    /// derived from the manifest's declared `platform`.
    pub fn preferred_chat_platform(&self) -> crate::credentials::ChatPlatform {
        match self.platform {
            Platform::Telegram | Platform::Both => crate::credentials::ChatPlatform::Telegram,
            Platform::Discord => crate::credentials::ChatPlatform::Discord,
        }
    }

    #[cfg(test)]
    pub fn test_fixture_empty() -> Self {
        ParsedManifest {
            name: "test".to_string(),
            platform: Platform::Telegram,
            isolation: Isolation::None,
            shared_paths: Vec::new(),
            api_bind_address: None,
            api_secret: None,
            destruct_minutes: None,
            owner_ids: BTreeMap::new(),
            agents: Vec::new(),
        }
    }
}

/// Decode and validate a base64-encoded JSON manifest.
///
/// Returns the parsed manifest plus any soft warnings recorded along the
/// way. Hard rejections short-circuit with `Err`.
pub fn parse(manifest_b64: &str) -> Result<(ParsedManifest, Vec<ManifestWarning>)> {
    parse_with_agent_lib(manifest_b64, None)
}

/// Decode and validate a base64-encoded JSON manifest, optionally
/// overlaying the `agents` array from a separate base64-encoded JSON
/// agent-library blob (the companion `AGENT_LIB_B64` slot). When present,
/// the library's agent list replaces whatever `agents` the habitat blob
/// itself carries.
pub fn parse_with_agent_lib(
    manifest_b64: &str,
    agent_lib_b64: Option<&str>,
) -> Result<(ParsedManifest, Vec<ManifestWarning>)> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(manifest_b64.trim())
        .map_err(ManifestError::InvalidBase64)?;
    let mut raw: RawManifest = serde_json::from_slice(&bytes).map_err(ManifestError::InvalidJson)?;

    if let Some(agent_lib_b64) = agent_lib_b64 {
        let lib_bytes = base64::engine::general_purpose::STANDARD
            .decode(agent_lib_b64.trim())
            .map_err(ManifestError::InvalidBase64)?;
        raw.agents = serde_json::from_slice(&lib_bytes).map_err(ManifestError::InvalidJson)?;
    }

    raw.validate_and_project()
}

/// Load the manifest the same way the running process would: prefer the
/// on-disk copy of a control-plane upload over the boot-time env vars,
/// for both the habitat and the agent library slots independently, so an
/// upload that only replaces one of the two still combines with whichever
/// source last supplied the other.
pub fn load_from_paths(paths: &crate::state::Paths) -> Result<(ParsedManifest, Vec<ManifestWarning>)> {
    let habitat_b64 = read_non_empty(&paths.uploaded_habitat_path())
        .or_else(|| std::env::var("HABITAT_B64").ok())
        .ok_or(ManifestError::NoHabitatSource)?;
    let agent_lib_b64 =
        read_non_empty(&paths.uploaded_agent_lib_path()).or_else(|| std::env::var("AGENT_LIB_B64").ok());

    parse_with_agent_lib(&habitat_b64, agent_lib_b64.as_deref())
}

fn read_non_empty(path: &std::path::Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .filter(|s| !s.trim().is_empty())
}

#[derive(Debug, Deserialize)]
struct RawManifest {
    name: Option<String>,
    #[serde(default)]
    platform: Option<Platform>,
    #[serde(default)]
    isolation: Option<Isolation>,
    #[serde(default)]
    shared_paths: Vec<String>,
    api_bind_address: Option<String>,
    api_secret: Option<String>,
    destruct_minutes: Option<u64>,
    #[serde(default)]
    platforms: BTreeMap<String, RawPlatformSettings>,
    #[serde(default)]
    agents: Vec<RawAgent>,
}

#[derive(Debug, Deserialize, Default)]
struct RawPlatformSettings {
    owner_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAgent {
    id: Option<String>,
    isolation_group: Option<String>,
    #[serde(default)]
    isolation: Option<Isolation>,
    model: Option<String>,
    #[serde(default)]
    tokens: BTreeMap<String, String>,
    #[serde(default)]
    provider_keys: BTreeMap<String, String>,
    identity: Option<String>,
    persona: Option<String>,
    boot: Option<String>,
    bootstrap: Option<String>,
    user_context: Option<String>,
}

fn is_valid_group_label(label: &str) -> bool {
    !label.is_empty() && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

impl RawManifest {
    fn validate_and_project(self) -> Result<(ParsedManifest, Vec<ManifestWarning>)> {
        let mut warnings = Vec::new();

        let name = self.name.ok_or(ManifestError::MissingName)?;
        if self.agents.is_empty() {
            return Err(ManifestError::EmptyAgents);
        }

        let top_isolation = self.isolation.unwrap_or(Isolation::None);
        let platform = self.platform.unwrap_or(Platform::Telegram);

        let owner_ids: BTreeMap<String, String> = self
            .platforms
            .iter()
            .filter_map(|(k, v)| v.owner_id.clone().map(|id| (k.clone(), id)))
            .collect();

        let mut seen_ids: std::collections::BTreeSet<String> = std::collections::BTreeSet::new();
        let mut parent_provider_keys: BTreeMap<String, String> = BTreeMap::new();
        let mut agents = Vec::with_capacity(self.agents.len());

        for (idx, raw) in self.agents.into_iter().enumerate() {
            let id = raw.id.ok_or(ManifestError::AgentMissingId(idx))?;
            if id == "default" {
                return Err(ManifestError::ReservedAgentId);
            }
            if !seen_ids.insert(id.clone()) {
                return Err(ManifestError::DuplicateAgentId(id));
            }

            let isolation_group = raw.isolation_group.clone().unwrap_or_else(|| id.clone());
            if !is_valid_group_label(&isolation_group) {
                return Err(ManifestError::InvalidIsolationGroupLabel(isolation_group));
            }

            let isolation = raw.isolation.unwrap_or(top_isolation);
            // `shared_paths` only makes sense relative to an isolation boundary;
            // a manifest that asks for isolated agents but declares top-level
            // isolation `none` while still listing shared_paths is an impossible
            // combination (there's no boundary for them to be shared across).
            if top_isolation == Isolation::None
                && isolation != Isolation::None
                && !self.shared_paths.is_empty()
            {
                return Err(ManifestError::InconsistentIsolationMode { agent: id, isolation });
            }

            // First agent's provider_keys establish the inheritance baseline
            // for agents that omit a key the parent manifest defines.
            let mut provider_keys = parent_provider_keys.clone();
            provider_keys.extend(raw.provider_keys.clone());
            if parent_provider_keys.is_empty() && !raw.provider_keys.is_empty() {
                parent_provider_keys = raw.provider_keys.clone();
            }

            let model = raw.model.clone().unwrap_or_default();
            let provider = model.split('/').next().unwrap_or_default().to_string();
            let potentially_unverifiable = !provider.is_empty() && !provider_keys.contains_key(&provider);
            if potentially_unverifiable {
                warnings.push(ManifestWarning::MissingProviderSecret {
                    agent_id: id.clone(),
                    provider,
                });
            }

            let platform_enabled_names: Vec<&str> = match platform {
                Platform::Telegram => vec!["telegram"],
                Platform::Discord => vec!["discord"],
                Platform::Both => vec!["telegram", "discord"],
            };
            for p in &platform_enabled_names {
                if !owner_ids.contains_key(*p) {
                    warnings.push(ManifestWarning::UnreachablePlatform {
                        agent_id: id.clone(),
                        platform: p.to_string(),
                    });
                }
            }

            agents.push(Agent {
                id,
                isolation_group,
                isolation: raw.isolation.unwrap_or(top_isolation),
                model: raw.model.unwrap_or_default(),
                tokens: raw.tokens,
                provider_keys,
                identity: raw.identity,
                persona: raw.persona,
                boot: raw.boot,
                bootstrap: raw.bootstrap,
                user_context: raw.user_context,
                potentially_unverifiable,
            });
        }

        let manifest = ParsedManifest {
            name,
            platform,
            isolation: top_isolation,
            shared_paths: self.shared_paths,
            api_bind_address: self.api_bind_address,
            api_secret: self.api_secret,
            destruct_minutes: self.destruct_minutes,
            owner_ids,
            agents,
        };

        Ok((manifest, warnings))
    }
}
