use std::collections::BTreeMap;

use clap::Parser;
use outpost::boot::{self, SystemReboot};
use outpost::cli::{Cli, Command, ProbeCommand, SyncCommand};
use outpost::control_plane::{self, ControlPlaneState};
use outpost::credentials::{self, ChatPlatform};
use outpost::manifest;
use outpost::probe::e2e::{self, ProbeMode, ProviderAgentProbe};
use outpost::probe::health::{self, NoopWarnNotifier};
use outpost::probe::ProcProcessWatcher;
use outpost::safe_mode::{self, DEFAULT_MAX_ATTEMPTS, SystemdRestarter};
use outpost::state::Paths;
use outpost::sync;
use tracing::{error, info};

const GATEWAY_BINARY_NAME: &str = "outpost-gatewayd";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = Paths::from_env();
    let _guard = outpost::logging::init(&paths, component_name(&cli.command))?;

    if let Err(err) = run(cli, &paths).await {
        error!(error = %err, "outpostd exited with an error");
        std::process::exit(1);
    }
    Ok(())
}

fn component_name(command: &Command) -> &'static str {
    match command {
        Command::Boot => "boot",
        Command::Probe {
            probe: ProbeCommand::Health { .. },
        } => "probe-health",
        Command::Probe {
            probe: ProbeCommand::E2e { .. },
        } => "probe-e2e",
        Command::SafeMode { .. } => "safe-mode",
        Command::Serve => "control-plane",
        Command::Sync { .. } => "sync",
    }
}

fn load_manifest(paths: &Paths) -> anyhow::Result<manifest::ParsedManifest> {
    let (parsed, warnings) = manifest::load_from_paths(paths)?;
    for warning in &warnings {
        tracing::warn!(%warning, "manifest warning");
    }
    Ok(parsed)
}

async fn run(cli: Cli, paths: &Paths) -> anyhow::Result<()> {
    let client = reqwest::Client::new();

    match cli.command {
        Command::Boot => {
            let manifest = load_manifest(paths)?;
            boot::run_boot(paths, &manifest, &client, &SystemReboot).await?;
        }

        Command::Probe {
            probe: ProbeCommand::Health { group, port },
        } => {
            health::run_health_probe(
                paths,
                &group,
                port,
                &client,
                &ProcProcessWatcher::default(),
                GATEWAY_BINARY_NAME,
                &NoopWarnNotifier,
            )
            .await?;
        }

        Command::Probe {
            probe: ProbeCommand::E2e { group },
        } => {
            let manifest = load_manifest(paths)?;
            let isolation_group = manifest
                .isolation_groups()
                .into_iter()
                .find(|g| g.name == group)
                .ok_or_else(|| anyhow::anyhow!("unknown isolation group `{group}`"))?;

            let provider_keys: BTreeMap<String, String> = isolation_group
                .agents
                .iter()
                .flat_map(|a| a.provider_keys.iter())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let provider_ctx = credentials::find_working_provider(&client, &provider_keys, None)
                .await
                .ok_or_else(|| anyhow::anyhow!("no working provider credential for group `{group}`"))?;
            let agent_probe = ProviderAgentProbe {
                provider: provider_ctx.provider,
                api_key: provider_ctx.key,
            };
            let preferred = manifest.preferred_chat_platform();
            let intro_sender = RealIntroSender {
                owner_chat_id: manifest.owner_ids.get(preferred.as_str()).cloned().unwrap_or_default(),
                preferred,
            };

            e2e::run_normal(
                paths,
                &group,
                &isolation_group.agents,
                preferred,
                &ProbeMode::Normal { agent_ids: vec![] },
                &client,
                &agent_probe,
                &intro_sender,
            )
            .await?;
        }

        Command::SafeMode { group } => {
            let manifest = load_manifest(paths)?;
            let isolation_group = manifest
                .isolation_groups()
                .into_iter()
                .find(|g| g.name == group)
                .ok_or_else(|| anyhow::anyhow!("unknown isolation group `{group}`"))?;
            let owner_chat_id = manifest
                .owner_ids
                .values()
                .next()
                .cloned()
                .unwrap_or_default();

            let outcome = safe_mode::handle_unhealthy(
                paths,
                &group,
                &isolation_group.agents,
                manifest.preferred_chat_platform(),
                None,
                &client,
                &SystemdRestarter,
                &RealPostRestartProbe {
                    paths: paths.clone(),
                    client: client.clone(),
                },
                &owner_chat_id,
                DEFAULT_MAX_ATTEMPTS,
            )
            .await?;

            if outcome == safe_mode::Outcome::Critical {
                error!(group, "recovery escalation ladder exhausted");
                std::process::exit(2);
            }
            info!(group, "safe mode recovery succeeded");
        }

        Command::Serve => {
            let manifest = load_manifest(paths)?;
            let api_secret = manifest.api_secret.clone();
            let bind_port = 8080;
            let addr = control_plane::resolve_bind_addr(
                manifest.api_bind_address.as_deref(),
                &api_secret,
                bind_port,
            )?;

            let state = ControlPlaneState::new(paths.clone(), manifest, api_secret);
            let app = control_plane::router(state);

            info!(%addr, "control plane listening");
            let listener = tokio::net::TcpListener::bind(addr).await?;
            axum::serve(listener, app).await?;
        }

        Command::Sync { sync: sync_cmd } => {
            let manifest = load_manifest(paths)?;
            let agent_ids: Vec<String> = manifest.agent_ids().map(|s| s.to_string()).collect();
            match sync_cmd {
                SyncCommand::Restore => {
                    let target = sync::DirectorySyncTarget {
                        root: paths.state_dir.join("remote"),
                    };
                    sync::restore(paths, &target, &agent_ids).await?;
                }
                SyncCommand::CopyUp => {
                    sync::copy_up_all(paths, &agent_ids).await?;
                }
            }
        }
    }

    Ok(())
}

/// Delivers each agent's own introduction to the configured owner account,
/// reusing the shared notification path rather than a one-off HTTP call.
struct RealIntroSender {
    owner_chat_id: String,
    preferred: ChatPlatform,
}

#[async_trait::async_trait]
impl e2e::IntroSender for RealIntroSender {
    async fn send_intro(
        &self,
        client: &reqwest::Client,
        agent: &manifest::Agent,
    ) -> anyhow::Result<()> {
        if self.owner_chat_id.is_empty() {
            return Ok(());
        }
        outpost::notify_chat::notify_owner(
            client,
            std::slice::from_ref(agent),
            &[],
            &self.owner_chat_id,
            self.preferred,
            &agent.isolation_group,
            &format!("Agent `{}` is online and reachable.", agent.id),
        )
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))
    }
}

struct RealPostRestartProbe {
    paths: Paths,
    client: reqwest::Client,
}

#[async_trait::async_trait]
impl safe_mode::PostRestartProbe for RealPostRestartProbe {
    async fn passes(&self, group: &str) -> bool {
        health::run_health_probe(
            &self.paths,
            group,
            manifest::BASE_GATEWAY_PORT,
            &self.client,
            &ProcProcessWatcher::default(),
            GATEWAY_BINARY_NAME,
            &NoopWarnNotifier,
        )
        .await
        .is_ok()
    }
}
