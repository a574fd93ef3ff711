//! Boot orchestrator: sequential, no background forks.

use std::fmt;
use std::path::PathBuf;

use tracing::{error, info};

use crate::credentials;
use crate::gateway_config::{GatewayConfig, Mode};
use crate::manifest::ParsedManifest;
use crate::services::{EnablementPlan, ServiceUnit};
use crate::state::{Marker, Paths};
use crate::workspace;

/// A numbered stage, written to the public status file at each transition
/// so the external provisioner can display progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootStage {
    ParseManifest,
    GenerateWorkspaces,
    ValidateCredentials,
    GenerateConfigs,
    SynthesizeServices,
    Reboot,
}

impl BootStage {
    pub const ORDER: [BootStage; 6] = [
        BootStage::ParseManifest,
        BootStage::GenerateWorkspaces,
        BootStage::ValidateCredentials,
        BootStage::GenerateConfigs,
        BootStage::SynthesizeServices,
        BootStage::Reboot,
    ];

    pub fn number(self) -> u8 {
        Self::ORDER.iter().position(|s| *s == self).unwrap() as u8 + 1
    }
}

impl fmt::Display for BootStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BootStage::ParseManifest => "parse_manifest",
            BootStage::GenerateWorkspaces => "generate_workspaces",
            BootStage::ValidateCredentials => "validate_credentials",
            BootStage::GenerateConfigs => "generate_configs",
            BootStage::SynthesizeServices => "synthesize_services",
            BootStage::Reboot => "reboot",
        };
        write!(f, "{}/{} {}", self.number(), BootStage::ORDER.len(), name)
    }
}

/// Performs the host reboot at the end of a successful boot. Abstracted
/// behind a trait so the orchestrator is unit-testable without actually
/// rebooting the host.
pub trait Rebooter {
    fn reboot(&self) -> anyhow::Result<()>;
}

/// Production implementation: `reboot(2)` via `nix`.
pub struct SystemReboot;

impl Rebooter for SystemReboot {
    fn reboot(&self) -> anyhow::Result<()> {
        nix::sys::reboot::reboot(nix::sys::reboot::RebootMode::RB_AUTOBOOT)?;
        Ok(())
    }
}

/// Test double: records the call instead of rebooting.
#[derive(Default)]
pub struct NoopReboot {
    pub called: std::sync::atomic::AtomicBool,
}

impl Rebooter for NoopReboot {
    fn reboot(&self) -> anyhow::Result<()> {
        self.called.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

fn stages_log_path(paths: &Paths) -> PathBuf {
    paths.state_dir.join("stages.log")
}

fn append_stage_line(paths: &Paths, stage: BootStage) -> std::io::Result<()> {
    use std::io::Write as _;

    let path = stages_log_path(paths);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let line = serde_json::json!({
        "stage": stage.to_string(),
        "number": stage.number(),
    });
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{line}")
}

/// Run every stage in order. Idempotent: a stage whose `phase_complete[n]`
/// marker already exists is skipped. On success, triggers a reboot via
/// `rebooter`; on failure, writes `build_failed` and returns an error
/// without ever calling the rebooter.
pub async fn run_boot(
    paths: &Paths,
    manifest: &ParsedManifest,
    client: &reqwest::Client,
    rebooter: &dyn Rebooter,
) -> crate::error::Result<()> {
    let boot_complete = paths.marker("boot_complete");
    if boot_complete.exists() {
        info!("boot_complete marker already present, boot is a no-op");
        return Ok(());
    }

    for stage in BootStage::ORDER {
        let phase_marker = paths.marker(&format!("phase_complete[{}]", stage.number()));
        if phase_marker.exists() {
            info!(%stage, "stage already complete, skipping");
            continue;
        }

        if let Err(err) = run_stage(paths, manifest, client, stage).await {
            error!(%stage, error = %err, "boot stage failed");
            paths.marker("build_failed").write(stage.to_string().as_bytes())?;
            return Err(err);
        }

        append_stage_line(paths, stage)?;
        phase_marker.touch()?;
    }

    boot_complete.touch()?;
    rebooter
        .reboot()
        .map_err(|e| crate::error::Error::Other(e))?;
    Ok(())
}

async fn run_stage(
    paths: &Paths,
    manifest: &ParsedManifest,
    client: &reqwest::Client,
    stage: BootStage,
) -> crate::error::Result<()> {
    match stage {
        BootStage::ParseManifest => Ok(()),
        BootStage::GenerateWorkspaces => {
            workspace::generate_all(paths, &manifest.agents)
                .map_err(|e| crate::error::Error::Other(anyhow::anyhow!(e)))?;
            Ok(())
        }
        BootStage::ValidateCredentials => {
            let preferred = manifest.preferred_chat_platform();
            for group in manifest.isolation_groups() {
                let _ = credentials::find_working_chat_token(client, &group.agents, preferred, &group.name)
                    .await;
            }
            Ok(())
        }
        BootStage::GenerateConfigs => {
            for group in manifest.isolation_groups() {
                let config = GatewayConfig::build(
                    Mode::Full,
                    group.port,
                    &group.agents,
                    None,
                    crate::gateway_config::provider_env(&group.agents),
                )
                .map_err(|e| crate::error::Error::Other(anyhow::anyhow!(e)))?;
                config
                    .write_atomically(&paths.gateway_config_path(&group.name), false)
                    .map_err(|e| crate::error::Error::Other(anyhow::anyhow!(e)))?;
            }
            Ok(())
        }
        BootStage::SynthesizeServices => {
            let _plan = synthesize_enablement_plan(paths, manifest);
            Ok(())
        }
        BootStage::Reboot => Ok(()),
    }
}

fn synthesize_enablement_plan(paths: &Paths, manifest: &ParsedManifest) -> EnablementPlan {
    let start_now = std::env::var("START_SERVICES").as_deref() == Ok("true");
    let units = manifest
        .isolation_groups()
        .into_iter()
        .map(|group| {
            let config_path = paths.gateway_config_path(&group.name);
            ServiceUnit::for_group(&group.name, "/usr/bin/outpost-gatewayd", "/usr/bin/outpostd", &config_path)
        })
        .collect();
    EnablementPlan::new(units, start_now)
}
