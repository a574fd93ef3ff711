//! Service synthesizer: emits a supervised-service definition per
//! isolation group.

use std::fmt::Write as _;
use std::path::PathBuf;

/// Restart policy for a synthesized service unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Restart on any non-zero exit except `critical_exit_code`.
    OnFailureExcept { critical_exit_code: i32 },
}

impl Default for RestartPolicy {
    fn default() -> Self {
        RestartPolicy::OnFailureExcept {
            critical_exit_code: 2,
        }
    }
}

/// A service definition for one isolation group's gateway, plus its
/// bound end-to-end probe oneshot.
#[derive(Debug, Clone)]
pub struct ServiceUnit {
    pub group: String,
    pub restore_command: String,
    pub start_command: String,
    pub post_start_probe_command: String,
    pub restart_policy: RestartPolicy,
    /// Start timeout covering the HTTP probe phase.
    pub start_timeout_secs: u64,
    /// Timeout for the bound end-to-end probe oneshot.
    pub e2e_timeout_secs: u64,
}

pub const DEFAULT_START_TIMEOUT_SECS: u64 = 180;
pub const DEFAULT_E2E_TIMEOUT_SECS: u64 = 600;

impl ServiceUnit {
    /// `gateway_bin` is the externally-supplied chat-gateway process this
    /// crate only launches and supervises; it owns the persistent
    /// chat-platform connections and is out of scope here.
    pub fn for_group(group: &str, gateway_bin: &str, outpostd_bin: &str, config_path: &PathBuf) -> Self {
        Self {
            group: group.to_string(),
            restore_command: format!("{outpostd_bin} sync restore"),
            start_command: format!(
                "{gateway_bin} --config {}",
                config_path.display()
            ),
            post_start_probe_command: format!("{outpostd_bin} probe health --group {group}"),
            restart_policy: RestartPolicy::default(),
            start_timeout_secs: DEFAULT_START_TIMEOUT_SECS,
            e2e_timeout_secs: DEFAULT_E2E_TIMEOUT_SECS,
        }
    }

    pub fn gateway_unit_name(&self) -> String {
        format!("outpost-gateway@{}.service", self.group)
    }

    pub fn e2e_probe_unit_name(&self) -> String {
        format!("outpost-e2e-probe@{}.service", self.group)
    }

    /// Render a systemd unit file for the gateway service. `ExecStartPre`
    /// runs the workspace restore pass so it strictly precedes gateway
    /// start; the unit itself never restarts on its own appearance,
    /// leaving that to a separate handler unit — recovery is never a
    /// self-referential restart.
    pub fn to_unit_file(&self) -> String {
        let RestartPolicy::OnFailureExcept { critical_exit_code } = self.restart_policy;
        let mut out = String::new();
        let _ = writeln!(out, "[Unit]");
        let _ = writeln!(out, "Description=outpost gateway ({})", self.group);
        let _ = writeln!(out, "After=network.target");
        let _ = writeln!(out);
        let _ = writeln!(out, "[Service]");
        let _ = writeln!(out, "Type=notify");
        let _ = writeln!(out, "ExecStartPre={}", self.restore_command);
        let _ = writeln!(out, "ExecStart={}", self.start_command);
        let _ = writeln!(out, "ExecStartPost={}", self.post_start_probe_command);
        let _ = writeln!(out, "TimeoutStartSec={}", self.start_timeout_secs);
        let _ = writeln!(out, "Restart=on-failure");
        let _ = writeln!(out, "RestartPreventExitStatus={critical_exit_code}");
        let _ = writeln!(out);
        let _ = writeln!(out, "[Install]");
        let _ = writeln!(out, "WantedBy=multi-user.target");
        out
    }

    pub fn to_e2e_probe_unit_file(&self, outpostd_bin: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[Unit]");
        let _ = writeln!(out, "Description=outpost end-to-end probe ({})", self.group);
        let _ = writeln!(out, "BindsTo={}", self.gateway_unit_name());
        let _ = writeln!(out, "After={}", self.gateway_unit_name());
        let _ = writeln!(out);
        let _ = writeln!(out, "[Service]");
        let _ = writeln!(out, "Type=oneshot");
        let _ = writeln!(
            out,
            "ExecStart={outpostd_bin} probe e2e --group {}",
            self.group
        );
        let _ = writeln!(out, "TimeoutStartSec={}", self.e2e_timeout_secs);
        out
    }
}

/// An ordered plan of units to enable during provisioning. Services are
/// enabled but not started here — startup happens after the post-
/// provisioning reboot, unless `start_now` is set by the `START_SERVICES=true`
/// post-boot override.
#[derive(Debug, Clone)]
pub struct EnablementPlan {
    pub units: Vec<ServiceUnit>,
    pub start_now: bool,
}

impl EnablementPlan {
    pub fn new(units: Vec<ServiceUnit>, start_now: bool) -> Self {
        Self { units, start_now }
    }

    /// Unit names in enablement order: gateway first, then its bound
    /// end-to-end probe, per group.
    pub fn enable_order(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.units.len() * 2);
        for unit in &self.units {
            names.push(unit.gateway_unit_name());
            names.push(unit.e2e_probe_unit_name());
        }
        names
    }
}
