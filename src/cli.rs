use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "outpostd")]
#[command(about = "Provisions and supervises chat-bridged agent workstations", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the sequential boot orchestrator.
    Boot,
    /// Probes.
    Probe {
        #[command(subcommand)]
        probe: ProbeCommand,
    },
    /// Run one pass of the safe-mode escalation ladder for a group.
    /// Invoked by its own supervised unit, never by the gateway unit
    /// restarting itself.
    SafeMode {
        #[arg(long)]
        group: String,
    },
    /// Start the signed HTTP control plane.
    Serve,
    /// Trigger the workspace sync engine.
    Sync {
        #[command(subcommand)]
        sync: SyncCommand,
    },
}

#[derive(Subcommand, Debug)]
pub enum ProbeCommand {
    /// HTTP health probe.
    Health {
        #[arg(long)]
        group: String,
        #[arg(long)]
        port: u16,
    },
    /// End-to-end probe.
    E2e {
        #[arg(long)]
        group: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum SyncCommand {
    Restore,
    CopyUp,
}
