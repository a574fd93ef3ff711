//! HTTP health probe: the lightest possible liveness check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::state::Paths;

use super::{ProcessWatcher, ProbeError, Result};

pub const DEFAULT_SETTLE_SECS: u64 = 10;
pub const POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_NO_PROCESS_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_WARN_SECS: u64 = 120;
pub const DEFAULT_HARD_MAX_SECS: u64 = 300;

/// Notified once, at `WARN_SECS`, if the probe is still waiting.
#[async_trait::async_trait]
pub trait WarnNotifier: Send + Sync {
    async fn notify_still_waiting(&self, group: &str);
}

pub struct NoopWarnNotifier;

#[async_trait::async_trait]
impl WarnNotifier for NoopWarnNotifier {
    async fn notify_still_waiting(&self, _group: &str) {}
}

fn env_secs(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Poll `http://127.0.0.1:<port>/` until it answers 2xx, the gateway
/// process crashes, or a timeout fires. Returns `Ok(())` on success; on
/// any failure path it writes the `unhealthy[<group>]` marker as a side
/// effect before returning `Err`.
pub async fn run_health_probe(
    paths: &Paths,
    group: &str,
    port: u16,
    client: &reqwest::Client,
    process_watcher: &dyn ProcessWatcher,
    binary_name: &str,
    warn_notifier: &dyn WarnNotifier,
) -> Result<()> {
    let settle = Duration::from_secs(env_secs("HEALTH_CHECK_SETTLE_SECS", DEFAULT_SETTLE_SECS));
    let warn_secs = env_secs("HEALTH_CHECK_WARN_SECS", DEFAULT_WARN_SECS);
    let hard_max_secs = env_secs("HEALTH_CHECK_HARD_MAX_SECS", DEFAULT_HARD_MAX_SECS);

    tokio::time::sleep(settle).await;

    let start = Instant::now();
    let observed_running = AtomicBool::new(false);
    let warned = AtomicBool::new(false);
    let url = format!("http://127.0.0.1:{port}/");

    loop {
        let elapsed = start.elapsed().as_secs();
        let running_now = process_watcher.is_running(binary_name);

        if running_now {
            observed_running.store(true, Ordering::SeqCst);
        } else if observed_running.load(Ordering::SeqCst) {
            warn!(group, "gateway process disappeared after being observed running");
            return fail(paths, group).await;
        }

        if !observed_running.load(Ordering::SeqCst)
            && elapsed >= DEFAULT_NO_PROCESS_TIMEOUT_SECS
        {
            warn!(group, "gateway process never appeared within timeout");
            return fail(paths, group).await;
        }

        if let Ok(resp) = client.get(&url).timeout(Duration::from_secs(5)).send().await {
            if resp.status().is_success() {
                info!(group, "health probe passed");
                return Ok(());
            }
        }

        if elapsed >= warn_secs && !warned.swap(true, Ordering::SeqCst) {
            warn_notifier.notify_still_waiting(group).await;
        }

        if elapsed >= hard_max_secs {
            warn!(group, "health probe hit hard max timeout");
            return fail(paths, group).await;
        }

        tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)).await;
    }
}

async fn fail(paths: &Paths, group: &str) -> Result<()> {
    paths.group_marker("unhealthy", group).touch()?;
    Err(ProbeError::Unhealthy(group.to_string()))
}
