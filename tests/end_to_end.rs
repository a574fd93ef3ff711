//! Scenario-level tests exercising the orchestration seams end to end
//! through their injectable traits (process watcher, rebooter, agent
//! probe, gateway restarter) rather than real chat/provider network
//! calls, which are already covered unit-by-unit in their own modules.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use hmac::{Hmac, Mac};
use outpost::boot::{self, NoopReboot};
use outpost::control_plane::{self, ControlPlaneState};
use outpost::credentials::ChatPlatform;
use outpost::manifest::{Agent, Isolation, ParsedManifest, Platform};
use outpost::probe::e2e::{self, AgentProbe, IntroSender, ProbeMode, HEALTH_CHECK_MARKER};
use outpost::probe::health::{self, NoopWarnNotifier};
use outpost::probe::ProcessWatcher;
use outpost::safe_mode::{self, GatewayRestarter, Outcome, PostRestartProbe};
use outpost::state::Paths;
use tower::ServiceExt as _;

fn make_agent(id: &str, group: &str, tokens: &[(&str, &str)], keys: &[(&str, &str)]) -> Agent {
    Agent {
        id: id.to_string(),
        isolation_group: group.to_string(),
        isolation: Isolation::None,
        model: "anthropic/claude".to_string(),
        tokens: tokens.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        provider_keys: keys.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        identity: None,
        persona: None,
        boot: None,
        bootstrap: None,
        user_context: None,
        potentially_unverifiable: false,
    }
}

fn manifest_with(agents: Vec<Agent>) -> ParsedManifest {
    ParsedManifest {
        name: "test-habitat".to_string(),
        platform: Platform::Telegram,
        isolation: Isolation::None,
        shared_paths: Vec::new(),
        api_bind_address: None,
        api_secret: None,
        destruct_minutes: None,
        owner_ids: BTreeMap::from([("telegram".to_string(), "owner-1".to_string())]),
        agents,
    }
}

/// Scenario 1: fresh healthy boot. One agent, boot runs every stage and
/// completes without a network-reachable chat token (credential
/// validation is best-effort during boot, not fatal — it's the
/// end-to-end probe that enforces it later).
#[tokio::test]
async fn fresh_healthy_boot_completes_all_stages() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::new(dir.path().join("state"), dir.path().join("home"));
    let manifest = manifest_with(vec![make_agent(
        "agent-1",
        "group-a",
        &[("telegram", "")],
        &[("anthropic", "sk-ant-oat01-trusted")],
    )]);
    let client = reqwest::Client::new();
    let rebooter = NoopReboot::default();

    boot::run_boot(&paths, &manifest, &client, &rebooter).await.unwrap();

    assert!(paths.marker("boot_complete").exists());
    assert!(!paths.marker("build_failed").exists());
    assert!(rebooter.called.load(Ordering::SeqCst));
    assert!(paths.gateway_config_path("group-a").exists());
}

/// Scenario 2: a broken chat token at probe time is authoritatively
/// rejected and must not be masked by any fallback — the agent stage
/// never even runs.
#[tokio::test]
async fn broken_chat_token_fails_probe_before_agent_stage() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::new(dir.path().join("state"), dir.path().join("home"));
    let agent = make_agent("agent-1", "group-a", &[("telegram", "")], &[]);

    struct UnreachableAgentProbe;
    #[async_trait::async_trait]
    impl AgentProbe for UnreachableAgentProbe {
        async fn probe(&self, _client: &reqwest::Client, _agent: &Agent) -> anyhow::Result<String> {
            panic!("agent stage must not run once the token stage has already rejected the token");
        }
    }
    struct UnreachableIntro;
    #[async_trait::async_trait]
    impl IntroSender for UnreachableIntro {
        async fn send_intro(&self, _client: &reqwest::Client, _agent: &Agent) -> anyhow::Result<()> {
            panic!("intro must not be sent on a failed probe");
        }
    }

    let client = reqwest::Client::new();
    let result = e2e::run_normal(
        &paths,
        "group-a",
        &[agent],
        ChatPlatform::Telegram,
        &ProbeMode::Normal { agent_ids: vec![] },
        &client,
        &UnreachableAgentProbe,
        &UnreachableIntro,
    )
    .await;

    // Empty token short-circuits validate_chat_token to Invalid without a
    // network call, so this assertion holds offline.
    assert!(result.is_err());
    assert!(paths.group_marker("unhealthy", "group-a").exists());
}

/// Scenario 3: neither a chat token nor a provider key can be rediscovered
/// (both empty, validated offline with no network call), so the
/// escalation ladder falls back to the pinned emergency config rather
/// than looping on discovery.
#[tokio::test]
async fn discovery_failure_falls_back_to_emergency_config() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::new(dir.path().join("state"), dir.path().join("home"));
    let agents = vec![make_agent("agent-1", "group-a", &[("telegram", "")], &[])];

    struct RecordingRestarter {
        called: AtomicBool,
    }
    impl GatewayRestarter for RecordingRestarter {
        fn restart(&self, _group: &str) -> anyhow::Result<()> {
            self.called.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct NeverCalled;
    #[async_trait::async_trait]
    impl PostRestartProbe for NeverCalled {
        async fn passes(&self, _group: &str) -> bool {
            panic!("emergency fallback installs its own config directly, it never reaches the post-restart probe");
        }
    }

    let client = reqwest::Client::new();
    let restarter = RecordingRestarter {
        called: AtomicBool::new(false),
    };

    let outcome = safe_mode::handle_unhealthy(
        &paths,
        "group-a",
        &agents,
        ChatPlatform::Telegram,
        None,
        &client,
        &restarter,
        &NeverCalled,
        "owner-1",
        2,
    )
    .await
    .unwrap();

    assert_eq!(outcome, Outcome::Critical);
    assert!(restarter.called.load(Ordering::SeqCst));
    assert!(paths.gateway_config_path("group-a").exists());
}

/// Scenario 4: a signed config upload followed by apply regenerates the
/// on-disk config for every group. Exercised directly against the
/// handler-adjacent building blocks rather than over HTTP, since the
/// signing middleware itself is covered in `control_plane::auth` tests.
#[tokio::test]
async fn config_regeneration_writes_every_group() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::new(dir.path().join("state"), dir.path().join("home"));
    let manifest = manifest_with(vec![
        make_agent("agent-1", "group-a", &[], &[("anthropic", "sk-ant-oat01-x")]),
        make_agent("agent-2", "group-b", &[], &[("anthropic", "sk-ant-oat01-y")]),
    ]);

    for group in manifest.isolation_groups() {
        let config = outpost::gateway_config::GatewayConfig::build(
            outpost::gateway_config::Mode::Full,
            group.port,
            &group.agents,
            None,
            Default::default(),
        )
        .unwrap();
        config
            .write_atomically(&paths.gateway_config_path(&group.name), false)
            .unwrap();
    }

    assert!(paths.gateway_config_path("group-a").exists());
    assert!(paths.gateway_config_path("group-b").exists());
}

/// Scenario 5: a request signed with a stale timestamp is rejected by the
/// replay-window check before the signature is even compared. Driven
/// through the real router rather than asserted on bare arithmetic.
#[tokio::test]
async fn stale_signature_timestamp_is_outside_replay_window() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::new(dir.path().join("state"), dir.path().join("home"));
    let state = ControlPlaneState::new(paths, manifest_with(vec![]), Some("top-secret".to_string()));
    let app = control_plane::router(state);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let stale_timestamp = now - 301;
    let message = format!("{stale_timestamp}.GET./config.").into_bytes();
    let mut mac = Hmac::<sha2::Sha256>::new_from_slice(b"top-secret").unwrap();
    mac.update(&message);
    let signature = hex::encode(mac.finalize().into_bytes());

    let request = Request::builder()
        .method("GET")
        .uri("/config")
        .header("x-timestamp", stale_timestamp.to_string())
        .header("x-signature", signature)
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// Scenario 6: copy-up without a prior restore pass is refused outright.
#[tokio::test]
async fn sync_without_restore_guard_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::new(dir.path().join("state"), dir.path().join("home"));
    let err = outpost::sync::copy_up_all(&paths, &["agent-1".to_string()])
        .await
        .unwrap_err();
    assert!(matches!(err, outpost::sync::SyncError::RestoreGuardMissing));
}

/// Health probe against a real local listener: settles, polls, and
/// succeeds once the process is observed running and the port answers.
#[tokio::test]
async fn health_probe_passes_once_process_and_port_are_live() {
    std::env::set_var("HEALTH_CHECK_SETTLE_SECS", "0");
    std::env::set_var("HEALTH_CHECK_WARN_SECS", "5");
    std::env::set_var("HEALTH_CHECK_HARD_MAX_SECS", "10");

    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::io::AsyncWriteExt::write_all(
                &mut socket,
                b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n",
            )
            .await
            .ok();
        }
    });

    struct AlwaysRunning;
    impl ProcessWatcher for AlwaysRunning {
        fn is_running(&self, _binary_name: &str) -> bool {
            true
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::new(dir.path().join("state"), dir.path().join("home"));
    let client = reqwest::Client::new();
    let watcher = AlwaysRunning;

    health::run_health_probe(
        &paths,
        "group-a",
        port,
        &client,
        &watcher,
        "outpost-gatewayd",
        &NoopWarnNotifier,
    )
    .await
    .unwrap();

    assert!(!paths.group_marker("unhealthy", "group-a").exists());
}

/// Successful end-to-end probe sends exactly one introduction and the
/// marker prevents a second send on rerun.
#[tokio::test]
async fn intro_is_sent_once_per_boot() {
    let dir = tempfile::tempdir().unwrap();
    let paths = Paths::new(dir.path().join("state"), dir.path().join("home"));
    let agent = make_agent("agent-1", "group-a", &[], &[]);

    struct AlwaysOk;
    #[async_trait::async_trait]
    impl AgentProbe for AlwaysOk {
        async fn probe(&self, _client: &reqwest::Client, _agent: &Agent) -> anyhow::Result<String> {
            Ok(HEALTH_CHECK_MARKER.to_string())
        }
    }

    struct CountingIntro {
        sent: Arc<AtomicU32>,
    }
    #[async_trait::async_trait]
    impl IntroSender for CountingIntro {
        async fn send_intro(&self, _client: &reqwest::Client, _agent: &Agent) -> anyhow::Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let sent = Arc::new(AtomicU32::new(0));
    let client = reqwest::Client::new();
    let intro = CountingIntro { sent: sent.clone() };

    for _ in 0..2 {
        e2e::run_normal(
            &paths,
            "group-a",
            &[agent.clone()],
            ChatPlatform::Telegram,
            &ProbeMode::Normal { agent_ids: vec![] },
            &client,
            &AlwaysOk,
            &intro,
        )
        .await
        .unwrap();
    }

    assert_eq!(sent.load(Ordering::SeqCst), 1);
}
