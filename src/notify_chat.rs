//! Notification library: best-effort alert delivery to the owner through
//! whatever chat transport is reachable.

use std::time::Duration;

use tracing::warn;

use crate::credentials::{ChatPlatform, find_working_chat_token};
use crate::manifest::Agent;

/// Why a notification attempt did not result in a delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyFailureReason {
    NoWorkingToken,
    NoOwnerIdForPlatform,
    DeliveryFailed(String),
}

/// Send a text message to the owner. Discovers a working token first from
/// `safe_mode_tokens` (consulted before the manifest's own agent tokens, as
/// these reflect whatever credential discovery most recently proved live),
/// then falls back to `agents`.
pub async fn notify_owner(
    client: &reqwest::Client,
    agents: &[Agent],
    safe_mode_tokens: &[(ChatPlatform, String)],
    owner_chat_id: &str,
    preferred: ChatPlatform,
    group: &str,
    text: &str,
) -> Result<(), NotifyFailureReason> {
    for (platform, token) in safe_mode_tokens {
        if deliver(client, *platform, token, owner_chat_id, text)
            .await
            .is_ok()
        {
            return Ok(());
        }
    }

    let Some((_, token, platform)) =
        find_working_chat_token(client, agents, preferred, group).await
    else {
        warn!(group, "notify_owner: no working chat token found");
        return Err(NotifyFailureReason::NoWorkingToken);
    };

    deliver(client, platform, token, owner_chat_id, text)
        .await
        .map_err(|e| NotifyFailureReason::DeliveryFailed(e.to_string()))
}

async fn deliver(
    client: &reqwest::Client,
    platform: ChatPlatform,
    token: &str,
    chat_id: &str,
    text: &str,
) -> anyhow::Result<()> {
    match platform {
        ChatPlatform::Telegram => {
            let url = format!("https://api.telegram.org/bot{token}/sendMessage");
            let resp = client
                .post(&url)
                .timeout(Duration::from_secs(10))
                .json(&serde_json::json!({ "chat_id": chat_id, "text": text }))
                .send()
                .await?;
            anyhow::ensure!(resp.status().is_success(), "telegram sendMessage failed: {}", resp.status());
        }
        ChatPlatform::Discord => {
            let url = format!("https://discord.com/api/v10/channels/{chat_id}/messages");
            let resp = client
                .post(&url)
                .header("Authorization", format!("Bot {token}"))
                .timeout(Duration::from_secs(10))
                .json(&serde_json::json!({ "content": text }))
                .send()
                .await?;
            anyhow::ensure!(resp.status().is_success(), "discord message post failed: {}", resp.status());
        }
    }
    Ok(())
}
