// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_ec2::{Client as Ec2Client, types::Tag};
use chrono::Utc;
use ensh_common::{
    COLOR_ONLINE, COLOR_STARTING, COLOR_STOPPED, ConfigError, Embed, EventEnvelope,
    OutgoingMessage,
    discord::{DEFAULT_API_BASE, DiscordClient, MessageTransport, WebhookRoute},
    env_lookup, instrumented, optional_var,
    runtime::run_event_function,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const STARTED_ON_TAG: &str = "x-server-started-on";

#[derive(Debug, Clone, Deserialize)]
struct InstanceStateDetail {
    state: String,
    #[serde(rename = "instance-id")]
    instance_id: String,
}

type InstanceStateEvent = EventEnvelope<InstanceStateDetail>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ServerStatus {
    text: String,
    color: u32,
}

impl ServerStatus {
    fn for_state(state: &str) -> Self {
        match state {
            "stopped" | "stopping" => Self {
                text: state.to_string(),
                color: COLOR_STOPPED,
            },
            "pending" => Self {
                text: "starting".to_string(),
                color: COLOR_STARTING,
            },
            _ => Self {
                text: state.to_string(),
                color: COLOR_ONLINE,
            },
        }
    }

    fn headline(&self) -> String {
        format!("Server is {}", self.text)
    }

    fn announcement(&self) -> OutgoingMessage {
        OutgoingMessage {
            content: String::new(),
            embeds: vec![Embed {
                title: Some(self.headline()),
                color: Some(self.color),
                ..Embed::default()
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct NotifyOutcome {
    instance_id: String,
    state: String,
    text: String,
    tagged: bool,
    announced: bool,
}

#[derive(Debug, Clone)]
struct NotifyConfig {
    api_base: String,
    webhook: Option<WebhookRoute>,
}

impl NotifyConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let webhook = match (
            optional_var(&lookup, "WEBHOOK_ID"),
            optional_var(&lookup, "WEBHOOK_TOKEN"),
        ) {
            (Some(id), Some(token)) => Some(WebhookRoute::Webhook { id, token }),
            (None, None) => None,
            (Some(_), None) => return Err(ConfigError::Missing("WEBHOOK_TOKEN")),
            (None, Some(_)) => return Err(ConfigError::Missing("WEBHOOK_ID")),
        };
        Ok(Self {
            api_base: optional_var(&lookup, "DISCORD_API_BASE")
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            webhook,
        })
    }
}

#[async_trait]
trait InstanceTagger: Send + Sync {
    async fn tag_started(&self, instance_id: &str, started_on_ms: i64) -> anyhow::Result<()>;
}

#[derive(Clone)]
struct Ec2InstanceTagger {
    client: Ec2Client,
}

#[async_trait]
impl InstanceTagger for Ec2InstanceTagger {
    async fn tag_started(&self, instance_id: &str, started_on_ms: i64) -> anyhow::Result<()> {
        self.client
            .create_tags()
            .resources(instance_id)
            .tags(
                Tag::builder()
                    .key(STARTED_ON_TAG)
                    .value(started_on_ms.to_string())
                    .build(),
            )
            .send()
            .await
            .with_context(|| format!("failed to tag {instance_id} with start time"))?;
        Ok(())
    }
}

#[derive(Clone)]
struct AppState {
    config: Arc<NotifyConfig>,
    tagger: Arc<dyn InstanceTagger>,
    transport: Arc<dyn MessageTransport>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "notify_service=debug,tower_http=info".to_string()),
        )
        .init();

    let config = NotifyConfig::from_env()?;
    if config.webhook.is_none() {
        info!("no webhook configured; state changes are only logged");
    }
    let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
    let state = AppState {
        transport: Arc::new(DiscordClient::new(config.api_base.clone())),
        config: Arc::new(config),
        tagger: Arc::new(Ec2InstanceTagger {
            client: Ec2Client::new(&sdk_config),
        }),
    };

    run_event_function(
        "notify-service",
        "NOTIFY_SERVICE_BIND",
        "0.0.0.0:8085",
        move |event: InstanceStateEvent| {
            let state = state.clone();
            async move { instrumented("notify", notify(&state, &event)).await }
        },
    )
    .await
}

async fn notify(state: &AppState, event: &InstanceStateEvent) -> anyhow::Result<NotifyOutcome> {
    let detail = &event.detail;
    let status = ServerStatus::for_state(&detail.state);

    let tagged = if detail.state == "running" {
        state
            .tagger
            .tag_started(&detail.instance_id, Utc::now().timestamp_millis())
            .await?;
        true
    } else {
        false
    };

    info!(instance_id = %detail.instance_id, "{}", status.headline());

    let announced = match &state.config.webhook {
        Some(route) => match state.transport.send(route, &status.announcement()).await {
            Ok(()) => true,
            Err(error) => {
                warn!(error = %format!("{error:#}"), "state announcement failed");
                false
            }
        },
        None => false,
    };

    Ok(NotifyOutcome {
        instance_id: detail.instance_id.clone(),
        state: detail.state.clone(),
        text: status.text,
        tagged,
        announced,
    })
}
