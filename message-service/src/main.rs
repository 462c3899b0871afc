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
use ensh_common::{
    ConfigError, ResponseEvent,
    discord::{DEFAULT_API_BASE, DiscordClient, MessageTransport, WebhookRoute},
    env_lookup, instrumented, optional_var, required_var,
    runtime::run_event_function,
};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryTarget {
    /// Edit the deferred interaction response.
    InteractionResponse,
    /// Post through the configured channel webhook.
    Webhook,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmbedFallback {
    /// Resend once with the plain `content` when embeds are refused.
    PlainContent,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DeliveryStrategy {
    target: DeliveryTarget,
    fallback: EmbedFallback,
}

#[derive(Debug, Clone)]
struct WebhookCredentials {
    id: String,
    token: String,
}

#[derive(Debug, Clone)]
struct MessageConfig {
    api_base: String,
    strategy: DeliveryStrategy,
    webhook: Option<WebhookCredentials>,
}

impl MessageConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let target = match optional_var(&lookup, "DELIVERY_TARGET").as_deref() {
            None | Some("interaction") => DeliveryTarget::InteractionResponse,
            Some("webhook") => DeliveryTarget::Webhook,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "DELIVERY_TARGET",
                    reason: format!("expected interaction or webhook, got {other}"),
                });
            }
        };
        let fallback = match optional_var(&lookup, "EMBED_FALLBACK").as_deref() {
            None | Some("plain-content") => EmbedFallback::PlainContent,
            Some("none") => EmbedFallback::None,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "EMBED_FALLBACK",
                    reason: format!("expected plain-content or none, got {other}"),
                });
            }
        };
        let webhook = if target == DeliveryTarget::Webhook {
            Some(WebhookCredentials {
                id: required_var(&lookup, "WEBHOOK_ID")?,
                token: required_var(&lookup, "WEBHOOK_TOKEN")?,
            })
        } else {
            None
        };

        Ok(Self {
            api_base: optional_var(&lookup, "DISCORD_API_BASE")
                .unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            strategy: DeliveryStrategy { target, fallback },
            webhook,
        })
    }

    fn route_for(&self, event: &ResponseEvent) -> anyhow::Result<WebhookRoute> {
        match (self.strategy.target, self.webhook.as_ref()) {
            (DeliveryTarget::Webhook, Some(webhook)) => Ok(WebhookRoute::Webhook {
                id: webhook.id.clone(),
                token: webhook.token.clone(),
            }),
            (DeliveryTarget::Webhook, None) => anyhow::bail!("webhook target has no credentials"),
            (DeliveryTarget::InteractionResponse, _) => {
                if event.application_id.is_empty() || event.token.is_empty() {
                    anyhow::bail!("response event is missing applicationId or token");
                }
                Ok(WebhookRoute::OriginalResponse {
                    application_id: event.application_id.clone(),
                    token: event.token.clone(),
                })
            }
        }
    }
}

#[derive(Clone)]
struct AppState {
    config: Arc<MessageConfig>,
    transport: Arc<dyn MessageTransport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum DeliveryMode {
    Content,
    Embeds,
    PlainContentFallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct DeliveryReport {
    route: &'static str,
    mode: DeliveryMode,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "message_service=debug,tower_http=info".to_string()),
        )
        .init();

    let config = MessageConfig::from_env()?;
    info!(strategy = ?config.strategy, "message-service configured");
    let state = AppState {
        transport: Arc::new(DiscordClient::new(config.api_base.clone())),
        config: Arc::new(config),
    };

    run_event_function(
        "message-service",
        "MESSAGE_SERVICE_BIND",
        "0.0.0.0:8082",
        move |event: ResponseEvent| {
            let state = state.clone();
            async move { instrumented("deliver", deliver(&state, &event)).await }
        },
    )
    .await
}

async fn deliver(state: &AppState, event: &ResponseEvent) -> anyhow::Result<DeliveryReport> {
    let route = state.config.route_for(event)?;
    let message = &event.message;

    if !message.has_embeds() {
        state
            .transport
            .send(&route, &message.content_only())
            .await
            .context("content delivery failed")?;
        info!(route = route.label(), "message delivered");
        return Ok(DeliveryReport {
            route: route.label(),
            mode: DeliveryMode::Content,
        });
    }

    let error = match state.transport.send(&route, &message.embeds_only()).await {
        Ok(()) => {
            info!(route = route.label(), embeds = message.embeds.len(), "embeds delivered");
            return Ok(DeliveryReport {
                route: route.label(),
                mode: DeliveryMode::Embeds,
            });
        }
        Err(error) => error,
    };

    if state.config.strategy.fallback == EmbedFallback::None {
        return Err(error.context("embed delivery failed"));
    }
    if message.content.is_empty() {
        return Err(error.context("embed delivery failed and message has no plain content"));
    }

    warn!(
        route = route.label(),
        error = %format!("{error:#}"),
        "embed delivery failed; resending as plain content"
    );
    state
        .transport
        .send(&route, &message.content_only())
        .await
        .context("plain content fallback failed")?;
    Ok(DeliveryReport {
        route: route.label(),
        mode: DeliveryMode::PlainContentFallback,
    })
}
