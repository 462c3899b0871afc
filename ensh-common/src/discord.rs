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

//! Minimal Discord webhook REST client.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Method;

use crate::OutgoingMessage;

pub const DEFAULT_API_BASE: &str = "https://discord.com/api/v10";

/// Where a webhook message goes. Tokens are part of the path, so routes are
/// never logged in full.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookRoute {
    /// Edits the original response of an interaction (the deferred ack).
    OriginalResponse {
        application_id: String,
        token: String,
    },
    /// Posts through a channel webhook.
    Webhook { id: String, token: String },
}

impl WebhookRoute {
    pub fn method(&self) -> Method {
        match self {
            Self::OriginalResponse { .. } => Method::PATCH,
            Self::Webhook { .. } => Method::POST,
        }
    }

    pub fn path(&self) -> String {
        match self {
            Self::OriginalResponse {
                application_id,
                token,
            } => format!("webhooks/{application_id}/{token}/messages/@original"),
            Self::Webhook { id, token } => format!("webhooks/{id}/{token}"),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::OriginalResponse { .. } => "original_response",
            Self::Webhook { .. } => "webhook",
        }
    }
}

#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, route: &WebhookRoute, message: &OutgoingMessage) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct DiscordClient {
    client: reqwest::Client,
    base_url: String,
}

impl DiscordClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    pub fn endpoint(&self, route: &WebhookRoute) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), route.path())
    }
}

#[async_trait]
impl MessageTransport for DiscordClient {
    async fn send(&self, route: &WebhookRoute, message: &OutgoingMessage) -> anyhow::Result<()> {
        let response = self
            .client
            .request(route.method(), self.endpoint(route))
            .json(message)
            .send()
            .await
            .map_err(reqwest::Error::without_url)
            .with_context(|| format!("failed to call Discord {} route", route.label()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<response body unavailable>".to_string());
            anyhow::bail!("Discord {} route returned {status}: {body}", route.label());
        }
        Ok(())
    }
}
