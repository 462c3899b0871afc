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

use std::{future::Future, time::Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub mod a2s;
pub mod discord;
pub mod runtime;
pub mod signature;

pub use signature::VerifiedInteraction;

/// The only slash command the bot registers.
pub const SUPPORTED_COMMAND: &str = "server";
pub const DNS_RECORD_TTL: i64 = 60;
pub const EPHEMERAL_MESSAGE_FLAG: u64 = 1 << 6;

pub const COLOR_ONLINE: u32 = 0x09e577;
pub const COLOR_STARTING: u32 = 0xf3a304;
pub const COLOR_STOPPED: u32 = 0xff0000;

/// Interaction type codes as sent by Discord.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    Ping,
    ApplicationCommand,
    Other(u8),
}

impl InteractionKind {
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Self::Ping,
            2 => Self::ApplicationCommand,
            other => Self::Other(other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    #[serde(default)]
    pub user: Option<User>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelRef {
    pub id: String,
}

/// Inbound interaction payload. `data` is kept raw so it can be forwarded
/// untouched to the workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct Interaction {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub application_id: String,
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub channel: Option<ChannelRef>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub member: Option<Member>,
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl Interaction {
    /// Guild invocations carry the user under `member`, DMs at the top level.
    pub fn invoker(&self) -> Option<&User> {
        self.member
            .as_ref()
            .and_then(|member| member.user.as_ref())
            .or(self.user.as_ref())
    }

    pub fn channel_id(&self) -> Option<&str> {
        self.channel
            .as_ref()
            .map(|channel| channel.id.as_str())
            .or(self.channel_id.as_deref())
    }

    /// Returns `None` when `data` is absent or does not look like a command.
    pub fn command_data(&self) -> Option<CommandData> {
        self.data
            .as_ref()
            .and_then(|data| serde_json::from_value(data.clone()).ok())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandData {
    pub name: String,
    #[serde(default)]
    pub options: Vec<CommandOption>,
}

impl CommandData {
    pub fn subcommand(&self) -> Option<&str> {
        self.options.first().map(|option| option.name.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandOption {
    pub name: String,
}

/// Normalized command handed to the workflow orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DispatchMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub user_id: String,
    pub user_name: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subcommand: Option<String>,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub application_id: String,
    pub interaction_id: String,
    pub data: serde_json::Value,
}

impl DispatchMessage {
    pub fn from_verified(verified: &VerifiedInteraction, command: &CommandData) -> Self {
        let interaction = verified.interaction();
        let invoker = interaction.invoker();
        Self {
            kind: interaction.kind.to_string(),
            user_id: invoker
                .map(|user| user.id.clone())
                .unwrap_or_else(|| "noId".to_string()),
            user_name: invoker
                .and_then(|user| user.username.clone())
                .unwrap_or_else(|| "noName".to_string()),
            command: command.name.clone(),
            subcommand: command.subcommand().map(str::to_string),
            token: interaction.token.clone(),
            channel_id: interaction.channel_id().map(str::to_string),
            application_id: interaction.application_id.clone(),
            interaction_id: interaction.id.clone(),
            data: interaction.data.clone().unwrap_or(serde_json::Value::Null),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub inline: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Embed {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
}

/// Message body for webhook sends. Also the reply shape of the status query.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OutgoingMessage {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub embeds: Vec<Embed>,
}

impl OutgoingMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            embeds: Vec::new(),
        }
    }

    pub fn has_embeds(&self) -> bool {
        !self.embeds.is_empty()
    }

    pub fn embeds_only(&self) -> Self {
        Self {
            content: String::new(),
            embeds: self.embeds.clone(),
        }
    }

    pub fn content_only(&self) -> Self {
        Self::text(self.content.clone())
    }
}

/// Workflow output consumed by the message sender.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEvent {
    #[serde(default)]
    pub application_id: String,
    #[serde(default)]
    pub token: String,
    pub message: OutgoingMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct QueryGameEvent {
    pub host: String,
    pub state: String,
    pub instance_type: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// EventBridge envelope; only the fields the handlers look at.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope<T> {
    #[serde(rename = "detail-type", default)]
    pub detail_type: String,
    #[serde(default)]
    pub source: String,
    pub detail: T,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

/// Reads a required variable; blank values count as missing.
pub fn required_var(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<String, ConfigError> {
    optional_var(lookup, var).ok_or(ConfigError::Missing(var))
}

pub fn optional_var(lookup: &impl Fn(&str) -> Option<String>, var: &str) -> Option<String> {
    lookup(var)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn env_lookup(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

/// Wraps one handler invocation with start/finish logging and timing.
pub async fn instrumented<F, T, E>(handler: &'static str, work: F) -> Result<T, E>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let started = Instant::now();
    info!(handler, "invocation started");
    let result = work.await;
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match &result {
        Ok(_) => info!(handler, elapsed_ms, "invocation finished"),
        Err(error) => warn!(handler, elapsed_ms, error = %error, "invocation failed"),
    }
    result
}
