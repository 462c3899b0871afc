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

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use ensh_common::{
    COLOR_ONLINE, ConfigError, Embed, EmbedField, OutgoingMessage, QueryGameEvent,
    a2s::{self, DEFAULT_QUERY_PORT, QueryError, ServerInfo},
    env_lookup, instrumented, optional_var,
    runtime::run_event_function,
};
use tracing::{info, warn};

const RUNNING_STATE: &str = "running";
const OFFLINE_REPLY: &str = "Server is offline";
const UNREACHABLE_REPLY: &str = "Server is running but did not answer the status query";
const DEFAULT_TIMEOUT_MS: u64 = 2000;

#[derive(Debug, Clone)]
struct QueryConfig {
    query_port: u16,
    timeout: Duration,
}

impl QueryConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let query_port = match optional_var(&lookup, "GAME_QUERY_PORT") {
            Some(value) => value.parse::<u16>().map_err(|e| ConfigError::Invalid {
                var: "GAME_QUERY_PORT",
                reason: e.to_string(),
            })?,
            None => DEFAULT_QUERY_PORT,
        };
        let timeout_ms = match optional_var(&lookup, "QUERY_TIMEOUT_MS") {
            Some(value) => value.parse::<u64>().map_err(|e| ConfigError::Invalid {
                var: "QUERY_TIMEOUT_MS",
                reason: e.to_string(),
            })?,
            None => DEFAULT_TIMEOUT_MS,
        };
        Ok(Self {
            query_port,
            timeout: Duration::from_millis(timeout_ms.max(1)),
        })
    }
}

#[async_trait]
trait ServerProbe: Send + Sync {
    async fn probe(&self, address: &str) -> Result<ServerInfo, QueryError>;
}

struct A2sProbe {
    timeout: Duration,
}

#[async_trait]
impl ServerProbe for A2sProbe {
    async fn probe(&self, address: &str) -> Result<ServerInfo, QueryError> {
        a2s::query_info(address, self.timeout).await
    }
}

#[derive(Clone)]
struct AppState {
    config: Arc<QueryConfig>,
    probe: Arc<dyn ServerProbe>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "query_service=debug,tower_http=info".to_string()),
        )
        .init();

    let config = QueryConfig::from_env()?;
    let state = AppState {
        probe: Arc::new(A2sProbe {
            timeout: config.timeout,
        }),
        config: Arc::new(config),
    };

    run_event_function(
        "query-service",
        "QUERY_SERVICE_BIND",
        "0.0.0.0:8083",
        move |event: QueryGameEvent| {
            let state = state.clone();
            async move { instrumented("query", query(&state, &event)).await }
        },
    )
    .await
}

async fn query(state: &AppState, event: &QueryGameEvent) -> anyhow::Result<OutgoingMessage> {
    if event.state != RUNNING_STATE {
        info!(state = %event.state, "instance not running; skipping live query");
        return Ok(OutgoingMessage::text(OFFLINE_REPLY));
    }

    let address = a2s::query_address(&event.host, state.config.query_port);
    match state.probe.probe(&address).await {
        Ok(info) => {
            info!(
                address = %address,
                players = info.players,
                max_players = info.max_players,
                "game server answered"
            );
            Ok(online_reply(&info, &event.instance_type))
        }
        Err(error) => {
            warn!(address = %address, error = %error, "game server query failed");
            Ok(OutgoingMessage::text(UNREACHABLE_REPLY))
        }
    }
}

fn online_reply(info: &ServerInfo, instance_type: &str) -> OutgoingMessage {
    OutgoingMessage {
        content: format!(
            "Server {} is running with `{}/{}` online on AWS `{}.`",
            info.name, info.players, info.max_players, instance_type
        ),
        embeds: vec![Embed {
            title: Some("Server is Online".to_string()),
            color: Some(COLOR_ONLINE),
            fields: vec![
                EmbedField {
                    name: "Online".to_string(),
                    value: info.players.to_string(),
                    inline: true,
                },
                EmbedField {
                    name: "Slots".to_string(),
                    value: info.max_players.to_string(),
                    inline: true,
                },
                EmbedField {
                    name: "Instance Type".to_string(),
                    value: instance_type.to_string(),
                    inline: false,
                },
            ],
            ..Embed::default()
        }],
    }
}
