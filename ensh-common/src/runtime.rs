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

//! Shared entry point for the event-triggered functions.
//!
//! Inside Lambda the handler is served by `lambda_runtime`; anywhere else a
//! small HTTP router exposes it on `POST /invoke` for local testing.

use std::{future::Future, net::SocketAddr};

use anyhow::Context;
use axum::{
    Json, Router,
    http::StatusCode,
    routing::{get, post},
};
use lambda_runtime::{LambdaEvent, service_fn};
use serde::{Serialize, de::DeserializeOwned};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub fn lambda_mode() -> bool {
    std::env::var("AWS_LAMBDA_RUNTIME_API").is_ok()
}

pub fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

pub async fn run_event_function<E, R, F, Fut>(
    service: &'static str,
    bind_var: &str,
    default_bind: &str,
    handler: F,
) -> anyhow::Result<()>
where
    E: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(E) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    if lambda_mode() {
        info!("AWS Lambda runtime detected; running {service} in lambda mode");
        lambda_runtime::run(service_fn(move |event: LambdaEvent<E>| {
            let handler = handler.clone();
            async move {
                handler(event.payload)
                    .await
                    .map_err(lambda_runtime::Error::from)
            }
        }))
        .await
        .map_err(|e| anyhow::Error::msg(format!("lambda runtime error: {e}")))?;
        return Ok(());
    }

    let bind_addr = parse_bind_addr(bind_var, default_bind)?;
    info!(%bind_addr, "{service} listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, event_router(service, handler)).await?;
    Ok(())
}

pub fn event_router<E, R, F, Fut>(service: &'static str, handler: F) -> Router
where
    E: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(E) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    Router::new()
        .route(
            "/health",
            get(move || async move { Json(serde_json::json!({"ok": true, "service": service})) }),
        )
        .route(
            "/invoke",
            post(move |Json(event): Json<E>| {
                let handler = handler.clone();
                async move {
                    handler(event).await.map(Json).map_err(|error| {
                        warn!(error = %error, "local invocation failed");
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            Json(serde_json::json!({"error": format!("{error:#}")})),
                        )
                    })
                }
            }),
        )
        .layer(TraceLayer::new_for_http())
}
