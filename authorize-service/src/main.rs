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
use aws_sdk_sfn::Client as SfnClient;
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use ed25519_dalek::VerifyingKey;
use ensh_common::{
    ConfigError, DispatchMessage, EPHEMERAL_MESSAGE_FLAG, InteractionKind, SUPPORTED_COMMAND,
    env_lookup, optional_var, required_var,
    runtime::{lambda_mode, parse_bind_addr},
    signature::{self, SIGNATURE_HEADER, TIMESTAMP_HEADER},
};
use lambda_http::run as lambda_run;
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

const ACK_CONTENT: &str = "Command sent";

#[derive(Clone)]
struct AppState {
    config: Arc<AuthorizeConfig>,
    dispatcher: Arc<dyn CommandDispatcher>,
}

#[derive(Debug, Clone)]
struct AuthorizeConfig {
    public_key: VerifyingKey,
    state_machine_arn: String,
    ephemeral: bool,
}

impl AuthorizeConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let public_key = signature::decode_public_key(&required_var(&lookup, "APP_PUBLIC_KEY")?)
            .map_err(|e| ConfigError::Invalid {
                var: "APP_PUBLIC_KEY",
                reason: e.to_string(),
            })?;
        Ok(Self {
            public_key,
            state_machine_arn: required_var(&lookup, "STATE_MACHINE_ARN")?,
            ephemeral: optional_var(&lookup, "EPHEMERAL").as_deref() == Some("true"),
        })
    }
}

#[async_trait]
trait CommandDispatcher: Send + Sync {
    async fn dispatch(&self, message: &DispatchMessage) -> anyhow::Result<()>;
}

#[derive(Clone)]
struct StepFunctionsDispatcher {
    client: SfnClient,
    state_machine_arn: String,
}

impl StepFunctionsDispatcher {
    async fn from_config(config: &AuthorizeConfig) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self {
            client: SfnClient::new(&sdk_config),
            state_machine_arn: config.state_machine_arn.clone(),
        }
    }
}

#[async_trait]
impl CommandDispatcher for StepFunctionsDispatcher {
    async fn dispatch(&self, message: &DispatchMessage) -> anyhow::Result<()> {
        let input = serde_json::to_string(message).context("failed to encode dispatch message")?;
        self.client
            .start_execution()
            .state_machine_arn(&self.state_machine_arn)
            .input(input)
            .send()
            .await
            .context("failed to start workflow execution")?;

        info!(
            interaction_id = %message.interaction_id,
            command = %message.command,
            subcommand = ?message.subcommand,
            user_id = %message.user_id,
            "workflow execution started"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "authorize_service=debug,tower_http=info".to_string()),
        )
        .init();

    let config = AuthorizeConfig::from_env()?;
    let dispatcher = StepFunctionsDispatcher::from_config(&config).await;
    let state = AppState {
        config: Arc::new(config),
        dispatcher: Arc::new(dispatcher),
    };

    let app = build_router(state);

    if lambda_mode() {
        info!("AWS Lambda runtime detected; running authorize-service in lambda mode");
        lambda_run(app)
            .await
            .map_err(|e| anyhow::Error::msg(format!("lambda runtime error: {e}")))?;
        return Ok(());
    }

    let bind_addr = parse_bind_addr("AUTHORIZE_SERVICE_BIND", "0.0.0.0:8080")?;
    info!(%bind_addr, "authorize-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/discord", post(interactions_handler))
        .route("/interactions", post(interactions_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "authorize-service"}))
}

async fn interactions_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<InteractionResponse>, Rejection> {
    authorize(&state, &headers, &body).await.map(Json)
}

/// Discord interaction callback body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct InteractionResponse {
    #[serde(rename = "type")]
    kind: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<ResponseData>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct ResponseData {
    content: String,
    flags: u64,
}

impl InteractionResponse {
    fn pong() -> Self {
        Self {
            kind: 1,
            data: None,
        }
    }

    fn ephemeral_ack() -> Self {
        Self {
            kind: 4,
            data: Some(ResponseData {
                content: ACK_CONTENT.to_string(),
                flags: EPHEMERAL_MESSAGE_FLAG,
            }),
        }
    }

    fn deferred_ack() -> Self {
        Self {
            kind: 5,
            data: None,
        }
    }
}

async fn authorize(
    state: &AppState,
    headers: &HeaderMap,
    body: &str,
) -> Result<InteractionResponse, Rejection> {
    let signature_hex = header_value(headers, SIGNATURE_HEADER);
    let timestamp = header_value(headers, TIMESTAMP_HEADER);
    let (Some(signature_hex), Some(timestamp)) = (signature_hex, timestamp) else {
        return Err(Rejection::BadRequest("Invalid request"));
    };
    if body.is_empty() {
        return Err(Rejection::BadRequest("Invalid request"));
    }

    let verified = signature::verify(&state.config.public_key, signature_hex, timestamp, body)
        .map_err(|error| {
            debug!(error = %error, "signature verification failed");
            Rejection::Unauthorized
        })?;

    let kind = verified.kind().map_err(|error| {
        debug!(error = %error, "verified body has no interaction type");
        Rejection::BadRequest("Invalid request")
    })?;

    match kind {
        InteractionKind::Ping => Ok(InteractionResponse::pong()),
        InteractionKind::ApplicationCommand => {
            let interaction = verified.parse().map_err(|error| {
                debug!(error = %error, "verified body is not an interaction");
                Rejection::BadRequest("Invalid request")
            })?;
            let command = interaction
                .command_data()
                .filter(|data| data.name == SUPPORTED_COMMAND)
                .ok_or(Rejection::BadRequest("Invalid command"))?;

            let message = DispatchMessage::from_verified(&interaction, &command);
            state.dispatcher.dispatch(&message).await.map_err(|error| {
                warn!(
                    interaction_id = %message.interaction_id,
                    error = %format!("{error:#}"),
                    "dispatch failed"
                );
                Rejection::InternalError
            })?;

            if state.config.ephemeral {
                Ok(InteractionResponse::ephemeral_ack())
            } else {
                Ok(InteractionResponse::deferred_ack())
            }
        }
        InteractionKind::Other(code) => {
            debug!(code, "unsupported interaction type");
            Err(Rejection::BadRequest("Unsupported interaction type"))
        }
    }
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    BadRequest(&'static str),
    Unauthorized,
    InternalError,
}

impl Rejection {
    fn status(self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(self) -> &'static str {
        match self {
            Self::BadRequest(message) => message,
            Self::Unauthorized => "invalid signature",
            Self::InternalError => "Could not process event",
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        warn!(status = %self.status(), message = %self.message(), "request rejected");
        (
            self.status(),
            Json(serde_json::json!({"errorMessage": self.message()})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{Body, to_bytes},
        http::{HeaderValue, Request},
    };
    use ed25519_dalek::{Signer, SigningKey};
    use std::sync::Mutex;
    use tower::ServiceExt;

    const TIMESTAMP: &str = "1700000000";

    #[derive(Default)]
    struct RecordingDispatcher {
        dispatched: Mutex<Vec<DispatchMessage>>,
        fail: bool,
    }

    #[async_trait]
    impl CommandDispatcher for RecordingDispatcher {
        async fn dispatch(&self, message: &DispatchMessage) -> anyhow::Result<()> {
            if self.fail {
                return Err(anyhow::anyhow!("forced dispatch error"));
            }
            self.dispatched.lock().unwrap().push(message.clone());
            Ok(())
        }
    }

    fn signing_key() -> SigningKey {
        SigningKey::from_bytes(&[42u8; 32])
    }

    fn app_state(dispatcher: Arc<RecordingDispatcher>, ephemeral: bool) -> AppState {
        AppState {
            config: Arc::new(AuthorizeConfig {
                public_key: signing_key().verifying_key(),
                state_machine_arn: "arn:aws:states:eu-west-1:1:stateMachine:test".to_string(),
                ephemeral,
            }),
            dispatcher,
        }
    }

    fn signed_headers(body: &str) -> HeaderMap {
        let signature = signing_key().sign(format!("{TIMESTAMP}{body}").as_bytes());
        let mut headers = HeaderMap::new();
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&hex::encode(signature.to_bytes())).unwrap(),
        );
        headers.insert(TIMESTAMP_HEADER, HeaderValue::from_static(TIMESTAMP));
        headers
    }

    fn command_body(name: &str) -> String {
        serde_json::json!({
            "type": 2,
            "id": "int-1",
            "application_id": "app-1",
            "token": "tok-1",
            "channel": {"id": "chan-1"},
            "member": {"user": {"id": "42", "username": "alice"}},
            "data": {"name": name, "options": [{"name": "status", "type": 1}]}
        })
        .to_string()
    }

    #[test]
    fn config_requires_public_key_and_state_machine() {
        let key = hex::encode(signing_key().verifying_key().to_bytes());
        let missing_key = AuthorizeConfig::from_lookup(|name| match name {
            "STATE_MACHINE_ARN" => Some("arn".to_string()),
            _ => None,
        });
        assert!(matches!(
            missing_key,
            Err(ConfigError::Missing("APP_PUBLIC_KEY"))
        ));

        let missing_target = AuthorizeConfig::from_lookup(|name| match name {
            "APP_PUBLIC_KEY" => Some(key.clone()),
            _ => None,
        });
        assert!(matches!(
            missing_target,
            Err(ConfigError::Missing("STATE_MACHINE_ARN"))
        ));
    }

    #[test]
    fn config_rejects_malformed_public_key_and_reads_ephemeral_flag() {
        let bad = AuthorizeConfig::from_lookup(|name| match name {
            "APP_PUBLIC_KEY" => Some("abc".to_string()),
            "STATE_MACHINE_ARN" => Some("arn".to_string()),
            _ => None,
        });
        assert!(matches!(
            bad,
            Err(ConfigError::Invalid {
                var: "APP_PUBLIC_KEY",
                ..
            })
        ));

        let key = hex::encode(signing_key().verifying_key().to_bytes());
        let config = AuthorizeConfig::from_lookup(|name| match name {
            "APP_PUBLIC_KEY" => Some(key.clone()),
            "STATE_MACHINE_ARN" => Some("arn".to_string()),
            "EPHEMERAL" => Some("true".to_string()),
            _ => None,
        })
        .unwrap();
        assert!(config.ephemeral);
        assert_eq!(config.public_key, signing_key().verifying_key());
    }

    #[tokio::test]
    async fn ping_returns_pong_without_dispatch() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let state = app_state(dispatcher.clone(), false);
        let body = r#"{"type":1,"id":"ping","application_id":"app","token":"t","version":1}"#;

        let response = authorize(&state, &signed_headers(body), body).await.unwrap();

        assert_eq!(response, InteractionResponse::pong());
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({"type": 1})
        );
        assert!(dispatcher.dispatched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_headers_or_body_is_bad_request() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let state = app_state(dispatcher.clone(), false);
        let body = r#"{"type":1}"#;

        let mut no_signature = signed_headers(body);
        no_signature.remove(SIGNATURE_HEADER);
        assert_eq!(
            authorize(&state, &no_signature, body).await.unwrap_err(),
            Rejection::BadRequest("Invalid request")
        );

        let mut no_timestamp = signed_headers(body);
        no_timestamp.remove(TIMESTAMP_HEADER);
        assert_eq!(
            authorize(&state, &no_timestamp, body).await.unwrap_err(),
            Rejection::BadRequest("Invalid request")
        );

        assert_eq!(
            authorize(&state, &signed_headers(""), "").await.unwrap_err(),
            Rejection::BadRequest("Invalid request")
        );
        assert!(dispatcher.dispatched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_signature_is_unauthorized_and_never_dispatches() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let state = app_state(dispatcher.clone(), false);
        let body = command_body("server");
        let headers = signed_headers(&command_body("other"));

        let err = authorize(&state, &headers, &body).await.unwrap_err();
        assert_eq!(err, Rejection::Unauthorized);
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);

        let mut garbage = signed_headers(&body);
        garbage.insert(SIGNATURE_HEADER, HeaderValue::from_static("not-hex"));
        assert_eq!(
            authorize(&state, &garbage, &body).await.unwrap_err(),
            Rejection::Unauthorized
        );
        assert!(dispatcher.dispatched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unparseable_verified_body_is_bad_request() {
        let state = app_state(Arc::new(RecordingDispatcher::default()), false);
        let body = "not json";

        let err = authorize(&state, &signed_headers(body), body).await.unwrap_err();
        assert_eq!(err, Rejection::BadRequest("Invalid request"));
    }

    #[tokio::test]
    async fn unknown_command_is_bad_request_without_dispatch() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let state = app_state(dispatcher.clone(), false);
        let body = command_body("weather");

        let err = authorize(&state, &signed_headers(&body), &body)
            .await
            .unwrap_err();
        assert_eq!(err, Rejection::BadRequest("Invalid command"));
        assert!(dispatcher.dispatched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unsupported_interaction_type_is_bad_request() {
        let state = app_state(Arc::new(RecordingDispatcher::default()), false);
        let body = r#"{"type":3,"id":"i","application_id":"a","token":"t"}"#;

        let err = authorize(&state, &signed_headers(body), body).await.unwrap_err();
        assert_eq!(err, Rejection::BadRequest("Unsupported interaction type"));
    }

    #[tokio::test]
    async fn server_command_dispatches_once_and_defers() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let state = app_state(dispatcher.clone(), false);
        let body = command_body("server");

        let response = authorize(&state, &signed_headers(&body), &body)
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({"type": 5})
        );

        let dispatched = dispatcher.dispatched.lock().unwrap();
        assert_eq!(dispatched.len(), 1);
        let message = &dispatched[0];
        assert_eq!(message.kind, "2");
        assert_eq!(message.command, "server");
        assert_eq!(message.subcommand.as_deref(), Some("status"));
        assert_eq!(message.user_id, "42");
        assert_eq!(message.user_name, "alice");
        assert_eq!(message.token, "tok-1");
        assert_eq!(message.channel_id.as_deref(), Some("chan-1"));
        assert_eq!(message.application_id, "app-1");
        assert_eq!(message.interaction_id, "int-1");
        assert_eq!(message.data["name"], "server");
    }

    #[tokio::test]
    async fn server_command_acks_ephemerally_when_configured() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let state = app_state(dispatcher.clone(), true);
        let body = command_body("server");

        let response = authorize(&state, &signed_headers(&body), &body)
            .await
            .unwrap();
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({"type": 4, "data": {"content": "Command sent", "flags": 64}})
        );
        assert_eq!(dispatcher.dispatched.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dispatch_failure_is_internal_error() {
        let dispatcher = Arc::new(RecordingDispatcher {
            dispatched: Mutex::new(vec![]),
            fail: true,
        });
        let state = app_state(dispatcher, false);
        let body = command_body("server");

        let err = authorize(&state, &signed_headers(&body), &body)
            .await
            .unwrap_err();
        assert_eq!(err, Rejection::InternalError);
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message(), "Could not process event");
    }

    #[tokio::test]
    async fn command_without_member_uses_placeholder_identity() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let state = app_state(dispatcher.clone(), false);
        let body = r#"{"type":2,"id":"i","application_id":"a","token":"t","data":{"name":"server"}}"#;

        authorize(&state, &signed_headers(body), body).await.unwrap();

        let dispatched = dispatcher.dispatched.lock().unwrap();
        assert_eq!(dispatched[0].user_id, "noId");
        assert_eq!(dispatched[0].user_name, "noName");
        assert_eq!(dispatched[0].subcommand, None);
    }

    #[tokio::test]
    async fn health_reports_service_name() {
        let payload = health().await.0;
        assert_eq!(payload["ok"], true);
        assert_eq!(payload["service"], "authorize-service");
    }

    #[tokio::test]
    async fn ping_with_odd_fields_still_gets_pong() {
        let dispatcher = Arc::new(RecordingDispatcher::default());
        let state = app_state(dispatcher.clone(), false);

        for body in [
            r#"{"type":1,"id":12345}"#,
            r#"{"type":1,"channel":{"name":"x"}}"#,
            r#"{"type":1,"token":null}"#,
        ] {
            let response = authorize(&state, &signed_headers(body), body)
                .await
                .unwrap();
            assert_eq!(response, InteractionResponse::pong(), "{body}");
        }
        assert!(dispatcher.dispatched.lock().unwrap().is_empty());
    }

    fn post(uri: &str, headers: HeaderMap, body: &str) -> Request<Body> {
        let mut request = Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap();
        *request.headers_mut() = headers;
        request
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn router_answers_signed_ping_with_pong() {
        let app = build_router(app_state(Arc::new(RecordingDispatcher::default()), false));
        let body = r#"{"type":1}"#;

        let response = app
            .oneshot(post("/interactions", signed_headers(body), body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, serde_json::json!({"type": 1}));
    }

    #[tokio::test]
    async fn router_rejects_bad_signature_with_401_body() {
        let app = build_router(app_state(Arc::new(RecordingDispatcher::default()), false));
        let body = command_body("server");

        let response = app
            .oneshot(post("/discord", signed_headers(r#"{"type":1}"#), &body))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({"errorMessage": "invalid signature"})
        );
    }

    #[tokio::test]
    async fn router_rejects_missing_headers_with_400_body() {
        let app = build_router(app_state(Arc::new(RecordingDispatcher::default()), false));

        let response = app
            .oneshot(post("/discord", HeaderMap::new(), r#"{"type":1}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            json_body(response).await,
            serde_json::json!({"errorMessage": "Invalid request"})
        );
    }

    #[test]
    fn internal_error_renders_fixed_message() {
        let response = Rejection::InternalError.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
