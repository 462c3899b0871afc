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
use aws_sdk_ec2::Client as Ec2Client;
use ensh_common::{
    ConfigError, env_lookup, instrumented, optional_var, runtime::run_event_function,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const DRY_RUN_PASSED: &str = "DryRunOperation";
const UNKNOWN_STATE: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum PowerState {
    Running,
    Stopped,
}

impl PowerState {
    fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartStopEvent {
    instance_id: String,
    desired_state: PowerState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct PowerOutcome {
    instance_id: String,
    previous_state: String,
    desired_state: PowerState,
    changed: bool,
}

#[derive(Debug, Clone, Default)]
struct PowerConfig {
    allowed_instance_id: Option<String>,
}

impl PowerConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            allowed_instance_id: optional_var(&lookup, "ALLOWED_INSTANCE_ID"),
        })
    }
}

#[async_trait]
trait InstanceControl: Send + Sync {
    /// `None` when no instance matches.
    async fn current_state(&self, instance_id: &str) -> anyhow::Result<Option<String>>;
    /// Succeeds when the caller would be allowed to make the change.
    async fn dry_run(&self, instance_id: &str, desired: PowerState) -> anyhow::Result<()>;
    async fn change(&self, instance_id: &str, desired: PowerState) -> anyhow::Result<()>;
}

/// EC2 reports a permitted dry run as an error with this code.
fn dry_run_passed(code: Option<&str>) -> bool {
    code == Some(DRY_RUN_PASSED)
}

#[derive(Clone)]
struct Ec2InstanceControl {
    client: Ec2Client,
}

#[async_trait]
impl InstanceControl for Ec2InstanceControl {
    async fn current_state(&self, instance_id: &str) -> anyhow::Result<Option<String>> {
        let output = self
            .client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .context("failed to describe EC2 instance")?;

        Ok(output
            .reservations()
            .first()
            .and_then(|reservation| reservation.instances().first())
            .map(|instance| {
                instance
                    .state()
                    .and_then(|state| state.name())
                    .map(|name| name.as_str().to_string())
                    .unwrap_or_else(|| UNKNOWN_STATE.to_string())
            }))
    }

    async fn dry_run(&self, instance_id: &str, desired: PowerState) -> anyhow::Result<()> {
        let (code, error) = match desired {
            PowerState::Running => match self
                .client
                .start_instances()
                .dry_run(true)
                .instance_ids(instance_id)
                .send()
                .await
            {
                Ok(_) => return Ok(()),
                Err(error) => {
                    let code = error
                        .as_service_error()
                        .and_then(|service| service.meta().code())
                        .map(str::to_string);
                    (code, anyhow::Error::new(error))
                }
            },
            PowerState::Stopped => match self
                .client
                .stop_instances()
                .dry_run(true)
                .instance_ids(instance_id)
                .send()
                .await
            {
                Ok(_) => return Ok(()),
                Err(error) => {
                    let code = error
                        .as_service_error()
                        .and_then(|service| service.meta().code())
                        .map(str::to_string);
                    (code, anyhow::Error::new(error))
                }
            },
        };

        if dry_run_passed(code.as_deref()) {
            Ok(())
        } else {
            Err(error)
        }
    }

    async fn change(&self, instance_id: &str, desired: PowerState) -> anyhow::Result<()> {
        match desired {
            PowerState::Running => {
                self.client
                    .start_instances()
                    .instance_ids(instance_id)
                    .send()
                    .await
                    .context("could not start EC2")?;
            }
            PowerState::Stopped => {
                self.client
                    .stop_instances()
                    .instance_ids(instance_id)
                    .send()
                    .await
                    .context("could not stop EC2")?;
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
struct AppState {
    config: Arc<PowerConfig>,
    control: Arc<dyn InstanceControl>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "power_service=debug,tower_http=info".to_string()),
        )
        .init();

    let config = PowerConfig::from_env()?;
    let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
    let state = AppState {
        config: Arc::new(config),
        control: Arc::new(Ec2InstanceControl {
            client: Ec2Client::new(&sdk_config),
        }),
    };

    run_event_function(
        "power-service",
        "POWER_SERVICE_BIND",
        "0.0.0.0:8084",
        move |event: StartStopEvent| {
            let state = state.clone();
            async move { instrumented("apply_power_state", apply_power_state(&state, &event)).await }
        },
    )
    .await
}

async fn apply_power_state(state: &AppState, event: &StartStopEvent) -> anyhow::Result<PowerOutcome> {
    let instance_id = event.instance_id.trim();
    if instance_id.is_empty() {
        anyhow::bail!("instanceId is required");
    }
    if let Some(allowed) = state.config.allowed_instance_id.as_deref()
        && allowed != instance_id
    {
        anyhow::bail!("instance {instance_id} is not managed by this function");
    }

    let outcome = |previous_state: &str, changed: bool| PowerOutcome {
        instance_id: instance_id.to_string(),
        previous_state: previous_state.to_string(),
        desired_state: event.desired_state,
        changed,
    };

    let Some(current) = state.control.current_state(instance_id).await? else {
        warn!(instance_id = %instance_id, "instance not found");
        return Ok(outcome(UNKNOWN_STATE, false));
    };
    if current == event.desired_state.as_str() {
        info!(instance_id = %instance_id, state = %current, "instance already in desired state");
        return Ok(outcome(&current, false));
    }

    state
        .control
        .dry_run(instance_id, event.desired_state)
        .await
        .context("could not change state of EC2 during dry run")?;
    state
        .control
        .change(instance_id, event.desired_state)
        .await?;

    info!(
        instance_id = %instance_id,
        from = %current,
        to = event.desired_state.as_str(),
        "instance state change requested"
    );
    Ok(outcome(&current, true))
}
