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
use aws_sdk_ecs::Client as EcsClient;
use aws_sdk_route53::{
    Client as Route53Client,
    types::{Change, ChangeAction, ChangeBatch, ResourceRecord, ResourceRecordSet, RrType},
};
use ensh_common::{
    ConfigError, DNS_RECORD_TTL, EventEnvelope, env_lookup, instrumented, required_var,
    runtime::run_event_function,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

const ELASTIC_ATTACHMENT_TYPE: &str = "ElasticNetworkInterface";
const INTERFACE_ID_DETAIL: &str = "networkInterfaceId";

#[derive(Clone)]
struct AppState {
    config: Arc<UpdaterConfig>,
    directory: Arc<dyn NetworkDirectory>,
    writer: Arc<dyn RecordWriter>,
}

#[derive(Debug, Clone)]
struct UpdaterConfig {
    cluster_name: String,
    record_name: String,
    zone_id: String,
}

impl UpdaterConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(env_lookup)
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        Ok(Self {
            cluster_name: required_var(&lookup, "CLUSTER_NAME")?,
            record_name: required_var(&lookup, "RECORD_NAME")?,
            zone_id: required_var(&lookup, "ZONE_ID")?,
        })
    }
}

/// `detail` of an "ECS Task State Change" event.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskStateDetail {
    #[serde(default)]
    task_arn: String,
    #[serde(default)]
    last_status: Option<String>,
}

type LifecycleEvent = EventEnvelope<TaskStateDetail>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TaskRecord {
    attachments: Vec<AttachmentRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AttachmentRecord {
    kind: String,
    details: Vec<(String, String)>,
}

/// First elastic network interface attached to the task.
fn elastic_interface_id(task: &TaskRecord) -> Option<&str> {
    task.attachments
        .iter()
        .find(|attachment| attachment.kind == ELASTIC_ATTACHMENT_TYPE)?
        .details
        .iter()
        .find(|(name, _)| name == INTERFACE_ID_DETAIL)
        .map(|(_, value)| value.as_str())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum ChangeKind {
    Upsert,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
struct DnsRecordChange {
    zone_id: String,
    name: String,
    record_type: &'static str,
    ttl: i64,
    value: String,
    action: ChangeKind,
}

impl DnsRecordChange {
    fn upsert_a(config: &UpdaterConfig, address: String) -> Self {
        Self {
            zone_id: config.zone_id.clone(),
            name: config.record_name.clone(),
            record_type: "A",
            ttl: DNS_RECORD_TTL,
            value: address,
            action: ChangeKind::Upsert,
        }
    }
}

#[async_trait]
trait NetworkDirectory: Send + Sync {
    async fn find_tasks(&self, cluster: &str, task_id: &str) -> anyhow::Result<Vec<TaskRecord>>;
    async fn public_address(&self, interface_id: &str) -> anyhow::Result<Option<String>>;
}

#[async_trait]
trait RecordWriter: Send + Sync {
    async fn upsert(&self, change: &DnsRecordChange) -> anyhow::Result<()>;
}

#[derive(Clone)]
struct AwsNetworkDirectory {
    ecs: EcsClient,
    ec2: Ec2Client,
}

#[async_trait]
impl NetworkDirectory for AwsNetworkDirectory {
    async fn find_tasks(&self, cluster: &str, task_id: &str) -> anyhow::Result<Vec<TaskRecord>> {
        let output = self
            .ecs
            .describe_tasks()
            .cluster(cluster)
            .tasks(task_id)
            .send()
            .await
            .context("failed to describe ECS task")?;

        Ok(output
            .tasks()
            .iter()
            .map(|task| TaskRecord {
                attachments: task
                    .attachments()
                    .iter()
                    .map(|attachment| AttachmentRecord {
                        kind: attachment.r#type().unwrap_or_default().to_string(),
                        details: attachment
                            .details()
                            .iter()
                            .filter_map(|detail| {
                                Some((detail.name()?.to_string(), detail.value()?.to_string()))
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn public_address(&self, interface_id: &str) -> anyhow::Result<Option<String>> {
        let output = self
            .ec2
            .describe_network_interfaces()
            .network_interface_ids(interface_id)
            .send()
            .await
            .context("failed to describe network interface")?;

        Ok(output
            .network_interfaces()
            .first()
            .and_then(|interface| interface.association())
            .and_then(|association| association.public_ip())
            .map(str::to_string))
    }
}

#[derive(Clone)]
struct Route53RecordWriter {
    client: Route53Client,
}

#[async_trait]
impl RecordWriter for Route53RecordWriter {
    async fn upsert(&self, change: &DnsRecordChange) -> anyhow::Result<()> {
        let record = ResourceRecord::builder()
            .value(&change.value)
            .build()
            .context("invalid resource record")?;
        let record_set = ResourceRecordSet::builder()
            .name(&change.name)
            .r#type(RrType::A)
            .ttl(change.ttl)
            .resource_records(record)
            .build()
            .context("invalid resource record set")?;
        let batch = ChangeBatch::builder()
            .changes(
                Change::builder()
                    .action(ChangeAction::Upsert)
                    .resource_record_set(record_set)
                    .build()
                    .context("invalid record change")?,
            )
            .build()
            .context("invalid change batch")?;

        self.client
            .change_resource_record_sets()
            .hosted_zone_id(&change.zone_id)
            .change_batch(batch)
            .send()
            .await
            .context("failed to upsert DNS record")?;
        Ok(())
    }
}

impl AppState {
    async fn from_config(config: UpdaterConfig) -> Self {
        let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self {
            config: Arc::new(config),
            directory: Arc::new(AwsNetworkDirectory {
                ecs: EcsClient::new(&sdk_config),
                ec2: Ec2Client::new(&sdk_config),
            }),
            writer: Arc::new(Route53RecordWriter {
                client: Route53Client::new(&sdk_config),
            }),
        }
    }
}

/// Why a lifecycle event left the record untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "gap", rename_all = "snake_case")]
enum ResolutionGap {
    MissingTaskId,
    TaskNotFound { matches: usize },
    NoAttachments,
    NoElasticInterface,
    NoPublicAddress,
    LookupFailed { step: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum ReconcileOutcome {
    Updated { record_name: String, address: String },
    Skipped(ResolutionGap),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "updater_service=debug,tower_http=info".to_string()),
        )
        .init();

    let config = UpdaterConfig::from_env()?;
    info!(
        cluster = %config.cluster_name,
        record_name = %config.record_name,
        "updater-service configured"
    );
    let state = AppState::from_config(config).await;

    run_event_function(
        "updater-service",
        "UPDATER_SERVICE_BIND",
        "0.0.0.0:8081",
        move |event: LifecycleEvent| {
            let state = state.clone();
            async move { instrumented("reconcile", reconcile(&state, &event)).await }
        },
    )
    .await
}

/// Points the configured record at the task's current public address.
/// Resolution gaps are logged and absorbed; a failed DNS write is returned so
/// the trigger can redeliver.
async fn reconcile(state: &AppState, event: &LifecycleEvent) -> anyhow::Result<ReconcileOutcome> {
    let task_id = event.detail.task_arn.as_str();
    let address = match resolve_public_address(state, task_id).await {
        Ok(address) => address,
        Err(gap) => {
            warn!(
                task_id = %task_id,
                last_status = ?event.detail.last_status,
                gap = ?gap,
                "public address not resolved; DNS record left unchanged"
            );
            return Ok(ReconcileOutcome::Skipped(gap));
        }
    };

    let change = DnsRecordChange::upsert_a(&state.config, address);
    state
        .writer
        .upsert(&change)
        .await
        .with_context(|| format!("DNS upsert for {} failed", change.name))?;

    info!(
        task_id = %task_id,
        record_name = %change.name,
        address = %change.value,
        ttl = change.ttl,
        "DNS record upserted"
    );
    Ok(ReconcileOutcome::Updated {
        record_name: change.name,
        address: change.value,
    })
}

async fn resolve_public_address(state: &AppState, task_id: &str) -> Result<String, ResolutionGap> {
    if task_id.trim().is_empty() {
        return Err(ResolutionGap::MissingTaskId);
    }

    let tasks = state
        .directory
        .find_tasks(&state.config.cluster_name, task_id)
        .await
        .map_err(|error| ResolutionGap::LookupFailed {
            step: "describe_tasks",
            reason: format!("{error:#}"),
        })?;
    let [task] = tasks.as_slice() else {
        return Err(ResolutionGap::TaskNotFound {
            matches: tasks.len(),
        });
    };
    if task.attachments.is_empty() {
        return Err(ResolutionGap::NoAttachments);
    }
    let interface_id = elastic_interface_id(task).ok_or(ResolutionGap::NoElasticInterface)?;

    state
        .directory
        .public_address(interface_id)
        .await
        .map_err(|error| ResolutionGap::LookupFailed {
            step: "describe_network_interfaces",
            reason: format!("{error:#}"),
        })?
        .ok_or(ResolutionGap::NoPublicAddress)
}
