//! Named units of work run by the dispatcher
//!
//! Every task takes a JSON payload and either completes, returns a
//! [`ReconcileMetrics`] summary, or fails so the dispatcher can re-queue it.
//! Scheduled tasks ignore their payload and work from persisted cursors.

use crate::error::{Result, SyncError};
use crate::metrics::ReconcileMetrics;
use crate::model::*;
use crate::SyncService;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use o365_sync_core::api::PullMode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

pub const GROUP_MEMBERSHIP: &str = "group_membership";
pub const GROUP_PROVISION: &str = "group_provision";
pub const CALENDAR_SYNC: &str = "calendar_sync";
pub const ACCESS_SYNC: &str = "access_sync";
pub const USER_SYNC_FULL: &str = "user_sync_full";
pub const USER_SYNC_DELTA: &str = "user_sync_delta";
pub const CALENDAR_IMPORT: &str = "calendar_import";

/// A task invocation waiting for the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task: String,
    #[serde(default)]
    pub data: Value,
}

impl TaskRequest {
    pub fn new(task: impl Into<String>, data: Value) -> Self {
        Self {
            task: task.into(),
            data,
        }
    }

    /// Requests with the same identity never run concurrently
    pub fn identity(&self) -> String {
        if self.data.is_null() {
            self.task.clone()
        } else {
            format!("{}:{}", self.task, self.data)
        }
    }
}

/// Where host event handlers put deferred work
pub trait TaskSink: Send + Sync {
    fn enqueue(&self, request: TaskRequest);
}

#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(&self, data: Value) -> Result<ReconcileMetrics>;
}

/// Payload of `group_membership`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembershipData {
    pub subtype: ObjectSubtype,
    pub local_id: LocalId,
    /// Create the remote group first when it does not exist yet
    #[serde(default)]
    pub create: bool,
}

/// Payload of `calendar_sync`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarSyncData {
    pub scope_type: ScopeType,
    pub scope_id: LocalId,
    #[serde(default)]
    pub queued_at: Option<DateTime<Utc>>,
}

fn parse<T: serde::de::DeserializeOwned>(task: &str, data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| SyncError::invalid_task_data(task, e.to_string()))
}

fn is_empty(data: &Value) -> bool {
    match data {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

struct GroupMembershipTask(Arc<SyncService>);

#[async_trait]
impl Task for GroupMembershipTask {
    fn name(&self) -> &'static str {
        GROUP_MEMBERSHIP
    }

    async fn execute(&self, data: Value) -> Result<ReconcileMetrics> {
        if is_empty(&data) {
            return self.0.groups.reconcile_all().await;
        }
        let data: GroupMembershipData = parse(GROUP_MEMBERSHIP, data)?;
        if data.create {
            self.0
                .groups
                .ensure_group(MappingKey::group(data.subtype, data.local_id), None)
                .await?;
        }
        let outcome = self.0.groups.reconcile(data.subtype, data.local_id).await?;
        Ok(outcome.metrics)
    }
}

struct GroupProvisionTask(Arc<SyncService>);

#[async_trait]
impl Task for GroupProvisionTask {
    fn name(&self) -> &'static str {
        GROUP_PROVISION
    }

    async fn execute(&self, _data: Value) -> Result<ReconcileMetrics> {
        self.0.groups.provision_missing().await
    }
}

struct CalendarSyncTask(Arc<SyncService>);

#[async_trait]
impl Task for CalendarSyncTask {
    fn name(&self) -> &'static str {
        CALENDAR_SYNC
    }

    async fn execute(&self, data: Value) -> Result<ReconcileMetrics> {
        let data: CalendarSyncData = parse(CALENDAR_SYNC, data)?;
        self.0
            .outbound
            .run_scope(data.scope_type, data.scope_id, data.queued_at)
            .await
    }
}

struct AccessSyncTask(Arc<SyncService>);

#[async_trait]
impl Task for AccessSyncTask {
    fn name(&self) -> &'static str {
        ACCESS_SYNC
    }

    async fn execute(&self, data: Value) -> Result<ReconcileMetrics> {
        if is_empty(&data) {
            return self.0.access.drain_queue().await;
        }
        let job: AccessSyncJob = parse(ACCESS_SYNC, data)?;
        self.0.access.run_job(&job).await
    }
}

struct UserSyncTask {
    service: Arc<SyncService>,
    mode: PullMode,
}

#[async_trait]
impl Task for UserSyncTask {
    fn name(&self) -> &'static str {
        match self.mode {
            PullMode::Full => USER_SYNC_FULL,
            PullMode::Delta => USER_SYNC_DELTA,
        }
    }

    async fn execute(&self, _data: Value) -> Result<ReconcileMetrics> {
        let summary = self.service.users.run(self.mode).await?;
        Ok(summary.metrics)
    }
}

struct CalendarImportTask(Arc<SyncService>);

#[async_trait]
impl Task for CalendarImportTask {
    fn name(&self) -> &'static str {
        CALENDAR_IMPORT
    }

    async fn execute(&self, _data: Value) -> Result<ReconcileMetrics> {
        self.0.inbound.run().await
    }
}

/// Lookup table from task name to implementation
#[derive(Default)]
pub struct TaskRegistry {
    tasks: BTreeMap<&'static str, Arc<dyn Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in task bound to `service`
    pub fn with_defaults(service: Arc<SyncService>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(GroupMembershipTask(service.clone())));
        registry.register(Arc::new(GroupProvisionTask(service.clone())));
        registry.register(Arc::new(CalendarSyncTask(service.clone())));
        registry.register(Arc::new(AccessSyncTask(service.clone())));
        registry.register(Arc::new(UserSyncTask {
            service: service.clone(),
            mode: PullMode::Full,
        }));
        registry.register(Arc::new(UserSyncTask {
            service: service.clone(),
            mode: PullMode::Delta,
        }));
        registry.register(Arc::new(CalendarImportTask(service)));
        registry
    }

    pub fn register(&mut self, task: Arc<dyn Task>) {
        self.tasks.insert(task.name(), task);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Task>> {
        self.tasks.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.tasks.keys().copied().collect()
    }

    /// Run a task; a skipped run is logged and reported as success
    pub async fn execute(&self, name: &str, data: Value) -> Result<ReconcileMetrics> {
        let task = self
            .get(name)
            .ok_or_else(|| SyncError::UnknownTask(name.to_string()))?;

        debug!(task = name, "Executing task");
        match task.execute(data).await {
            Err(SyncError::Skipped(reason)) => {
                info!(task = name, "Nothing to do: {}", reason);
                let mut metrics = ReconcileMetrics::new(name);
                metrics.record_skip();
                metrics.complete();
                Ok(metrics)
            }
            other => other,
        }
    }
}
