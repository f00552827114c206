//! Capability-driven membership of course contributor groups
//!
//! A user belongs to a course's contributor group exactly when they hold
//! the contributor capability in the course context. Single pairs are
//! reconciled inline; changes whose reach cannot be known up front are
//! queued as [`AccessSyncJob`]s and expanded later.

use crate::ensure_directory_ready;
use crate::error::{Result, SkipReason, SyncError};
use crate::metrics::{Mutation, ReconcileMetrics};
use crate::model::*;
use crate::retry::RetryPolicy;
use crate::store::SyncStore;
use o365_sync_core::api::DirectoryClient;
use o365_sync_core::Configuration;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// What the narrow path did for one (course, user) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessOutcome {
    Added,
    Removed,
    Unchanged,
}

pub struct AccessReconciler {
    client: Arc<dyn DirectoryClient>,
    store: Arc<dyn SyncStore>,
    config: Arc<Configuration>,
    retry: RetryPolicy,
}

impl AccessReconciler {
    pub fn new(
        client: Arc<dyn DirectoryClient>,
        store: Arc<dyn SyncStore>,
        config: Arc<Configuration>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            store,
            config,
            retry,
        }
    }

    /// Narrow path: one user in one course
    #[instrument(skip(self))]
    pub async fn reconcile_course(&self, course_id: LocalId, user_id: LocalId) -> Result<AccessOutcome> {
        ensure_directory_ready(&self.config, self.client.as_ref())?;

        let course = self
            .store
            .course(course_id)
            .ok_or_else(|| SkipReason::UnknownLocal(format!("course {}", course_id)))?;
        let group_key = MappingKey::group(ObjectSubtype::CourseSite, course_id);
        let group = self
            .store
            .active_mapping(&group_key)
            .ok_or_else(|| SyncError::no_mapping(group_key.to_string()))?;
        let remote_user = self
            .store
            .remote_user_id(user_id)
            .ok_or_else(|| SyncError::no_mapping(format!("user {}", user_id)))?;

        let allowed = self
            .store
            .has_capability(user_id, course.context_id, &self.config.contributor_capability);
        let present = self
            .client
            .list_group_members(&group.remote_id)
            .await?
            .iter()
            .any(|id| *id == remote_user);

        let outcome = match (allowed, present) {
            (true, false) => {
                self.retry
                    .run("add_contributor", || {
                        self.client.add_group_member(&group.remote_id, &remote_user)
                    })
                    .await?;
                AccessOutcome::Added
            }
            (false, true) => {
                self.retry
                    .run("remove_contributor", || {
                        self.client.remove_group_member(&group.remote_id, &remote_user)
                    })
                    .await?;
                AccessOutcome::Removed
            }
            _ => AccessOutcome::Unchanged,
        };

        debug!(allowed, present, ?outcome, "Contributor access reconciled");
        Ok(outcome)
    }

    /// Broad path: expand a wildcard change into (course, user) pairs
    ///
    /// A `None` context means every course; a `None` user means every user
    /// with a remote identity.
    #[instrument(skip(self))]
    pub async fn reconcile_broad(
        &self,
        role_id: Option<LocalId>,
        user_id: Option<LocalId>,
        context_id: Option<LocalId>,
    ) -> Result<ReconcileMetrics> {
        ensure_directory_ready(&self.config, self.client.as_ref())?;

        let courses = match context_id {
            Some(context_id) => self.store.courses_under_context(context_id),
            None => self.store.courses(),
        };
        let users: Vec<LocalId> = match user_id {
            Some(user_id) => vec![user_id],
            None => self
                .store
                .mappings_of_type(ObjectType::User, None)
                .into_iter()
                .map(|m| m.local_id)
                .collect(),
        };
        info!(
            courses = courses.len(),
            users = users.len(),
            "Expanding access change"
        );

        let mut metrics = ReconcileMetrics::new("access_sync");
        for course in &courses {
            if self
                .store
                .active_mapping(&MappingKey::group(ObjectSubtype::CourseSite, course.id))
                .is_none()
            {
                metrics.record_skip();
                continue;
            }
            for user in &users {
                metrics.record_processed();
                match self.reconcile_course(course.id, *user).await {
                    Ok(AccessOutcome::Added) => metrics.record_mutation(Mutation::MemberAdded),
                    Ok(AccessOutcome::Removed) => metrics.record_mutation(Mutation::MemberRemoved),
                    Ok(AccessOutcome::Unchanged) => {}
                    Err(SyncError::Skipped(_)) => metrics.record_skip(),
                    Err(e) => metrics.record_error(
                        "reconcile_course",
                        format!("course {} user {}: {}", course.id, user, e),
                    ),
                }
            }
        }

        metrics.complete();
        Ok(metrics)
    }

    /// Queue a broad change for the deferred task
    pub fn queue_broad(
        &self,
        role_id: Option<LocalId>,
        user_id: Option<LocalId>,
        context_id: Option<LocalId>,
    ) -> AccessSyncJob {
        let job = AccessSyncJob::new(role_id, user_id, context_id);
        info!(job_id = %job.id, ?role_id, ?user_id, ?context_id, "Queued access sync job");
        self.store.push_access_job(job.clone());
        job
    }

    /// Run one queued job and drop it from the queue once it completed
    pub async fn run_job(&self, job: &AccessSyncJob) -> Result<ReconcileMetrics> {
        let metrics = self
            .reconcile_broad(job.role_id, job.user_id, job.context_id)
            .await?;
        self.store.complete_access_job(job.id);
        Ok(metrics)
    }

    /// Run every pending job; a failing job stays queued and aborts the drain
    pub async fn drain_queue(&self) -> Result<ReconcileMetrics> {
        let mut summary = ReconcileMetrics::new("access_sync_queue");
        for job in self.store.pending_access_jobs() {
            let metrics = self.run_job(&job).await?;
            summary.merge(&metrics);
        }
        summary.complete();
        Ok(summary)
    }
}
