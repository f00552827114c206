//! Reactions to changes on the local platform
//!
//! Cheap, well-scoped changes are reconciled inline. Anything that needs
//! several remote round trips goes to the task queue.

use crate::error::{Result, SyncError};
use crate::model::*;
use crate::tasks::{
    CalendarSyncData, GroupMembershipData, TaskRequest, TaskSink, ACCESS_SYNC, CALENDAR_SYNC,
    GROUP_MEMBERSHIP,
};
use crate::SyncService;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostEventKind {
    GroupCreated,
    GroupMemberAdded,
    GroupMemberRemoved,
    RoleAssigned,
    RoleUnassigned,
    RoleDeleted,
    CapabilityChanged,
    CourseCreated,
    CourseDeleted,
    CourseReset,
    UserEnrolled,
    UserUnenrolled,
    CalendarEventCreated,
    CalendarEventUpdated,
    CalendarEventDeleted,
    CalendarSubscriptionChanged,
}

/// A change notification with the ids it concerns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEvent {
    pub kind: HostEventKind,
    #[serde(default)]
    pub user_id: Option<LocalId>,
    #[serde(default)]
    pub course_id: Option<LocalId>,
    #[serde(default)]
    pub context_id: Option<LocalId>,
    #[serde(default)]
    pub role_id: Option<LocalId>,
    #[serde(default)]
    pub group_id: Option<LocalId>,
    #[serde(default)]
    pub event_id: Option<LocalId>,
    #[serde(default)]
    pub scope_type: Option<ScopeType>,
    #[serde(default)]
    pub scope_id: Option<LocalId>,
}

impl HostEvent {
    pub fn new(kind: HostEventKind) -> Self {
        Self {
            kind,
            user_id: None,
            course_id: None,
            context_id: None,
            role_id: None,
            group_id: None,
            event_id: None,
            scope_type: None,
            scope_id: None,
        }
    }

    pub fn user(mut self, id: LocalId) -> Self {
        self.user_id = Some(id);
        self
    }

    pub fn course(mut self, id: LocalId) -> Self {
        self.course_id = Some(id);
        self
    }

    pub fn context(mut self, id: LocalId) -> Self {
        self.context_id = Some(id);
        self
    }

    pub fn role(mut self, id: LocalId) -> Self {
        self.role_id = Some(id);
        self
    }

    pub fn group(mut self, id: LocalId) -> Self {
        self.group_id = Some(id);
        self
    }

    pub fn event(mut self, id: LocalId) -> Self {
        self.event_id = Some(id);
        self
    }

    pub fn scope(mut self, scope_type: ScopeType, scope_id: LocalId) -> Self {
        self.scope_type = Some(scope_type);
        self.scope_id = Some(scope_id);
        self
    }

    fn require(&self, field: &str, value: Option<LocalId>) -> Result<LocalId> {
        value.ok_or_else(|| {
            SyncError::invalid_task_data(format!("{:?}", self.kind), format!("missing {}", field))
        })
    }
}

pub struct HostEventHandlers {
    service: Arc<SyncService>,
    sink: Arc<dyn TaskSink>,
}

impl HostEventHandlers {
    pub fn new(service: Arc<SyncService>, sink: Arc<dyn TaskSink>) -> Self {
        Self { service, sink }
    }

    /// Handle one event; false when it failed, which is logged
    #[instrument(skip(self, event), fields(kind = ?event.kind))]
    pub async fn handle(&self, event: &HostEvent) -> bool {
        match self.dispatch(event).await {
            Ok(()) => true,
            Err(SyncError::Skipped(reason)) => {
                info!("Nothing to do: {}", reason);
                true
            }
            Err(e) => {
                error!("Handling {:?} failed: {}", event.kind, e);
                false
            }
        }
    }

    async fn dispatch(&self, event: &HostEvent) -> Result<()> {
        use HostEventKind::*;

        match event.kind {
            GroupCreated => {
                let group_id = event.require("group_id", event.group_id)?;
                self.enqueue_group(ObjectSubtype::UserGroup, group_id, true)
            }
            GroupMemberAdded | GroupMemberRemoved => {
                let group_id = event.require("group_id", event.group_id)?;
                self.enqueue_group(ObjectSubtype::UserGroup, group_id, false)
            }
            UserEnrolled | UserUnenrolled => {
                let course_id = event.require("course_id", event.course_id)?;
                self.enqueue_group(ObjectSubtype::Course, course_id, false)?;
                // A team waiting for its first owner is created on enrolment
                self.enqueue_group(ObjectSubtype::CourseTeam, course_id, event.kind == UserEnrolled)
            }
            CourseCreated => {
                let course_id = event.require("course_id", event.course_id)?;
                for subtype in ObjectSubtype::COURSE_LEVEL {
                    self.enqueue_group(subtype, course_id, true)?;
                }
                Ok(())
            }
            CourseDeleted => {
                let course_id = event.require("course_id", event.course_id)?;
                self.course_deleted(course_id).await
            }
            CourseReset => {
                let course_id = event.require("course_id", event.course_id)?;
                self.service.groups.handle_course_reset(course_id).await?;
                Ok(())
            }
            RoleAssigned | RoleUnassigned => self.role_changed(event).await,
            RoleDeleted => {
                self.enqueue_access(event.role_id, None, None);
                Ok(())
            }
            CapabilityChanged => {
                self.enqueue_access(event.role_id, None, event.context_id);
                Ok(())
            }
            CalendarEventCreated | CalendarEventUpdated => {
                let (scope_type, scope_id) = match (event.scope_type, event.scope_id) {
                    (Some(scope_type), Some(scope_id)) => (scope_type, scope_id),
                    _ => {
                        let event_id = event.require("event_id", event.event_id)?;
                        let local = self.service.store.event(event_id).ok_or_else(|| {
                            crate::error::SkipReason::UnknownLocal(format!("event {}", event_id))
                        })?;
                        (local.scope_type, local.scope_id)
                    }
                };
                self.enqueue_calendar(scope_type, scope_id)
            }
            CalendarEventDeleted => {
                let event_id = event.require("event_id", event.event_id)?;
                self.service.outbound.event_deleted(event_id).await?;
                Ok(())
            }
            CalendarSubscriptionChanged => {
                let scope_type = event.scope_type.ok_or_else(|| {
                    SyncError::invalid_task_data("CalendarSubscriptionChanged", "missing scope_type")
                })?;
                let scope_id = event.require("scope_id", event.scope_id)?;
                self.enqueue_calendar(scope_type, scope_id)
            }
        }
    }

    /// Course-level role changes are resolved inline; anything wider is queued
    async fn role_changed(&self, event: &HostEvent) -> Result<()> {
        let course = event
            .context_id
            .and_then(|context_id| self.service.store.course_for_context(context_id));

        match (course, event.user_id) {
            (Some(course), Some(user_id)) => {
                let outcome = self.service.access.reconcile_course(course.id, user_id).await;
                match outcome {
                    Ok(outcome) => debug!(?outcome, "Contributor access updated"),
                    Err(SyncError::Skipped(reason)) => info!("Contributor access unchanged: {}", reason),
                    Err(e) => return Err(e),
                }
                // Owner status follows roles too; a first owner unblocks the team
                self.enqueue_group(ObjectSubtype::Course, course.id, false)?;
                self.enqueue_group(ObjectSubtype::CourseTeam, course.id, true)
            }
            _ => {
                self.enqueue_access(event.role_id, event.user_id, event.context_id);
                Ok(())
            }
        }
    }

    async fn course_deleted(&self, course_id: LocalId) -> Result<()> {
        let keys = ObjectSubtype::COURSE_LEVEL
            .iter()
            .map(|subtype| MappingKey::group(*subtype, course_id));

        for key in keys {
            if self.service.store.active_mapping(&key).is_none() {
                continue;
            }
            self.service.groups.delete_group(key).await?;
        }
        Ok(())
    }

    fn enqueue_group(&self, subtype: ObjectSubtype, local_id: LocalId, create: bool) -> Result<()> {
        let data = GroupMembershipData {
            subtype,
            local_id,
            create,
        };
        self.sink
            .enqueue(TaskRequest::new(GROUP_MEMBERSHIP, serde_json::to_value(data)?));
        Ok(())
    }

    fn enqueue_calendar(&self, scope_type: ScopeType, scope_id: LocalId) -> Result<()> {
        let data = CalendarSyncData {
            scope_type,
            scope_id,
            queued_at: Some(Utc::now()),
        };
        self.sink
            .enqueue(TaskRequest::new(CALENDAR_SYNC, serde_json::to_value(data)?));
        Ok(())
    }

    /// The job is persisted first so a lost request still gets drained
    fn enqueue_access(&self, role_id: Option<LocalId>, user_id: Option<LocalId>, context_id: Option<LocalId>) {
        let job = self.service.access.queue_broad(role_id, user_id, context_id);
        match serde_json::to_value(&job) {
            Ok(data) => self.sink.enqueue(TaskRequest::new(ACCESS_SYNC, data)),
            Err(e) => error!(job_id = %job.id, "Could not encode access job: {}", e),
        }
    }
}
