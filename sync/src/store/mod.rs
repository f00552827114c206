//! Persistence seams of the engine
//!
//! The reconcilers only see these traits. [`MemoryStore`] implements all of
//! them over an in-memory snapshot that can be saved to and loaded from a
//! JSON file; a relational backend would implement the same traits.

mod memory;

pub use memory::{LocalSnapshot, MemoryStore, StoreSnapshot, SyncTables};

use crate::error::Result;
use crate::model::*;
use o365_sync_core::CourseResetAction;

/// Local id ⟷ remote object id links
pub trait MappingStore: Send + Sync {
    /// The active mapping for a key, if any
    fn active_mapping(&self, key: &MappingKey) -> Option<ObjectMapping>;

    /// The most recently modified soft-deleted mapping for a key, if any
    fn soft_deleted_mapping(&self, key: &MappingKey) -> Option<ObjectMapping>;

    /// Insert or replace the mapping identified by its key and remote id
    ///
    /// Fails when it would leave two active mappings for one key.
    fn upsert_mapping(&self, mapping: ObjectMapping) -> Result<()>;

    /// Hard-delete the mapping identified by its key and remote id
    fn remove_mapping(&self, key: &MappingKey, remote_id: &str) -> bool;

    /// Active mappings of one type (and subtype, when given)
    fn mappings_of_type(&self, object_type: ObjectType, subtype: Option<ObjectSubtype>) -> Vec<ObjectMapping>;

    fn remote_user_id(&self, user_id: LocalId) -> Option<String> {
        self.active_mapping(&MappingKey::user(user_id))
            .map(|m| m.remote_id)
    }

    fn local_user_for_remote(&self, remote_id: &str) -> Option<LocalId> {
        self.mappings_of_type(ObjectType::User, None)
            .into_iter()
            .find(|m| m.remote_id == remote_id)
            .map(|m| m.local_id)
    }
}

/// Event links and calendar subscriptions
pub trait CalendarStore: Send + Sync {
    fn event_mapping(&self, local_event_id: LocalId) -> Option<CalendarEventMapping>;
    fn event_mapping_for_remote(&self, remote_event_id: &str) -> Option<CalendarEventMapping>;
    /// Record a one-to-one link; fails if either side is already linked elsewhere
    fn record_event_mapping(&self, mapping: CalendarEventMapping) -> Result<()>;
    fn remove_event_mapping(&self, local_event_id: LocalId) -> Option<CalendarEventMapping>;

    fn subscriptions(&self) -> Vec<CalendarSubscription>;
    fn upsert_subscription(&self, subscription: CalendarSubscription);
    fn remove_subscription(&self, user_id: LocalId, scope_type: ScopeType, scope_id: LocalId) -> bool;

    fn subscriptions_for_scope(&self, scope_type: ScopeType, scope_id: LocalId) -> Vec<CalendarSubscription> {
        self.subscriptions()
            .into_iter()
            .filter(|s| s.scope_type == scope_type && s.scope_id == scope_id)
            .collect()
    }
}

/// Resumable pagination and run-window positions
pub trait CursorStore: Send + Sync {
    fn cursor(&self, key: &CursorKey) -> SyncCursor;
    fn put_cursor(&self, key: CursorKey, cursor: SyncCursor);
}

/// Deferred capability reconciliation units
pub trait JobQueue: Send + Sync {
    fn push_access_job(&self, job: AccessSyncJob);
    fn pending_access_jobs(&self) -> Vec<AccessSyncJob>;
    /// Remove a job once it has run to completion
    fn complete_access_job(&self, id: uuid::Uuid) -> bool;
}

/// Read side of the local platform, plus event creation for the importer
pub trait LocalState: Send + Sync {
    fn user(&self, id: LocalId) -> Option<LocalUser>;
    fn users(&self) -> Vec<LocalUser>;
    fn course(&self, id: LocalId) -> Option<Course>;
    fn courses(&self) -> Vec<Course>;
    /// Courses whose context is `context_id` or lies below it
    fn courses_under_context(&self, context_id: LocalId) -> Vec<Course>;
    fn course_for_context(&self, context_id: LocalId) -> Option<Course>;
    /// Active, non-suspended enrolments
    fn enrolled_users(&self, course_id: LocalId) -> Vec<LocalId>;
    fn local_group(&self, id: LocalId) -> Option<LocalGroup>;
    fn course_groups(&self, course_id: LocalId) -> Vec<LocalGroup>;
    /// Capability held through a role assigned at the context or any ancestor
    fn has_capability(&self, user_id: LocalId, context_id: LocalId, capability: &str) -> bool;
    fn users_with_capability(&self, context_id: LocalId, capability: &str) -> Vec<LocalId>;
    fn event(&self, id: LocalId) -> Option<LocalEvent>;
    fn events_in_scope(&self, scope_type: ScopeType, scope_id: LocalId) -> Vec<LocalEvent>;
    fn create_local_event(&self, event: NewLocalEvent) -> Result<LocalEvent>;

    fn course_reset_override(&self, course_id: LocalId) -> Option<CourseResetAction> {
        self.course(course_id).and_then(|c| c.reset_action)
    }
}

/// Everything the reconcilers need from storage
pub trait SyncStore: MappingStore + CalendarStore + CursorStore + JobQueue + LocalState {}

impl<T> SyncStore for T where T: MappingStore + CalendarStore + CursorStore + JobQueue + LocalState {}
