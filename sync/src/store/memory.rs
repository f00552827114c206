use super::*;
use crate::error::SyncError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Records exported by the local platform
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSnapshot {
    pub users: Vec<LocalUser>,
    pub contexts: Vec<Context>,
    pub courses: Vec<Course>,
    pub groups: Vec<LocalGroup>,
    pub enrolments: Vec<Enrolment>,
    pub roles: Vec<Role>,
    pub role_assignments: Vec<RoleAssignment>,
    pub events: Vec<LocalEvent>,
}

/// State owned by the sync service
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncTables {
    pub mappings: Vec<ObjectMapping>,
    pub event_mappings: Vec<CalendarEventMapping>,
    pub subscriptions: Vec<CalendarSubscription>,
    pub cursors: Vec<(CursorKey, SyncCursor)>,
    pub access_jobs: Vec<AccessSyncJob>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSnapshot {
    pub local: LocalSnapshot,
    pub sync: SyncTables,
}

/// In-memory store with JSON snapshot persistence
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<StoreSnapshot>,
    path: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            data: RwLock::new(snapshot),
            path: None,
        }
    }

    /// Load the snapshot at `path`, starting empty when it does not exist yet
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let snapshot = if path.exists() {
            let raw = std::fs::read(&path)?;
            let snapshot: StoreSnapshot = serde_json::from_slice(&raw)?;
            info!(
                path = %path.display(),
                mappings = snapshot.sync.mappings.len(),
                pending_jobs = snapshot.sync.access_jobs.len(),
                "Loaded store snapshot"
            );
            snapshot
        } else {
            info!(path = %path.display(), "No store snapshot yet, starting empty");
            StoreSnapshot::default()
        };

        Ok(Self {
            data: RwLock::new(snapshot),
            path: Some(path),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the snapshot back to the file it was opened from
    pub fn save(&self) -> Result<()> {
        match &self.path {
            Some(path) => self.save_to(path),
            None => Ok(()),
        }
    }

    /// Write to a sibling temp file, then rename over the target
    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let raw = serde_json::to_vec_pretty(&*self.data.read())?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, raw)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "Saved store snapshot");
        Ok(())
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.data.read().clone()
    }

    /// Replace the local platform records with a fresh export
    ///
    /// Imported events are not part of the platform export and are kept.
    /// One whose id the export now claims is moved to a fresh imported id,
    /// and its event mapping follows it.
    pub fn refresh_local(&self, mut local: LocalSnapshot) {
        let mut data = self.data.write();
        let exported: HashSet<LocalId> = local.events.iter().map(|e| e.id).collect();
        let imported: Vec<LocalEvent> = data.local.events.iter().filter(|e| e.imported).cloned().collect();
        let mut next_id = Self::next_imported_id(imported.iter().chain(local.events.iter()));

        for mut event in imported {
            if exported.contains(&event.id) {
                let previous = event.id;
                event.id = next_id;
                next_id += 1;
                data.sync
                    .event_mappings
                    .iter_mut()
                    .filter(|m| m.local_event_id == previous && m.origin == EventOrigin::Remote)
                    .for_each(|m| m.local_event_id = event.id);
                info!(previous, local_event_id = event.id, "Moved imported event clear of exported id");
            }
            local.events.push(event);
        }
        data.local = local;
    }

    fn next_imported_id<'a>(events: impl Iterator<Item = &'a LocalEvent>) -> LocalId {
        events.map(|e| e.id).max().unwrap_or(0).max(IMPORTED_EVENT_ID_BASE) + 1
    }

    /// Mutate the local records in place
    pub fn update_local<F: FnOnce(&mut LocalSnapshot)>(&self, f: F) {
        f(&mut self.data.write().local);
    }

    fn ancestors(contexts: &HashMap<LocalId, &Context>, context_id: LocalId) -> Vec<LocalId> {
        let mut chain = Vec::new();
        let mut current = Some(context_id);
        while let Some(id) = current {
            if chain.contains(&id) {
                break;
            }
            chain.push(id);
            current = contexts.get(&id).and_then(|c| c.parent_id);
        }
        chain
    }

    fn holds_capability(local: &LocalSnapshot, user_id: LocalId, context_id: LocalId, capability: &str) -> bool {
        let contexts: HashMap<LocalId, &Context> = local.contexts.iter().map(|c| (c.id, c)).collect();
        let chain = Self::ancestors(&contexts, context_id);
        local
            .role_assignments
            .iter()
            .filter(|a| a.user_id == user_id && chain.contains(&a.context_id))
            .filter_map(|a| local.roles.iter().find(|r| r.id == a.role_id))
            .any(|role| role.capabilities.iter().any(|c| c == capability))
    }
}

impl MappingStore for MemoryStore {
    fn active_mapping(&self, key: &MappingKey) -> Option<ObjectMapping> {
        self.data
            .read()
            .sync
            .mappings
            .iter()
            .find(|m| m.key() == *key && !m.is_soft_deleted())
            .cloned()
    }

    fn soft_deleted_mapping(&self, key: &MappingKey) -> Option<ObjectMapping> {
        self.data
            .read()
            .sync
            .mappings
            .iter()
            .filter(|m| m.key() == *key && m.is_soft_deleted())
            .max_by_key(|m| m.modified_at)
            .cloned()
    }

    fn upsert_mapping(&self, mapping: ObjectMapping) -> Result<()> {
        let mut data = self.data.write();
        let mappings = &mut data.sync.mappings;
        let key = mapping.key();

        if !mapping.is_soft_deleted() {
            let conflict = mappings
                .iter()
                .any(|m| m.key() == key && !m.is_soft_deleted() && m.remote_id != mapping.remote_id);
            if conflict {
                return Err(SyncError::store(format!("{} already has an active mapping", key)));
            }
        }

        match mappings
            .iter_mut()
            .find(|m| m.key() == key && m.remote_id == mapping.remote_id)
        {
            Some(existing) => *existing = mapping,
            None => mappings.push(mapping),
        }
        Ok(())
    }

    fn remove_mapping(&self, key: &MappingKey, remote_id: &str) -> bool {
        let mut data = self.data.write();
        let before = data.sync.mappings.len();
        data.sync
            .mappings
            .retain(|m| !(m.key() == *key && m.remote_id == remote_id));
        data.sync.mappings.len() != before
    }

    fn mappings_of_type(&self, object_type: ObjectType, subtype: Option<ObjectSubtype>) -> Vec<ObjectMapping> {
        self.data
            .read()
            .sync
            .mappings
            .iter()
            .filter(|m| m.object_type == object_type && !m.is_soft_deleted())
            .filter(|m| subtype.is_none() || m.subtype == subtype)
            .cloned()
            .collect()
    }
}

impl CalendarStore for MemoryStore {
    fn event_mapping(&self, local_event_id: LocalId) -> Option<CalendarEventMapping> {
        self.data
            .read()
            .sync
            .event_mappings
            .iter()
            .find(|m| m.local_event_id == local_event_id)
            .cloned()
    }

    fn event_mapping_for_remote(&self, remote_event_id: &str) -> Option<CalendarEventMapping> {
        self.data
            .read()
            .sync
            .event_mappings
            .iter()
            .find(|m| m.remote_event_id == remote_event_id)
            .cloned()
    }

    fn record_event_mapping(&self, mapping: CalendarEventMapping) -> Result<()> {
        let mut data = self.data.write();
        let taken = data.sync.event_mappings.iter().any(|m| {
            m.local_event_id == mapping.local_event_id || m.remote_event_id == mapping.remote_event_id
        });
        if taken {
            return Err(SyncError::store(format!(
                "event {} or remote event {} is already linked",
                mapping.local_event_id, mapping.remote_event_id
            )));
        }
        data.sync.event_mappings.push(mapping);
        Ok(())
    }

    fn remove_event_mapping(&self, local_event_id: LocalId) -> Option<CalendarEventMapping> {
        let mut data = self.data.write();
        let index = data
            .sync
            .event_mappings
            .iter()
            .position(|m| m.local_event_id == local_event_id)?;
        Some(data.sync.event_mappings.remove(index))
    }

    fn subscriptions(&self) -> Vec<CalendarSubscription> {
        self.data.read().sync.subscriptions.clone()
    }

    fn upsert_subscription(&self, subscription: CalendarSubscription) {
        let mut data = self.data.write();
        let subscriptions = &mut data.sync.subscriptions;
        match subscriptions.iter_mut().find(|s| {
            s.user_id == subscription.user_id
                && s.scope_type == subscription.scope_type
                && s.scope_id == subscription.scope_id
        }) {
            Some(existing) => *existing = subscription,
            None => subscriptions.push(subscription),
        }
    }

    fn remove_subscription(&self, user_id: LocalId, scope_type: ScopeType, scope_id: LocalId) -> bool {
        let mut data = self.data.write();
        let before = data.sync.subscriptions.len();
        data.sync.subscriptions.retain(|s| {
            !(s.user_id == user_id && s.scope_type == scope_type && s.scope_id == scope_id)
        });
        data.sync.subscriptions.len() != before
    }
}

impl CursorStore for MemoryStore {
    fn cursor(&self, key: &CursorKey) -> SyncCursor {
        self.data
            .read()
            .sync
            .cursors
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, c)| c.clone())
            .unwrap_or_default()
    }

    fn put_cursor(&self, key: CursorKey, cursor: SyncCursor) {
        let mut data = self.data.write();
        match data.sync.cursors.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => *existing = cursor,
            None => data.sync.cursors.push((key, cursor)),
        }
    }
}

impl JobQueue for MemoryStore {
    fn push_access_job(&self, job: AccessSyncJob) {
        self.data.write().sync.access_jobs.push(job);
    }

    fn pending_access_jobs(&self) -> Vec<AccessSyncJob> {
        self.data.read().sync.access_jobs.clone()
    }

    fn complete_access_job(&self, id: uuid::Uuid) -> bool {
        let mut data = self.data.write();
        let before = data.sync.access_jobs.len();
        data.sync.access_jobs.retain(|j| j.id != id);
        data.sync.access_jobs.len() != before
    }
}

impl LocalState for MemoryStore {
    fn user(&self, id: LocalId) -> Option<LocalUser> {
        self.data.read().local.users.iter().find(|u| u.id == id).cloned()
    }

    fn users(&self) -> Vec<LocalUser> {
        self.data.read().local.users.clone()
    }

    fn course(&self, id: LocalId) -> Option<Course> {
        self.data.read().local.courses.iter().find(|c| c.id == id).cloned()
    }

    fn courses(&self) -> Vec<Course> {
        self.data.read().local.courses.clone()
    }

    fn courses_under_context(&self, context_id: LocalId) -> Vec<Course> {
        let data = self.data.read();
        let contexts: HashMap<LocalId, &Context> =
            data.local.contexts.iter().map(|c| (c.id, c)).collect();
        data.local
            .courses
            .iter()
            .filter(|course| Self::ancestors(&contexts, course.context_id).contains(&context_id))
            .cloned()
            .collect()
    }

    fn course_for_context(&self, context_id: LocalId) -> Option<Course> {
        self.data
            .read()
            .local
            .courses
            .iter()
            .find(|c| c.context_id == context_id)
            .cloned()
    }

    fn enrolled_users(&self, course_id: LocalId) -> Vec<LocalId> {
        let data = self.data.read();
        let suspended: HashSet<LocalId> = data
            .local
            .users
            .iter()
            .filter(|u| u.suspended)
            .map(|u| u.id)
            .collect();
        data.local
            .enrolments
            .iter()
            .filter(|e| e.course_id == course_id && e.active && !suspended.contains(&e.user_id))
            .map(|e| e.user_id)
            .collect()
    }

    fn local_group(&self, id: LocalId) -> Option<LocalGroup> {
        self.data.read().local.groups.iter().find(|g| g.id == id).cloned()
    }

    fn course_groups(&self, course_id: LocalId) -> Vec<LocalGroup> {
        self.data
            .read()
            .local
            .groups
            .iter()
            .filter(|g| g.course_id == course_id)
            .cloned()
            .collect()
    }

    fn has_capability(&self, user_id: LocalId, context_id: LocalId, capability: &str) -> bool {
        Self::holds_capability(&self.data.read().local, user_id, context_id, capability)
    }

    fn users_with_capability(&self, context_id: LocalId, capability: &str) -> Vec<LocalId> {
        let data = self.data.read();
        let mut users: Vec<LocalId> = data
            .local
            .users
            .iter()
            .filter(|u| !u.suspended)
            .filter(|u| Self::holds_capability(&data.local, u.id, context_id, capability))
            .map(|u| u.id)
            .collect();
        users.sort_unstable();
        users
    }

    fn event(&self, id: LocalId) -> Option<LocalEvent> {
        self.data.read().local.events.iter().find(|e| e.id == id).cloned()
    }

    fn events_in_scope(&self, scope_type: ScopeType, scope_id: LocalId) -> Vec<LocalEvent> {
        self.data
            .read()
            .local
            .events
            .iter()
            .filter(|e| e.scope_type == scope_type && e.scope_id == scope_id)
            .cloned()
            .collect()
    }

    fn create_local_event(&self, event: NewLocalEvent) -> Result<LocalEvent> {
        let mut data = self.data.write();
        let id = if event.imported {
            Self::next_imported_id(data.local.events.iter())
        } else {
            data.local
                .events
                .iter()
                .map(|e| e.id)
                .filter(|id| *id <= IMPORTED_EVENT_ID_BASE)
                .max()
                .unwrap_or(0)
                + 1
        };
        let created = LocalEvent {
            id,
            name: event.name,
            description: event.description,
            start: event.start,
            duration_secs: event.duration_secs,
            scope_type: event.scope_type,
            scope_id: event.scope_id,
            owner_user_id: event.owner_user_id,
            imported: event.imported,
        };
        data.local.events.push(created.clone());
        Ok(created)
    }
}
