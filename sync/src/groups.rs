//! Group membership reconciliation and the remote group lifecycle

use crate::error::{Result, SkipReason, SyncError};
use crate::metrics::{Mutation, ReconcileMetrics};
use crate::model::*;
use crate::retry::RetryPolicy;
use crate::store::SyncStore;
use crate::ensure_directory_ready;
use o365_sync_core::api::{DirectoryClient, GraphError, NewGroup};
use o365_sync_core::{Configuration, CourseResetAction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Add/remove sets for one group, in remote user ids
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipPlan {
    pub owners_to_remove: Vec<String>,
    pub members_to_remove: Vec<String>,
    pub owners_to_add: Vec<String>,
    pub members_to_add: Vec<String>,
}

impl MembershipPlan {
    /// Set differences between intended and current state
    ///
    /// Members that are intended owners are never removed. When
    /// `manage_owners` is false the owner sets are left alone.
    pub fn compute(
        intended_owners: &BTreeSet<String>,
        intended_members: &BTreeSet<String>,
        current_owners: &BTreeSet<String>,
        current_members: &BTreeSet<String>,
        manage_owners: bool,
    ) -> Self {
        let (owners_to_add, owners_to_remove) = if manage_owners {
            (
                intended_owners.difference(current_owners).cloned().collect(),
                current_owners.difference(intended_owners).cloned().collect(),
            )
        } else {
            (Vec::new(), Vec::new())
        };

        let members_to_add = intended_members.difference(current_members).cloned().collect();
        let members_to_remove = current_members
            .difference(intended_members)
            .filter(|id| !intended_owners.contains(*id))
            .cloned()
            .collect();

        Self {
            owners_to_remove,
            members_to_remove,
            owners_to_add,
            members_to_add,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.owners_to_remove.is_empty()
            && self.members_to_remove.is_empty()
            && self.owners_to_add.is_empty()
            && self.members_to_add.is_empty()
    }
}

/// Result of one membership reconciliation
#[derive(Debug, Clone)]
pub struct MembershipOutcome {
    /// Remote user ids successfully added as owner or member
    pub added: Vec<String>,
    /// Remote user ids successfully removed as owner or member
    pub removed: Vec<String>,
    pub metrics: ReconcileMetrics,
}

/// Where a soft-deleted group mapping ended up
#[derive(Debug, Clone, PartialEq)]
pub enum GroupResolution {
    /// The group came back from the remote recycle bin; mapping is active again
    Restored(ObjectMapping),
    /// The group is permanently gone; mapping was hard-deleted
    Purged,
}

#[derive(Debug, Clone)]
pub struct CourseResetOutcome {
    pub action: CourseResetAction,
    pub disconnected: Vec<MappingKey>,
    pub recreated: Vec<ObjectMapping>,
}

pub struct GroupReconciler {
    client: Arc<dyn DirectoryClient>,
    store: Arc<dyn SyncStore>,
    config: Arc<Configuration>,
    retry: RetryPolicy,
}

impl GroupReconciler {
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

    fn course(&self, course_id: LocalId) -> Result<Course> {
        self.store
            .course(course_id)
            .ok_or_else(|| SkipReason::UnknownLocal(format!("course {}", course_id)).into())
    }

    fn to_remote(&self, users: impl IntoIterator<Item = LocalId>) -> BTreeSet<String> {
        users
            .into_iter()
            .filter_map(|id| self.store.remote_user_id(id))
            .collect()
    }

    /// Intended `(owners, members)` in remote ids
    ///
    /// Local users without a remote mapping are left out.
    pub fn intended_sets(&self, key: &MappingKey) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
        let subtype = key
            .subtype
            .ok_or_else(|| SyncError::store(format!("{} is not a group key", key)))?;

        let (owners, members) = match subtype {
            ObjectSubtype::Course | ObjectSubtype::CourseTeam => {
                let course = self.course(key.local_id)?;
                (
                    self.store
                        .users_with_capability(course.context_id, &self.config.owner_capability),
                    self.store.enrolled_users(course.id),
                )
            }
            ObjectSubtype::UserGroup => {
                let group = self.store.local_group(key.local_id).ok_or_else(|| {
                    SkipReason::UnknownLocal(format!("group {}", key.local_id))
                })?;
                let course = self.course(group.course_id)?;
                (
                    self.store
                        .users_with_capability(course.context_id, &self.config.owner_capability),
                    group.members,
                )
            }
            ObjectSubtype::CourseSite => {
                let course = self.course(key.local_id)?;
                (
                    Vec::new(),
                    self.store
                        .users_with_capability(course.context_id, &self.config.contributor_capability),
                )
            }
        };

        Ok((self.to_remote(owners), self.to_remote(members)))
    }

    fn display_name_for(&self, key: &MappingKey) -> Result<String> {
        match key.subtype {
            Some(ObjectSubtype::UserGroup) => {
                let group = self.store.local_group(key.local_id).ok_or_else(|| {
                    SkipReason::UnknownLocal(format!("group {}", key.local_id))
                })?;
                let course = self.course(group.course_id)?;
                Ok(format!("{} - {}", course.name, group.name))
            }
            Some(ObjectSubtype::CourseSite) => {
                Ok(format!("{} contributors", self.course(key.local_id)?.name))
            }
            _ => Ok(self.course(key.local_id)?.name),
        }
    }

    async fn apply<F, Fut>(
        &self,
        metrics: &mut ReconcileMetrics,
        mutation: Mutation,
        group_id: &str,
        user_id: &str,
        f: F,
    ) -> bool
    where
        F: Fn() -> Fut,
        Fut: Future<Output = std::result::Result<(), GraphError>>,
    {
        metrics.record_processed();
        match self.retry.run(mutation.as_str(), f).await {
            Ok(()) => {
                debug!(group_id, user_id, "{}", mutation.as_str());
                metrics.record_mutation(mutation);
                true
            }
            Err(e) => {
                metrics.record_error(
                    mutation.as_str(),
                    format!("{} for user {} on group {}: {}", mutation.as_str(), user_id, group_id, e),
                );
                false
            }
        }
    }

    /// Converge the remote group's owners and members to the local state
    #[instrument(skip(self), fields(subtype = %subtype))]
    pub async fn reconcile(&self, subtype: ObjectSubtype, local_id: LocalId) -> Result<MembershipOutcome> {
        ensure_directory_ready(&self.config, self.client.as_ref())?;

        let key = MappingKey::group(subtype, local_id);
        let mapping = self
            .store
            .active_mapping(&key)
            .ok_or_else(|| SyncError::no_mapping(key.to_string()))?;

        let (intended_owners, intended_members) = self.intended_sets(&key)?;
        if subtype.requires_owner() && intended_owners.is_empty() {
            info!("No owner available for {}, skipping", key);
            return Err(SkipReason::NoOwner(key.to_string()).into());
        }

        let group_id = mapping.remote_id.as_str();
        self.retry
            .run("get_group", || self.client.get_group(group_id))
            .await?;

        let current_owners: BTreeSet<String> = if subtype.manages_owners() {
            self.client.list_group_owners(group_id).await?.into_iter().collect()
        } else {
            BTreeSet::new()
        };
        let current_members: BTreeSet<String> =
            self.client.list_group_members(group_id).await?.into_iter().collect();

        let plan = MembershipPlan::compute(
            &intended_owners,
            &intended_members,
            &current_owners,
            &current_members,
            subtype.manages_owners(),
        );
        debug!(
            owners_to_remove = plan.owners_to_remove.len(),
            members_to_remove = plan.members_to_remove.len(),
            owners_to_add = plan.owners_to_add.len(),
            members_to_add = plan.members_to_add.len(),
            "Computed membership plan"
        );

        let mut metrics = ReconcileMetrics::new("group_membership");
        let mut added = Vec::new();
        let mut removed = Vec::new();

        for user in &plan.owners_to_remove {
            if self
                .apply(&mut metrics, Mutation::OwnerRemoved, group_id, user, || {
                    self.client.remove_group_owner(group_id, user)
                })
                .await
            {
                removed.push(user.clone());
            }
        }
        for user in &plan.members_to_remove {
            if self
                .apply(&mut metrics, Mutation::MemberRemoved, group_id, user, || {
                    self.client.remove_group_member(group_id, user)
                })
                .await
            {
                removed.push(user.clone());
            }
        }
        for user in &plan.owners_to_add {
            if self
                .apply(&mut metrics, Mutation::OwnerAdded, group_id, user, || {
                    self.client.add_group_owner(group_id, user)
                })
                .await
            {
                added.push(user.clone());
            }
        }
        for user in &plan.members_to_add {
            if self
                .apply(&mut metrics, Mutation::MemberAdded, group_id, user, || {
                    self.client.add_group_member(group_id, user)
                })
                .await
            {
                added.push(user.clone());
            }
        }

        metrics.complete();
        Ok(MembershipOutcome {
            added,
            removed,
            metrics,
        })
    }

    /// Reconcile every active group mapping; per-group failures are logged
    pub async fn reconcile_all(&self) -> Result<ReconcileMetrics> {
        ensure_directory_ready(&self.config, self.client.as_ref())?;

        let mut summary = ReconcileMetrics::new("group_membership_all");
        for mapping in self.store.mappings_of_type(ObjectType::Group, None) {
            let Some(subtype) = mapping.subtype else {
                continue;
            };
            match self.reconcile(subtype, mapping.local_id).await {
                Ok(outcome) => summary.merge(&outcome.metrics),
                Err(SyncError::Skipped(reason)) => {
                    info!("Skipping group {}: {}", mapping.key(), reason);
                    summary.record_skip();
                }
                Err(e) => summary.record_error("reconcile", format!("{}: {}", mapping.key(), e)),
            }
        }
        summary.complete();
        Ok(summary)
    }

    /// Create the remote groups that local courses and groups still lack
    ///
    /// Owner-gated course teams without an owner are skipped until one exists.
    pub async fn provision_missing(&self) -> Result<ReconcileMetrics> {
        ensure_directory_ready(&self.config, self.client.as_ref())?;

        let mut summary = ReconcileMetrics::new("group_provision");
        let mut keys = Vec::new();
        for course in self.store.courses() {
            keys.extend(
                ObjectSubtype::COURSE_LEVEL
                    .iter()
                    .map(|subtype| MappingKey::group(*subtype, course.id)),
            );
            keys.extend(
                self.store
                    .course_groups(course.id)
                    .iter()
                    .map(|group| MappingKey::group(ObjectSubtype::UserGroup, group.id)),
            );
        }

        for key in keys {
            if self.store.active_mapping(&key).is_some() {
                continue;
            }
            summary.record_processed();
            match self.ensure_group(key, None).await {
                Ok(_) => summary.record_mutation(Mutation::GroupCreated),
                Err(SyncError::Skipped(reason)) => {
                    info!("Not creating group for {}: {}", key, reason);
                    summary.record_skip();
                }
                Err(e) => summary.record_error("ensure_group", format!("{}: {}", key, e)),
            }
        }
        summary.complete();
        Ok(summary)
    }

    /// Return the active mapping for `key`, creating the remote group if needed
    #[instrument(skip(self, display_name), fields(key = %key))]
    pub async fn ensure_group(&self, key: MappingKey, display_name: Option<String>) -> Result<ObjectMapping> {
        ensure_directory_ready(&self.config, self.client.as_ref())?;

        if let Some(mapping) = self.store.active_mapping(&key) {
            return Ok(mapping);
        }
        if let Some(mapping) = self.store.soft_deleted_mapping(&key) {
            if let GroupResolution::Restored(mapping) = self.resolve_soft_deleted(mapping).await? {
                return Ok(mapping);
            }
        }

        let subtype = key
            .subtype
            .ok_or_else(|| SyncError::store(format!("{} is not a group key", key)))?;
        let name = match display_name {
            Some(name) => name,
            None => self.display_name_for(&key)?,
        };

        let mut group = NewGroup::unified(name.clone()).description(name.clone());
        if subtype.requires_owner() {
            let (owners, _) = self.intended_sets(&key)?;
            if owners.is_empty() {
                info!("No owner available for {}, not creating group", key);
                return Err(SkipReason::NoOwner(key.to_string()).into());
            }
            group = group.owners(owners.into_iter().collect());
        }

        let created = self.client.create_group(&group).await?;
        let mapping = ObjectMapping::new(key, created.id, Some(name));
        self.store.upsert_mapping(mapping.clone())?;
        info!(remote_id = %mapping.remote_id, "Created remote group for {}", key);
        Ok(mapping)
    }

    /// Delete the remote group, then soft-delete its mapping
    #[instrument(skip(self), fields(key = %key))]
    pub async fn delete_group(&self, key: MappingKey) -> Result<()> {
        ensure_directory_ready(&self.config, self.client.as_ref())?;

        let mut mapping = self
            .store
            .active_mapping(&key)
            .ok_or_else(|| SyncError::no_mapping(key.to_string()))?;

        match self.client.delete_group(&mapping.remote_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!("Remote group {} already gone", mapping.remote_id);
            }
            Err(e) => return Err(e.into()),
        }

        mapping.set_soft_deleted(true);
        self.store.upsert_mapping(mapping)?;
        info!("Deleted remote group for {}", key);
        Ok(())
    }

    /// Decide between restore and purge with a single deleted-items lookup
    pub async fn resolve_soft_deleted(&self, mut mapping: ObjectMapping) -> Result<GroupResolution> {
        let key = mapping.key();

        let in_recycle_bin = if mapping.is_disconnected() {
            false
        } else {
            match self.client.is_group_in_deleted_items(&mapping.remote_id).await {
                Ok(present) => present,
                Err(GraphError::Unsupported(what)) => {
                    debug!("{} not available, treating {} as purged", what, key);
                    false
                }
                Err(e) => return Err(e.into()),
            }
        };

        if in_recycle_bin {
            self.client.restore_group(&mapping.remote_id).await?;
            mapping.set_soft_deleted(false);
            self.store.upsert_mapping(mapping.clone())?;
            info!(remote_id = %mapping.remote_id, "Restored remote group for {}", key);
            Ok(GroupResolution::Restored(mapping))
        } else {
            self.store.remove_mapping(&key, &mapping.remote_id);
            info!(remote_id = %mapping.remote_id, "Purged mapping for {}", key);
            Ok(GroupResolution::Purged)
        }
    }

    /// Apply the configured reset behaviour to a course's groups
    #[instrument(skip(self))]
    pub async fn handle_course_reset(&self, course_id: LocalId) -> Result<CourseResetOutcome> {
        self.course(course_id)?;
        let action = self
            .store
            .course_reset_override(course_id)
            .unwrap_or(self.config.course_reset_action);

        let mut outcome = CourseResetOutcome {
            action,
            disconnected: Vec::new(),
            recreated: Vec::new(),
        };
        if action == CourseResetAction::Nothing {
            info!("Course reset leaves remote groups untouched");
            return Ok(outcome);
        }

        let keys = ObjectSubtype::COURSE_LEVEL
            .iter()
            .map(|subtype| MappingKey::group(*subtype, course_id))
            .chain(
                self.store
                    .course_groups(course_id)
                    .into_iter()
                    .map(|g| MappingKey::group(ObjectSubtype::UserGroup, g.id)),
            );
        for key in keys {
            if let Some(mut mapping) = self.store.active_mapping(&key) {
                mapping.mark_disconnected();
                self.store.upsert_mapping(mapping)?;
                outcome.disconnected.push(key);
            }
        }
        info!(count = outcome.disconnected.len(), "Disconnected course groups");

        if action == CourseResetAction::DisconnectAndRecreate {
            for key in outcome.disconnected.clone() {
                match self.ensure_group(key, None).await {
                    Ok(mapping) => outcome.recreated.push(mapping),
                    Err(SyncError::Skipped(reason)) => info!("Not recreating {}: {}", key, reason),
                    Err(e) => warn!("Failed to recreate group for {}: {}", key, e),
                }
            }
        }

        Ok(outcome)
    }
}
