//! Reconciliation engine
//!
//! Keeps remote directory state converged with the local platform:
//! - Group membership and the group object lifecycle
//! - Calendar events in both directions
//! - Capability-driven access to course contributor groups
//! - Resumable full and delta user import
//! - Host event handlers and the task registry the dispatcher runs

pub mod access;
pub mod calendar;
pub mod error;
pub mod groups;
pub mod handlers;
pub mod metrics;
pub mod model;
pub mod retry;
pub mod store;
pub mod tasks;
pub mod usersync;

// Re-export main types
pub use access::{AccessOutcome, AccessReconciler};
pub use calendar::{InboundCalendarImporter, OutboundCalendarReconciler};
pub use error::{Result, SkipReason, SyncError};
pub use groups::{GroupReconciler, GroupResolution, MembershipOutcome, MembershipPlan};
pub use handlers::{HostEvent, HostEventHandlers, HostEventKind};
pub use metrics::{Mutation, ReconcileMetrics};
pub use retry::RetryPolicy;
pub use store::{MemoryStore, StoreSnapshot, SyncStore};
pub use tasks::{Task, TaskRegistry, TaskRequest, TaskSink};
pub use usersync::{MappingProvisioner, UserImporter, UserProvisioner, UserSyncSummary};

use o365_sync_core::api::DirectoryClient;
use o365_sync_core::Configuration;
use std::sync::Arc;

/// Short-circuit before any remote call when the directory cannot be used
pub(crate) fn ensure_directory_ready(
    config: &Configuration,
    client: &dyn DirectoryClient,
) -> std::result::Result<(), SkipReason> {
    if !config.is_configured() {
        return Err(SkipReason::NotConfigured);
    }
    if !client.app_credentials_available() {
        return Err(SkipReason::NoCredentials(format!(
            "application credentials for {}",
            client.api_name()
        )));
    }
    Ok(())
}

/// Every reconciler wired to one client, store and configuration
pub struct SyncService {
    pub config: Arc<Configuration>,
    pub client: Arc<dyn DirectoryClient>,
    pub store: Arc<dyn SyncStore>,
    pub groups: GroupReconciler,
    pub outbound: OutboundCalendarReconciler,
    pub inbound: InboundCalendarImporter,
    pub access: AccessReconciler,
    pub users: UserImporter,
}

impl SyncService {
    pub fn new(
        config: Arc<Configuration>,
        client: Arc<dyn DirectoryClient>,
        store: Arc<dyn SyncStore>,
        retry: RetryPolicy,
        provisioner: Arc<dyn UserProvisioner>,
    ) -> Self {
        Self {
            groups: GroupReconciler::new(client.clone(), store.clone(), config.clone(), retry.clone()),
            outbound: OutboundCalendarReconciler::new(client.clone(), store.clone(), config.clone()),
            inbound: InboundCalendarImporter::new(client.clone(), store.clone(), config.clone()),
            access: AccessReconciler::new(client.clone(), store.clone(), config.clone(), retry),
            users: UserImporter::new(client.clone(), store.clone(), config.clone(), provisioner),
            config,
            client,
            store,
        }
    }

    /// Service whose user importer links remote users to existing local accounts
    pub fn with_mapping_provisioner(
        config: Arc<Configuration>,
        client: Arc<dyn DirectoryClient>,
        store: Arc<dyn SyncStore>,
        retry: RetryPolicy,
    ) -> Self {
        let provisioner = Arc::new(MappingProvisioner::new(store.clone()));
        Self::new(config, client, store, retry, provisioner)
    }
}

// Test modules
#[cfg(test)]
mod testing;
#[cfg(test)]
mod groups_tests;
