//! Full and delta import of remote directory users

use crate::error::{Result, SkipReason};
use crate::metrics::{Mutation, ReconcileMetrics};
use crate::model::*;
use crate::store::SyncStore;
use crate::ensure_directory_ready;
use async_trait::async_trait;
use chrono::Utc;
use o365_sync_core::api::{DirectoryClient, GraphError, PullMode, RemoteUser, UserPage};
use o365_sync_core::Configuration;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Receives imported users
#[async_trait]
pub trait UserProvisioner: Send + Sync {
    /// Create or update local state for users present in the directory
    async fn provision(&self, users: &[RemoteUser]) -> Result<usize>;

    /// Handle users reported as deleted by the change feed
    async fn remove(&self, users: &[RemoteUser]) -> Result<usize>;
}

/// Links remote users to existing local accounts by principal name or mail
pub struct MappingProvisioner {
    store: Arc<dyn SyncStore>,
}

impl MappingProvisioner {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    fn matches(local: &LocalUser, remote: &RemoteUser) -> bool {
        let same = |a: &str, b: &Option<String>| {
            b.as_deref().map(|b| a.eq_ignore_ascii_case(b)).unwrap_or(false)
        };
        same(&local.username, &remote.user_principal_name)
            || local
                .email
                .as_deref()
                .map(|email| same(email, &remote.mail) || same(email, &remote.user_principal_name))
                .unwrap_or(false)
    }
}

#[async_trait]
impl UserProvisioner for MappingProvisioner {
    async fn provision(&self, users: &[RemoteUser]) -> Result<usize> {
        let locals = self.store.users();
        let mut linked = 0;

        for remote in users {
            let Some(local) = locals.iter().find(|l| Self::matches(l, remote)) else {
                debug!(remote_id = %remote.id, "No local account for remote user");
                continue;
            };
            let current = self.store.active_mapping(&MappingKey::user(local.id));
            if current.as_ref().map(|m| m.remote_id.as_str()) == Some(remote.id.as_str()) {
                continue;
            }
            if let Some(current) = current {
                self.store.remove_mapping(&current.key(), &current.remote_id);
            }
            self.store.upsert_mapping(ObjectMapping::for_user(
                local.id,
                remote.id.clone(),
                remote.user_principal_name.clone(),
            ))?;
            linked += 1;
        }

        Ok(linked)
    }

    async fn remove(&self, users: &[RemoteUser]) -> Result<usize> {
        let mut removed = 0;
        for remote in users {
            if let Some(local_id) = self.store.local_user_for_remote(&remote.id) {
                if self.store.remove_mapping(&MappingKey::user(local_id), &remote.id) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

/// Summary of one importer run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSyncSummary {
    pub mode: PullMode,
    pub pages: usize,
    pub provisioned: usize,
    pub removed: usize,
    /// The run hit a transport or decode failure and restarted its sequence
    pub tokens_reset: bool,
    pub metrics: ReconcileMetrics,
}

/// One fetched page and the tokens to persist after it
#[derive(Debug, Clone)]
pub struct PullResult {
    pub users: Vec<RemoteUser>,
    pub skip_token: Option<String>,
    pub delta_token: Option<String>,
}

impl From<UserPage> for PullResult {
    fn from(page: UserPage) -> Self {
        // A continuation token means the sequence is still open; the resume
        // point only exists once it is finished.
        let delta_token = if page.skip_token.is_some() { None } else { page.delta_token };
        Self {
            users: page.users,
            skip_token: page.skip_token,
            delta_token,
        }
    }
}

pub struct UserImporter {
    client: Arc<dyn DirectoryClient>,
    store: Arc<dyn SyncStore>,
    config: Arc<Configuration>,
    provisioner: Arc<dyn UserProvisioner>,
    max_pages_per_run: usize,
}

impl UserImporter {
    pub fn new(
        client: Arc<dyn DirectoryClient>,
        store: Arc<dyn SyncStore>,
        config: Arc<Configuration>,
        provisioner: Arc<dyn UserProvisioner>,
    ) -> Self {
        Self {
            client,
            store,
            config,
            provisioner,
            max_pages_per_run: 50,
        }
    }

    pub fn with_max_pages(mut self, pages: usize) -> Self {
        self.max_pages_per_run = pages.max(1);
        self
    }

    /// Fetch one page; full mode ignores any delta token
    pub async fn pull(
        &self,
        mode: PullMode,
        skip_token: Option<&str>,
        delta_token: Option<&str>,
    ) -> std::result::Result<PullResult, GraphError> {
        let delta_token = match mode {
            PullMode::Full => None,
            PullMode::Delta => delta_token,
        };
        let page = self.client.fetch_users_page(mode, skip_token, delta_token).await?;
        Ok(page.into())
    }

    /// Failures after which the stored sequence cannot be continued
    fn resets_sequence(error: &GraphError) -> bool {
        error.is_transport_or_decode()
            || error.status() == Some(410)
            || error.code() == Some("syncStateNotFound")
    }

    /// Continue the stored sequence for `mode`, persisting tokens after each page
    #[instrument(skip(self))]
    pub async fn run(&self, mode: PullMode) -> Result<UserSyncSummary> {
        ensure_directory_ready(&self.config, self.client.as_ref())?;

        let key = CursorKey::for_mode(mode);
        let run_start = Utc::now();
        let mut cursor = self.store.cursor(&key);
        let mut summary = UserSyncSummary {
            mode,
            pages: 0,
            provisioned: 0,
            removed: 0,
            tokens_reset: false,
            metrics: ReconcileMetrics::new(match mode {
                PullMode::Full => "user_sync_full",
                PullMode::Delta => "user_sync_delta",
            }),
        };

        loop {
            let result = self
                .pull(mode, cursor.skip_token.as_deref(), cursor.delta_token.as_deref())
                .await;
            let page = match result {
                Ok(page) => page,
                Err(e) if Self::resets_sequence(&e) => {
                    warn!("User page fetch failed, restarting sequence next run: {}", e);
                    cursor.clear_tokens();
                    self.store.put_cursor(key, cursor);
                    summary.tokens_reset = true;
                    summary.metrics.record_error("fetch_users_page", e.to_string());
                    summary.metrics.complete();
                    return Ok(summary);
                }
                Err(e) => return Err(e.into()),
            };

            let (removed, present): (Vec<RemoteUser>, Vec<RemoteUser>) =
                page.users.into_iter().partition(|u| u.is_removed());
            summary.metrics.processed += removed.len() + present.len();

            let provisioned = self.provisioner.provision(&present).await?;
            let dropped = self.provisioner.remove(&removed).await?;
            summary.provisioned += provisioned;
            summary.removed += dropped;
            for _ in 0..provisioned {
                summary.metrics.record_mutation(Mutation::UserProvisioned);
            }
            for _ in 0..dropped {
                summary.metrics.record_mutation(Mutation::UserRemoved);
            }

            cursor.skip_token = page.skip_token;
            cursor.delta_token = page.delta_token;
            self.store.put_cursor(key, cursor.clone());
            summary.pages += 1;
            debug!(page = summary.pages, "Persisted user sync cursor");

            if cursor.skip_token.is_none() || summary.pages >= self.max_pages_per_run {
                break;
            }
        }

        cursor.last_run = Some(run_start);
        self.store.put_cursor(key, cursor);
        info!(
            pages = summary.pages,
            provisioned = summary.provisioned,
            removed = summary.removed,
            "User sync finished"
        );
        summary.metrics.complete();
        Ok(summary)
    }
}

impl UserSyncSummary {
    /// Nothing was fetched because the run was skipped
    pub fn skipped(mode: PullMode, reason: &SkipReason) -> Self {
        let mut metrics = ReconcileMetrics::new("user_sync");
        info!("User sync skipped: {}", reason);
        metrics.record_skip();
        Self {
            mode,
            pages: 0,
            provisioned: 0,
            removed: 0,
            tokens_reset: false,
            metrics,
        }
    }
}
