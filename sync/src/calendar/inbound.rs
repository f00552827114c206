use super::target_for_user;
use crate::error::{Result, SkipReason};
use crate::metrics::{Mutation, ReconcileMetrics};
use crate::model::*;
use crate::store::SyncStore;
use chrono::{DateTime, Duration, Utc};
use o365_sync_core::api::DirectoryClient;
use o365_sync_core::Configuration;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// How far back the first import run looks
pub const DEFAULT_LOOKBACK_DAYS: i64 = 30;

/// Pulls remote calendar items into local events for `in`/`both` subscribers
pub struct InboundCalendarImporter {
    client: Arc<dyn DirectoryClient>,
    store: Arc<dyn SyncStore>,
    config: Arc<Configuration>,
}

impl InboundCalendarImporter {
    pub fn new(client: Arc<dyn DirectoryClient>, store: Arc<dyn SyncStore>, config: Arc<Configuration>) -> Self {
        Self { client, store, config }
    }

    /// Import everything modified since the stored cursor, then advance it
    ///
    /// The cursor moves to this run's start time only once every
    /// subscription was processed.
    pub async fn run(&self) -> Result<ReconcileMetrics> {
        let run_start = Utc::now();
        let mut cursor = self.store.cursor(&CursorKey::CalendarInbound);
        let since = cursor
            .last_run
            .unwrap_or_else(|| run_start - Duration::days(DEFAULT_LOOKBACK_DAYS));

        let mut metrics = ReconcileMetrics::new("calendar_import");
        self.import_into(since, &mut metrics).await?;

        cursor.last_run = Some(run_start);
        self.store.put_cursor(CursorKey::CalendarInbound, cursor);
        metrics.complete();
        Ok(metrics)
    }

    /// Import remote events modified since `since`; returns how many were created
    pub async fn import_since(&self, since: DateTime<Utc>) -> Result<usize> {
        let mut metrics = ReconcileMetrics::new("calendar_import");
        self.import_into(since, &mut metrics).await?;
        Ok(metrics.count(Mutation::EventImported))
    }

    #[instrument(skip(self, metrics))]
    async fn import_into(&self, since: DateTime<Utc>, metrics: &mut ReconcileMetrics) -> Result<()> {
        if !self.config.is_configured() {
            return Err(SkipReason::NotConfigured.into());
        }

        let subscriptions = self
            .store
            .subscriptions()
            .into_iter()
            .filter(|s| s.sync_direction.pulls());

        for subscription in subscriptions {
            let target = match target_for_user(self.client.as_ref(), self.store.as_ref(), subscription.user_id).await {
                Ok(target) => target,
                Err(reason) => {
                    info!(user_id = subscription.user_id, "Not importing calendar: {}", reason);
                    metrics.record_skip();
                    continue;
                }
            };

            let events = self.client.list_events_since(&target, since).await?;
            for remote in events {
                metrics.record_processed();
                if remote.is_cancelled || self.store.event_mapping_for_remote(&remote.id).is_some() {
                    continue;
                }
                let Some(start) = remote.start.to_utc() else {
                    warn!(remote_event_id = %remote.id, "Unparseable start time, skipping");
                    metrics.record_skip();
                    continue;
                };

                let local = self.store.create_local_event(NewLocalEvent {
                    name: remote
                        .subject
                        .clone()
                        .filter(|s| !s.is_empty())
                        .unwrap_or_else(|| "(no subject)".to_string()),
                    description: remote.body.as_ref().map(|b| b.content.clone()).unwrap_or_default(),
                    start,
                    duration_secs: remote.duration_secs(),
                    scope_type: subscription.scope_type,
                    scope_id: subscription.scope_id,
                    owner_user_id: subscription.user_id,
                    imported: true,
                })?;
                self.store.record_event_mapping(CalendarEventMapping {
                    local_event_id: local.id,
                    remote_event_id: remote.id.clone(),
                    origin: EventOrigin::Remote,
                    owning_user_id: subscription.user_id,
                })?;
                metrics.record_mutation(Mutation::EventImported);
            }
        }

        Ok(())
    }
}
