use super::target_for_user;
use crate::error::{Result, SkipReason, SyncError};
use crate::metrics::{Mutation, ReconcileMetrics};
use crate::model::*;
use crate::store::SyncStore;
use chrono::{DateTime, Utc};
use o365_sync_core::api::{Attendee, CalendarTarget, DateTimeTimeZone, DirectoryClient, ItemBody, NewEvent};
use o365_sync_core::Configuration;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Pushes local events out to the owners' remote calendars
pub struct OutboundCalendarReconciler {
    client: Arc<dyn DirectoryClient>,
    store: Arc<dyn SyncStore>,
    config: Arc<Configuration>,
}

impl OutboundCalendarReconciler {
    pub fn new(client: Arc<dyn DirectoryClient>, store: Arc<dyn SyncStore>, config: Arc<Configuration>) -> Self {
        Self { client, store, config }
    }

    /// Sync one scope; false when some event failed and was left for the next run
    pub async fn sync_scope(
        &self,
        scope_type: ScopeType,
        scope_id: LocalId,
        since: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let metrics = self.run_scope(scope_type, scope_id, since).await?;
        Ok(!metrics.has_errors())
    }

    /// Sync one scope and report what was done
    ///
    /// Skipped entirely when the scope's cursor is newer than `since`, the
    /// time the triggering change was queued. The cursor only advances when
    /// every event converged.
    #[instrument(skip(self))]
    pub async fn run_scope(
        &self,
        scope_type: ScopeType,
        scope_id: LocalId,
        since: Option<DateTime<Utc>>,
    ) -> Result<ReconcileMetrics> {
        if !self.config.is_configured() {
            return Err(SkipReason::NotConfigured.into());
        }

        let mut metrics = ReconcileMetrics::new("calendar_sync");
        let cursor_key = CursorKey::CalendarScope(scope_type, scope_id);
        let mut cursor = self.store.cursor(&cursor_key);

        if let (Some(last_run), Some(since)) = (cursor.last_run, since) {
            if last_run > since {
                debug!(%last_run, %since, "Scope already synced after the change was queued");
                metrics.record_skip();
                metrics.complete();
                return Ok(metrics);
            }
        }

        let run_start = Utc::now();
        let subscribers: Vec<LocalId> = self
            .store
            .subscriptions_for_scope(scope_type, scope_id)
            .into_iter()
            .filter(|s| s.sync_direction.pushes())
            .map(|s| s.user_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        for event in self.store.events_in_scope(scope_type, scope_id) {
            metrics.record_processed();
            match self.sync_event(&event, &subscribers).await {
                Ok(Some(mutation)) => metrics.record_mutation(mutation),
                Ok(None) => {}
                Err(SyncError::Skipped(reason)) => {
                    info!(event_id = event.id, "Not syncing event: {}", reason);
                    metrics.record_skip();
                }
                Err(e) => metrics.record_error("sync_event", format!("event {}: {}", event.id, e)),
            }
        }

        if !metrics.has_errors() {
            cursor.last_run = Some(run_start);
            self.store.put_cursor(cursor_key, cursor);
        }
        metrics.complete();
        Ok(metrics)
    }

    async fn sync_event(&self, event: &LocalEvent, subscribers: &[LocalId]) -> Result<Option<Mutation>> {
        let mapping = self.store.event_mapping(event.id);
        if event.imported || mapping.as_ref().map(|m| m.origin) == Some(EventOrigin::Remote) {
            return Ok(None);
        }

        match (mapping, subscribers.is_empty()) {
            (None, true) => Ok(None),
            (None, false) => {
                let target = self.target(event.owner_user_id).await?;
                let body = NewEvent {
                    subject: event.name.clone(),
                    body: ItemBody::html(format!("{}{}", event.description, self.config.calendar_body_suffix)),
                    start: DateTimeTimeZone::from_utc(event.start),
                    end: DateTimeTimeZone::from_utc(event.end()),
                    attendees: self.attendees(event.owner_user_id, subscribers),
                };
                let created = self.client.create_event(&target, &body).await?;
                self.store.record_event_mapping(CalendarEventMapping {
                    local_event_id: event.id,
                    remote_event_id: created.id,
                    origin: EventOrigin::Local,
                    owning_user_id: event.owner_user_id,
                })?;
                Ok(Some(Mutation::EventCreated))
            }
            (Some(mapping), false) => {
                let target = self.target(mapping.owning_user_id).await?;
                let attendees = self.attendees(mapping.owning_user_id, subscribers);
                self.client
                    .update_event_attendees(&target, &mapping.remote_event_id, &attendees)
                    .await?;
                Ok(Some(Mutation::EventUpdated))
            }
            (Some(mapping), true) => {
                let target = self.target(mapping.owning_user_id).await?;
                self.delete_remote(&target, &mapping.remote_event_id).await?;
                self.store.remove_event_mapping(event.id);
                Ok(Some(Mutation::EventDeleted))
            }
        }
    }

    /// Delete the remote counterpart of a removed local event
    ///
    /// Returns false when the event was never linked.
    #[instrument(skip(self))]
    pub async fn event_deleted(&self, local_event_id: LocalId) -> Result<bool> {
        if !self.config.is_configured() {
            return Err(SkipReason::NotConfigured.into());
        }
        let Some(mapping) = self.store.event_mapping(local_event_id) else {
            debug!("Event was never linked to a remote event");
            return Ok(false);
        };

        let target = self.target(mapping.owning_user_id).await?;
        self.delete_remote(&target, &mapping.remote_event_id).await?;
        self.store.remove_event_mapping(local_event_id);
        info!(remote_event_id = %mapping.remote_event_id, "Deleted remote event");
        Ok(true)
    }

    async fn target(&self, user_id: LocalId) -> Result<CalendarTarget> {
        Ok(target_for_user(self.client.as_ref(), self.store.as_ref(), user_id).await?)
    }

    async fn delete_remote(&self, target: &CalendarTarget, remote_event_id: &str) -> Result<()> {
        match self.client.delete_event(target, remote_event_id).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(remote_event_id, "Remote event already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Subscribers other than the owner who can receive an invitation
    fn attendees(&self, owner: LocalId, subscribers: &[LocalId]) -> Vec<Attendee> {
        subscribers
            .iter()
            .filter(|id| **id != owner)
            .filter_map(|id| self.store.user(*id))
            .filter(|user| !user.suspended)
            .filter_map(|user| {
                let email = user.email.clone()?;
                Some(Attendee::required(email, Some(user.username)))
            })
            .collect()
    }
}
