//! Two-directional calendar reconciliation

mod inbound;
mod outbound;

pub use inbound::{InboundCalendarImporter, DEFAULT_LOOKBACK_DAYS};
pub use outbound::OutboundCalendarReconciler;

use crate::error::SkipReason;
use crate::model::LocalId;
use crate::store::SyncStore;
use o365_sync_core::api::{CalendarTarget, DirectoryClient, TokenScope};

/// Pick the mailbox and credential for acting on `user_id`'s calendar
///
/// The user's own token wins; the application token is used otherwise,
/// which needs the user's remote id to address the mailbox.
pub(crate) async fn target_for_user(
    client: &dyn DirectoryClient,
    store: &dyn SyncStore,
    user_id: LocalId,
) -> Result<CalendarTarget, SkipReason> {
    let scope = client
        .calendar_auth()
        .choose_scope(Some(user_id))
        .await
        .ok_or_else(|| SkipReason::NoCredentials(format!("calendar of user {}", user_id)))?;

    match (scope, store.remote_user_id(user_id)) {
        (TokenScope::App, None) => Err(SkipReason::NoMapping(format!("user {}", user_id))),
        (scope, remote_user) => Ok(CalendarTarget {
            scope,
            remote_user: remote_user.unwrap_or_default(),
        }),
    }
}
