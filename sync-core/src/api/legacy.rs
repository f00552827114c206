//! Azure AD Graph and Outlook REST implementation of [`DirectoryClient`]
//!
//! Directory calls go to `graph.windows.net/{tenant}` with an explicit
//! `api-version`, calendar calls to the Outlook REST v2.0 endpoint. Each
//! side holds its own token audience.

use super::{
    auth::{AuthManager, TokenScope},
    client::{ApiMethod, GraphHttpClient},
    directory::{encode_query_value, CalendarTarget, DirectoryClient},
    error::*,
    types::*,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

pub const LEGACY_API_VERSION: &str = "1.6";

/// Entry of a `$links` collection
#[derive(Debug, Deserialize)]
struct LinkEntry {
    url: String,
}

/// Object id from a link such as
/// `https://graph.windows.net/contoso/directoryObjects/{id}/Microsoft.DirectoryServices.User`
fn id_from_link(url: &str) -> Option<String> {
    let (_, rest) = url.split_once("directoryObjects/")?;
    let id = rest.split('/').next()?;
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}

pub struct LegacyDirectoryClient {
    directory: Arc<GraphHttpClient>,
    outlook: Arc<GraphHttpClient>,
    page_size: u32,
}

impl LegacyDirectoryClient {
    pub fn new(directory: Arc<GraphHttpClient>, outlook: Arc<GraphHttpClient>, page_size: u32) -> Self {
        Self {
            directory,
            outlook,
            page_size,
        }
    }

    fn versioned(path: &str) -> String {
        let separator = if path.contains('?') { '&' } else { '?' };
        format!("{}{}api-version={}", path, separator, LEGACY_API_VERSION)
    }

    /// Paging links are returned relative and without the api version
    fn next_path(link: &str) -> String {
        if link.contains("api-version=") {
            link.to_string()
        } else {
            Self::versioned(link)
        }
    }

    async fn get_all_legacy_pages<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut next = Some(Self::versioned(path));

        while let Some(current) = next {
            let page: ODataPage<T> = self
                .directory
                .call_json(ApiMethod::Get, &current, None, TokenScope::App)
                .await?;
            items.extend(page.value);
            next = page.next_link.as_deref().map(Self::next_path);
        }

        Ok(items)
    }

    async fn list_links(&self, group_id: &str, relation: &str) -> Result<Vec<String>> {
        let links: Vec<LinkEntry> = self
            .get_all_legacy_pages(&format!("groups/{}/$links/{}", group_id, relation))
            .await?;

        links
            .into_iter()
            .map(|link| {
                id_from_link(&link.url)
                    .ok_or_else(|| GraphError::decode(format!("unrecognised link {}", link.url)))
            })
            .collect()
    }

    async fn add_link(&self, group_id: &str, relation: &str, user_id: &str) -> Result<()> {
        let path = Self::versioned(&format!("groups/{}/$links/{}", group_id, relation));
        let body = json!({
            "url": format!("{}/directoryObjects/{}", self.directory.base_url(), user_id)
        });
        self.directory
            .call(ApiMethod::Post, &path, Some(&body), TokenScope::App)
            .await?;
        Ok(())
    }

    async fn remove_link(&self, group_id: &str, relation: &str, user_id: &str) -> Result<()> {
        let path = Self::versioned(&format!("groups/{}/$links/{}/{}", group_id, relation, user_id));
        self.directory
            .call(ApiMethod::Delete, &path, None, TokenScope::App)
            .await?;
        Ok(())
    }

    fn events_path(target: &CalendarTarget) -> String {
        match target.scope {
            TokenScope::User(_) => "/me/events".to_string(),
            TokenScope::App => format!("/users/{}/events", target.remote_user),
        }
    }

    fn outlook_attendees(attendees: &[Attendee]) -> serde_json::Value {
        let items: Vec<serde_json::Value> = attendees
            .iter()
            .map(|a| {
                json!({
                    "EmailAddress": {
                        "Address": a.email_address.address,
                        "Name": a.email_address.name,
                    },
                    "Type": "Required",
                })
            })
            .collect();
        json!(items)
    }

    fn outlook_event(event: &NewEvent) -> serde_json::Value {
        json!({
            "Subject": event.subject,
            "Body": {
                "ContentType": event.body.content_type,
                "Content": event.body.content,
            },
            "Start": {"DateTime": event.start.date_time, "TimeZone": event.start.time_zone},
            "End": {"DateTime": event.end.date_time, "TimeZone": event.end.time_zone},
            "Attendees": Self::outlook_attendees(&event.attendees),
        })
    }
}

#[async_trait]
impl DirectoryClient for LegacyDirectoryClient {
    fn api_name(&self) -> &'static str {
        "legacy"
    }

    fn calendar_auth(&self) -> &Arc<AuthManager> {
        &self.outlook.auth
    }

    fn app_credentials_available(&self) -> bool {
        self.directory.auth.has_app_credentials()
    }

    async fn get_group(&self, group_id: &str) -> Result<RemoteGroup> {
        self.directory
            .call_json(
                ApiMethod::Get,
                &Self::versioned(&format!("groups/{}", group_id)),
                None,
                TokenScope::App,
            )
            .await
    }

    async fn create_group(&self, group: &NewGroup) -> Result<RemoteGroup> {
        // Only security groups can be provisioned through this API.
        let body = json!({
            "displayName": group.display_name,
            "mailNickname": group.mail_nickname,
            "description": group.description,
            "mailEnabled": false,
            "securityEnabled": true,
        });
        let created: RemoteGroup = self
            .directory
            .call_json(ApiMethod::Post, &Self::versioned("groups"), Some(&body), TokenScope::App)
            .await?;
        if created.id.is_empty() {
            return Err(GraphError::decode("created group has no objectId"));
        }

        for owner in &group.owners {
            self.add_link(&created.id, "owners", owner).await?;
        }
        Ok(created)
    }

    async fn delete_group(&self, group_id: &str) -> Result<()> {
        self.directory
            .call(
                ApiMethod::Delete,
                &Self::versioned(&format!("groups/{}", group_id)),
                None,
                TokenScope::App,
            )
            .await?;
        Ok(())
    }

    async fn is_group_in_deleted_items(&self, _group_id: &str) -> Result<bool> {
        Err(GraphError::Unsupported("deleted items lookup"))
    }

    async fn restore_group(&self, _group_id: &str) -> Result<()> {
        Err(GraphError::Unsupported("group restore"))
    }

    async fn list_group_members(&self, group_id: &str) -> Result<Vec<String>> {
        self.list_links(group_id, "members").await
    }

    async fn list_group_owners(&self, group_id: &str) -> Result<Vec<String>> {
        self.list_links(group_id, "owners").await
    }

    async fn add_group_member(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.add_link(group_id, "members", user_id).await
    }

    async fn remove_group_member(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.remove_link(group_id, "members", user_id).await
    }

    async fn add_group_owner(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.add_link(group_id, "owners", user_id).await
    }

    async fn remove_group_owner(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.remove_link(group_id, "owners", user_id).await
    }

    async fn create_event(&self, target: &CalendarTarget, event: &NewEvent) -> Result<RemoteEvent> {
        let body = Self::outlook_event(event);
        let created: RemoteEvent = self
            .outlook
            .call_json(ApiMethod::Post, &Self::events_path(target), Some(&body), target.scope)
            .await?;
        if created.id.is_empty() {
            return Err(GraphError::decode("created event has no Id"));
        }
        Ok(created)
    }

    async fn update_event_attendees(
        &self,
        target: &CalendarTarget,
        event_id: &str,
        attendees: &[Attendee],
    ) -> Result<()> {
        let path = format!("{}/{}", Self::events_path(target), event_id);
        let body = json!({ "Attendees": Self::outlook_attendees(attendees) });
        self.outlook
            .call(ApiMethod::Merge, &path, Some(&body), target.scope)
            .await?;
        Ok(())
    }

    async fn delete_event(&self, target: &CalendarTarget, event_id: &str) -> Result<()> {
        let path = format!("{}/{}", Self::events_path(target), event_id);
        self.outlook
            .call(ApiMethod::Delete, &path, None, target.scope)
            .await?;
        Ok(())
    }

    async fn list_events_since(
        &self,
        target: &CalendarTarget,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemoteEvent>> {
        let filter = format!(
            "LastModifiedDateTime ge {}",
            since.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let path = ListParams::new()
            .filter(filter)
            .top(self.page_size)
            .apply(&Self::events_path(target));
        self.outlook.get_all_pages(&path, target.scope).await
    }

    async fn fetch_users_page(
        &self,
        mode: PullMode,
        skip_token: Option<&str>,
        delta_token: Option<&str>,
    ) -> Result<UserPage> {
        let path = match mode {
            PullMode::Full => {
                let mut params = ListParams::new()
                    .top(self.page_size)
                    .api_version(LEGACY_API_VERSION);
                if let Some(token) = skip_token {
                    params = params.skip_token(token);
                }
                params.apply("users")
            }
            PullMode::Delta => {
                // The change feed carries both continuation and resume
                // positions in the same `deltaLink` parameter.
                let position = skip_token.or(delta_token).unwrap_or_default();
                format!(
                    "users?api-version={}&deltaLink={}",
                    LEGACY_API_VERSION,
                    encode_query_value(position)
                )
            }
        };

        debug!("Fetching users page: {}", path);
        let page: ODataPage<RemoteUser> = self
            .directory
            .call_json(ApiMethod::Get, &path, None, TokenScope::App)
            .await?;

        let link_token = |link: &str, name: &str| {
            let absolute = if link.starts_with("http") {
                link.to_string()
            } else {
                format!("{}/{}", self.directory.base_url(), link.trim_start_matches('/'))
            };
            token_from_link(&absolute, name)
        };

        let (skip, delta) = match mode {
            PullMode::Full => (
                page.next_link.as_deref().and_then(|l| link_token(l, "$skiptoken")),
                None,
            ),
            PullMode::Delta => (
                page.next_link.as_deref().and_then(|l| link_token(l, "deltaLink")),
                page.delta_link.as_deref().and_then(|l| link_token(l, "deltaLink")),
            ),
        };

        Ok(UserPage {
            users: page.value,
            skip_token: skip,
            delta_token: delta,
        })
    }
}
