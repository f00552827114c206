//! Microsoft Graph (v1.0) implementation of [`DirectoryClient`]

use super::{
    auth::{AuthManager, TokenScope},
    client::{ApiMethod, GraphHttpClient},
    directory::{CalendarTarget, DirectoryClient, DirectoryObject},
    error::*,
    types::*,
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

const USER_FIELDS: &str = "id,userPrincipalName,mail,displayName,givenName,surname,accountEnabled";
const GROUP_FIELDS: &str = "id,displayName,mailNickname,description,groupTypes";

pub struct UnifiedDirectoryClient {
    http: Arc<GraphHttpClient>,
    page_size: u32,
}

impl UnifiedDirectoryClient {
    pub fn new(http: Arc<GraphHttpClient>, page_size: u32) -> Self {
        Self { http, page_size }
    }

    fn object_ref(&self, id: &str) -> serde_json::Value {
        json!({ "@odata.id": format!("{}/directoryObjects/{}", self.http.base_url(), id) })
    }

    fn events_path(target: &CalendarTarget) -> String {
        match target.scope {
            TokenScope::User(_) => "/me/events".to_string(),
            TokenScope::App => format!("/users/{}/events", target.remote_user),
        }
    }

    async fn list_ids(&self, path: &str) -> Result<Vec<String>> {
        let objects: Vec<DirectoryObject> = self.http.get_all_pages(path, TokenScope::App).await?;
        Ok(objects.into_iter().map(|o| o.id).collect())
    }

    async fn add_link(&self, group_id: &str, relation: &str, user_id: &str) -> Result<()> {
        let path = format!("/groups/{}/{}/$ref", group_id, relation);
        let body = self.object_ref(user_id);
        self.http
            .call(ApiMethod::Post, &path, Some(&body), TokenScope::App)
            .await?;
        Ok(())
    }

    async fn remove_link(&self, group_id: &str, relation: &str, user_id: &str) -> Result<()> {
        let path = format!("/groups/{}/{}/{}/$ref", group_id, relation, user_id);
        self.http
            .call(ApiMethod::Delete, &path, None, TokenScope::App)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DirectoryClient for UnifiedDirectoryClient {
    fn api_name(&self) -> &'static str {
        "unified"
    }

    fn calendar_auth(&self) -> &Arc<AuthManager> {
        &self.http.auth
    }

    fn app_credentials_available(&self) -> bool {
        self.http.auth.has_app_credentials()
    }

    async fn get_group(&self, group_id: &str) -> Result<RemoteGroup> {
        let path = ListParams::new()
            .select(GROUP_FIELDS)
            .apply(&format!("/groups/{}", group_id));
        self.http
            .call_json(ApiMethod::Get, &path, None, TokenScope::App)
            .await
    }

    async fn create_group(&self, group: &NewGroup) -> Result<RemoteGroup> {
        let mut body = serde_json::to_value(group)?;
        if !group.owners.is_empty() {
            let owners: Vec<String> = group
                .owners
                .iter()
                .map(|id| format!("{}/users/{}", self.http.base_url(), id))
                .collect();
            body["owners@odata.bind"] = json!(owners);
        }

        let created: RemoteGroup = self
            .http
            .call_json(ApiMethod::Post, "/groups", Some(&body), TokenScope::App)
            .await?;
        if created.id.is_empty() {
            return Err(GraphError::decode("created group has no id"));
        }
        Ok(created)
    }

    async fn delete_group(&self, group_id: &str) -> Result<()> {
        self.http
            .call(
                ApiMethod::Delete,
                &format!("/groups/{}", group_id),
                None,
                TokenScope::App,
            )
            .await?;
        Ok(())
    }

    async fn is_group_in_deleted_items(&self, group_id: &str) -> Result<bool> {
        let path = format!("/directory/deletedItems/{}", group_id);
        match self
            .http
            .call(ApiMethod::Get, &path, None, TokenScope::App)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn restore_group(&self, group_id: &str) -> Result<()> {
        let path = format!("/directory/deletedItems/{}/restore", group_id);
        self.http
            .call(ApiMethod::Post, &path, None, TokenScope::App)
            .await?;
        Ok(())
    }

    async fn list_group_members(&self, group_id: &str) -> Result<Vec<String>> {
        let path = ListParams::new()
            .select("id")
            .top(self.page_size)
            .apply(&format!("/groups/{}/members", group_id));
        self.list_ids(&path).await
    }

    async fn list_group_owners(&self, group_id: &str) -> Result<Vec<String>> {
        let path = ListParams::new()
            .select("id")
            .top(self.page_size)
            .apply(&format!("/groups/{}/owners", group_id));
        self.list_ids(&path).await
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
        let body = serde_json::to_value(event)?;
        let created: RemoteEvent = self
            .http
            .call_json(
                ApiMethod::Post,
                &Self::events_path(target),
                Some(&body),
                target.scope,
            )
            .await?;
        if created.id.is_empty() {
            return Err(GraphError::decode("created event has no id"));
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
        let body = json!({ "attendees": attendees });
        self.http
            .call(ApiMethod::Patch, &path, Some(&body), target.scope)
            .await?;
        Ok(())
    }

    async fn delete_event(&self, target: &CalendarTarget, event_id: &str) -> Result<()> {
        let path = format!("{}/{}", Self::events_path(target), event_id);
        self.http
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
            "lastModifiedDateTime ge {}",
            since.to_rfc3339_opts(SecondsFormat::Secs, true)
        );
        let path = ListParams::new()
            .filter(filter)
            .top(self.page_size)
            .apply(&Self::events_path(target));
        self.http.get_all_pages(&path, target.scope).await
    }

    async fn fetch_users_page(
        &self,
        mode: PullMode,
        skip_token: Option<&str>,
        delta_token: Option<&str>,
    ) -> Result<UserPage> {
        let base = match mode {
            PullMode::Full => "/users",
            PullMode::Delta => "/users/delta",
        };

        let mut params = ListParams::new().select(USER_FIELDS);
        if mode == PullMode::Full {
            params = params.top(self.page_size);
        }
        if let Some(token) = skip_token {
            params = params.skip_token(token);
        } else if let (PullMode::Delta, Some(token)) = (mode, delta_token) {
            params = params.delta_token(token);
        }

        let path = params.apply(base);
        debug!("Fetching users page: {}", path);
        let page: ODataPage<RemoteUser> = self
            .http
            .call_json(ApiMethod::Get, &path, None, TokenScope::App)
            .await?;

        Ok(UserPage {
            users: page.value,
            skip_token: page
                .next_link
                .as_deref()
                .and_then(|link| token_from_link(link, "$skiptoken")),
            delta_token: page
                .delta_link
                .as_deref()
                .and_then(|link| token_from_link(link, "$deltatoken")),
        })
    }
}
