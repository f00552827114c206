//! Directory client abstraction and the factory selecting its variant

use super::{
    auth::{AppCredentials, AuthManager, TokenScope, DEFAULT_LOGIN_BASE},
    client::GraphHttpClientBuilder,
    error::*,
    legacy::LegacyDirectoryClient,
    types::*,
    unified::UnifiedDirectoryClient,
};
use crate::Configuration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::{sync::Arc, time::Duration};
use tracing::info;

/// Mailbox a calendar call acts on and the credential used for it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalendarTarget {
    pub scope: TokenScope,
    /// Remote id or UPN of the mailbox owner; used when acting app-only
    pub remote_user: String,
}

/// Minimal directory object, as returned by membership listings
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct DirectoryObject {
    #[serde(alias = "objectId")]
    pub id: String,
}

/// Operations the reconcilers need from the remote directory
///
/// Group and user operations always use the application credential.
/// Calendar operations use the credential named by their [`CalendarTarget`].
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    fn api_name(&self) -> &'static str;

    /// Credential source for calendar calls
    fn calendar_auth(&self) -> &Arc<AuthManager>;

    /// Whether group and user calls can obtain an application token
    fn app_credentials_available(&self) -> bool;

    async fn get_group(&self, group_id: &str) -> Result<RemoteGroup>;
    async fn create_group(&self, group: &NewGroup) -> Result<RemoteGroup>;
    async fn delete_group(&self, group_id: &str) -> Result<()>;
    /// Whether the id is still present in the remote recycle bin
    async fn is_group_in_deleted_items(&self, group_id: &str) -> Result<bool>;
    async fn restore_group(&self, group_id: &str) -> Result<()>;

    async fn list_group_members(&self, group_id: &str) -> Result<Vec<String>>;
    async fn list_group_owners(&self, group_id: &str) -> Result<Vec<String>>;
    async fn add_group_member(&self, group_id: &str, user_id: &str) -> Result<()>;
    async fn remove_group_member(&self, group_id: &str, user_id: &str) -> Result<()>;
    async fn add_group_owner(&self, group_id: &str, user_id: &str) -> Result<()>;
    async fn remove_group_owner(&self, group_id: &str, user_id: &str) -> Result<()>;

    async fn create_event(&self, target: &CalendarTarget, event: &NewEvent) -> Result<RemoteEvent>;
    async fn update_event_attendees(
        &self,
        target: &CalendarTarget,
        event_id: &str,
        attendees: &[Attendee],
    ) -> Result<()>;
    async fn delete_event(&self, target: &CalendarTarget, event_id: &str) -> Result<()>;
    async fn list_events_since(
        &self,
        target: &CalendarTarget,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemoteEvent>>;

    /// Fetch one page of users
    ///
    /// `skip_token` continues a page sequence and wins over `delta_token`,
    /// which resumes the change feed.
    async fn fetch_users_page(
        &self,
        mode: PullMode,
        skip_token: Option<&str>,
        delta_token: Option<&str>,
    ) -> Result<UserPage>;
}

/// Connection settings shared by both client variants
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub credentials: Option<AppCredentials>,
    pub login_base: String,
    /// Replaces every API base URL; used against mock servers
    pub endpoint_override: Option<String>,
    pub timeout: Duration,
    pub pacing: Duration,
    pub page_size: u32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            credentials: None,
            login_base: DEFAULT_LOGIN_BASE.to_string(),
            endpoint_override: None,
            timeout: Duration::from_secs(30),
            pacing: Duration::from_millis(50),
            page_size: 100,
        }
    }
}

pub const LEGACY_DIRECTORY_RESOURCE: &str = "https://graph.windows.net";
pub const OUTLOOK_RESOURCE: &str = "https://outlook.office.com";

/// Build the directory client selected by `config.use_unified_api`
///
/// The choice is made once here; callers hold the trait object.
pub fn build_directory_client(
    config: &Configuration,
    settings: &ClientSettings,
) -> Result<Arc<dyn DirectoryClient>> {
    if !config.is_configured() {
        return Err(GraphError::NotConfigured);
    }

    let auth_for = |resource: &str| {
        Arc::new(
            AuthManager::new(
                reqwest::Client::new(),
                config.tenant_id.clone(),
                resource,
                settings.credentials.clone(),
                config.app_only_credentials_enabled,
            )
            .with_login_base(settings.login_base.clone()),
        )
    };
    let http_for = |base: String, auth: Arc<AuthManager>| {
        GraphHttpClientBuilder::new(base)
            .timeout(settings.timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent("o365-sync/0.1.0")
            .pacing(settings.pacing)
            .build(auth)
            .map(Arc::new)
    };

    if config.use_unified_api {
        let resource = config.api_base_resource.trim_end_matches('/');
        let base = settings
            .endpoint_override
            .clone()
            .unwrap_or_else(|| format!("{}/v1.0", resource));
        let http = http_for(base, auth_for(resource))?;
        info!("Using unified directory API at {}", http.base_url());
        Ok(Arc::new(UnifiedDirectoryClient::new(http, settings.page_size)))
    } else {
        let directory_base = settings
            .endpoint_override
            .clone()
            .unwrap_or_else(|| format!("{}/{}", LEGACY_DIRECTORY_RESOURCE, config.tenant_id));
        let outlook_base = settings
            .endpoint_override
            .clone()
            .unwrap_or_else(|| format!("{}/api/v2.0", OUTLOOK_RESOURCE));
        let directory = http_for(directory_base, auth_for(LEGACY_DIRECTORY_RESOURCE))?;
        let outlook = http_for(outlook_base, auth_for(OUTLOOK_RESOURCE))?;
        info!("Using legacy directory API at {}", directory.base_url());
        Ok(Arc::new(LegacyDirectoryClient::new(
            directory,
            outlook,
            settings.page_size,
        )))
    }
}

/// Percent-encode a value for use inside a query string
pub(crate) fn encode_query_value(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}
