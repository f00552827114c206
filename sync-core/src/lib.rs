//! Core library for o365-sync
//!
//! This crate provides the remote side of the synchronization service: the
//! injected [`Configuration`] value and an authenticated client for the
//! Microsoft Graph (unified) and Azure AD Graph (legacy) directory APIs.

pub mod api;

use serde::{Deserialize, Serialize};

/// What to do with a course's remote group when the course is reset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CourseResetAction {
    /// Leave the remote group and its mapping untouched
    Nothing,
    /// Tombstone the mappings so the remote group is no longer managed
    Disconnect,
    /// Disconnect, then provision a fresh remote group for the course
    DisconnectAndRecreate,
}

impl Default for CourseResetAction {
    fn default() -> Self {
        Self::Disconnect
    }
}

/// Options consumed by the reconcilers, passed in explicitly at construction
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Master switch; nothing talks to the remote directory when false
    pub directory_enabled: bool,
    /// Resource the access tokens are issued for, e.g. `https://graph.microsoft.com`
    pub api_base_resource: String,
    pub tenant_id: String,
    /// Allow falling back to the application credential when a user has no token
    pub app_only_credentials_enabled: bool,
    /// Use Microsoft Graph instead of the legacy Azure AD Graph API
    pub use_unified_api: bool,
    /// Capability that makes a user an owner of a course group
    pub owner_capability: String,
    /// Capability that grants membership of a course's contributor group
    pub contributor_capability: String,
    pub course_reset_action: CourseResetAction,
    /// Appended to the body of every event pushed to a remote calendar
    pub calendar_body_suffix: String,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            directory_enabled: false,
            api_base_resource: "https://graph.microsoft.com".to_string(),
            tenant_id: String::new(),
            app_only_credentials_enabled: true,
            use_unified_api: default_use_unified_api(),
            owner_capability: default_owner_capability(),
            contributor_capability: default_contributor_capability(),
            course_reset_action: CourseResetAction::default(),
            calendar_body_suffix: String::new(),
        }
    }
}

impl Configuration {
    /// True when the remote directory can be reached at all
    pub fn is_configured(&self) -> bool {
        self.directory_enabled && !self.tenant_id.is_empty() && !self.api_base_resource.is_empty()
    }
}

fn default_use_unified_api() -> bool { true }
fn default_owner_capability() -> String { "course:manage".to_string() }
fn default_contributor_capability() -> String { "site:contribute".to_string() }
