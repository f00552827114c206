use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Paginated collection response
///
/// Covers both the Microsoft Graph (`@odata.*`) and the Azure AD Graph
/// (`odata.*` / `aad.*`) paging annotations.
#[derive(Debug, Clone, Deserialize)]
pub struct ODataPage<T> {
    #[serde(default = "Vec::new")]
    pub value: Vec<T>,
    #[serde(rename = "@odata.nextLink", alias = "odata.nextLink", alias = "aad.nextLink")]
    pub next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink", alias = "aad.deltaLink")]
    pub delta_link: Option<String>,
}

/// Error body returned by the remote API
#[derive(Debug, Deserialize)]
pub struct ODataError {
    pub error: ODataErrorBody,
}

#[derive(Debug, Deserialize)]
pub struct ODataErrorBody {
    pub code: String,
    pub message: String,
}

/// Extract `(code, message)` from either error dialect
///
/// Graph: `{"error": {"code", "message"}}`.
/// Azure AD Graph: `{"odata.error": {"code", "message": {"value"}}}`.
pub fn parse_error_body(body: &str) -> Option<(String, String)> {
    if let Ok(error) = serde_json::from_str::<ODataError>(body) {
        return Some((error.error.code, error.error.message));
    }

    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = value.get("odata.error")?;
    let code = error.get("code")?.as_str()?.to_string();
    let message = error
        .get("message")
        .and_then(|m| m.get("value").or(Some(m)))
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();
    Some((code, message))
}

/// Reference to a directory object, used when binding members and owners
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryObjectRef {
    #[serde(rename = "@odata.id")]
    pub odata_id: String,
}

/// Marker on delta entries that were removed from the directory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemovedMarker {
    pub reason: String,
}

/// Directory user
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteUser {
    #[serde(alias = "objectId")]
    pub id: String,
    pub user_principal_name: Option<String>,
    pub mail: Option<String>,
    pub display_name: Option<String>,
    pub given_name: Option<String>,
    pub surname: Option<String>,
    pub account_enabled: Option<bool>,
    #[serde(rename = "@removed", default, skip_serializing_if = "Option::is_none")]
    pub removed: Option<RemovedMarker>,
    #[serde(rename = "aad.isDeleted", default)]
    pub legacy_deleted: bool,
}

impl RemoteUser {
    /// True for change-feed entries describing a deleted user
    pub fn is_removed(&self) -> bool {
        self.removed.is_some() || self.legacy_deleted
    }
}

/// Directory group
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteGroup {
    #[serde(alias = "objectId")]
    pub id: String,
    pub display_name: Option<String>,
    pub mail_nickname: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub group_types: Vec<String>,
}

/// Body of a group creation request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewGroup {
    pub display_name: String,
    pub mail_nickname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub mail_enabled: bool,
    pub security_enabled: bool,
    pub group_types: Vec<String>,
    /// Remote user ids bound as owners at creation time
    #[serde(skip)]
    pub owners: Vec<String>,
}

impl NewGroup {
    /// Unified (Microsoft 365) group with a nickname derived from the display name
    pub fn unified(display_name: impl Into<String>) -> Self {
        let display_name = display_name.into();
        let mail_nickname = mail_nickname_for(&display_name);
        Self {
            display_name,
            mail_nickname,
            description: None,
            mail_enabled: true,
            security_enabled: false,
            group_types: vec!["Unified".to_string()],
            owners: Vec::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn owners(mut self, owners: Vec<String>) -> Self {
        self.owners = owners;
        self
    }
}

/// Mail nicknames only allow ASCII alphanumerics, `-` and `_`, max 64 chars
pub fn mail_nickname_for(display_name: &str) -> String {
    let nickname: String = display_name
        .chars()
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                Some(c.to_ascii_lowercase())
            } else if c.is_whitespace() {
                Some('_')
            } else {
                None
            }
        })
        .take(64)
        .collect();

    if nickname.is_empty() {
        "group".to_string()
    } else {
        nickname
    }
}

/// Date-time as exchanged with the calendar API
///
/// Graph returns `dateTime` without an offset; the accompanying `timeZone`
/// is always requested as UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateTimeTimeZone {
    #[serde(alias = "DateTime")]
    pub date_time: String,
    #[serde(alias = "TimeZone")]
    pub time_zone: String,
}

impl DateTimeTimeZone {
    pub fn from_utc(value: DateTime<Utc>) -> Self {
        Self {
            date_time: value.format("%Y-%m-%dT%H:%M:%S").to_string(),
            time_zone: "UTC".to_string(),
        }
    }

    pub fn to_utc(&self) -> Option<DateTime<Utc>> {
        if let Ok(parsed) = DateTime::parse_from_rfc3339(&self.date_time) {
            return Some(parsed.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(&self.date_time, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| naive.and_utc())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemBody {
    #[serde(alias = "ContentType")]
    pub content_type: String,
    #[serde(alias = "Content")]
    pub content: String,
}

impl ItemBody {
    pub fn html(content: impl Into<String>) -> Self {
        Self {
            content_type: "HTML".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailAddress {
    #[serde(alias = "Address")]
    pub address: String,
    #[serde(alias = "Name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attendee {
    #[serde(alias = "EmailAddress")]
    pub email_address: EmailAddress,
    #[serde(rename = "type", alias = "Type")]
    pub attendee_type: String,
}

impl Attendee {
    pub fn required(address: impl Into<String>, name: Option<String>) -> Self {
        Self {
            email_address: EmailAddress {
                address: address.into(),
                name,
            },
            attendee_type: "required".to_string(),
        }
    }
}

/// Calendar event as returned by the remote API
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEvent {
    #[serde(alias = "Id")]
    pub id: String,
    #[serde(alias = "Subject", default)]
    pub subject: Option<String>,
    #[serde(alias = "Body", default)]
    pub body: Option<ItemBody>,
    #[serde(alias = "Start")]
    pub start: DateTimeTimeZone,
    #[serde(alias = "End")]
    pub end: DateTimeTimeZone,
    #[serde(alias = "LastModifiedDateTime", default)]
    pub last_modified_date_time: Option<DateTime<Utc>>,
    #[serde(alias = "IsCancelled", default)]
    pub is_cancelled: bool,
}

impl RemoteEvent {
    /// Event length in seconds, never negative
    pub fn duration_secs(&self) -> i64 {
        match (self.start.to_utc(), self.end.to_utc()) {
            (Some(start), Some(end)) => (end - start).num_seconds().max(0),
            _ => 0,
        }
    }
}

/// Body of an event creation request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEvent {
    pub subject: String,
    pub body: ItemBody,
    pub start: DateTimeTimeZone,
    pub end: DateTimeTimeZone,
    pub attendees: Vec<Attendee>,
}

/// OAuth2 token endpoint response
///
/// The resource-based (v1) endpoint encodes the numeric fields as strings.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, deserialize_with = "de_opt_secs")]
    pub expires_in: Option<i64>,
    #[serde(default, deserialize_with = "de_opt_secs")]
    pub expires_on: Option<i64>,
}

fn de_opt_secs<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrString {
        Num(i64),
        Str(String),
    }

    Ok(match Option::<NumOrString>::deserialize(deserializer)? {
        Some(NumOrString::Num(n)) => Some(n),
        Some(NumOrString::Str(s)) => s.parse().ok(),
        None => None,
    })
}

/// Query parameters for collection requests
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListParams {
    #[serde(rename = "$top", skip_serializing_if = "Option::is_none")]
    pub top: Option<u32>,
    #[serde(rename = "$select", skip_serializing_if = "Option::is_none")]
    pub select: Option<String>,
    #[serde(rename = "$filter", skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(rename = "$skiptoken", skip_serializing_if = "Option::is_none")]
    pub skip_token: Option<String>,
    #[serde(rename = "$deltatoken", skip_serializing_if = "Option::is_none")]
    pub delta_token: Option<String>,
    #[serde(rename = "api-version", skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
}

impl ListParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn top(mut self, top: u32) -> Self {
        self.top = Some(top);
        self
    }

    pub fn select(mut self, select: impl Into<String>) -> Self {
        self.select = Some(select.into());
        self
    }

    pub fn filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn skip_token(mut self, token: impl Into<String>) -> Self {
        self.skip_token = Some(token.into());
        self
    }

    pub fn delta_token(mut self, token: impl Into<String>) -> Self {
        self.delta_token = Some(token.into());
        self
    }

    pub fn api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = Some(version.into());
        self
    }

    /// Append these parameters to a path
    pub fn apply(&self, path: &str) -> String {
        let query = serde_urlencoded::to_string(self).unwrap_or_default();
        if query.is_empty() {
            path.to_string()
        } else if path.contains('?') {
            format!("{}&{}", path, query)
        } else {
            format!("{}?{}", path, query)
        }
    }
}

/// Pull mode of the user importer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PullMode {
    Full,
    Delta,
}

/// One page of directory users
#[derive(Debug, Clone, Default)]
pub struct UserPage {
    pub users: Vec<RemoteUser>,
    /// Set when more pages follow in this sequence
    pub skip_token: Option<String>,
    /// Set on the last page of a delta sequence
    pub delta_token: Option<String>,
}

/// Pull a named query parameter out of a paging link
pub fn token_from_link(link: &str, name: &str) -> Option<String> {
    let parsed = url::Url::parse(link).ok()?;
    let value = parsed
        .query_pairs()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.into_owned());
    value
}
