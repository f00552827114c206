//! Local records and the cross-system link tables

use chrono::{DateTime, Duration, Utc};
use o365_sync_core::api::PullMode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use uuid::Uuid;

/// Identifier of a local record
pub type LocalId = u64;

const SOFT_DELETE_FLAG: &str = "softdelete";
const DISCONNECTED_FLAG: &str = "disconnected";
const UPN_FIELD: &str = "upn";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    User,
    Group,
}

/// Which local concept a group mapping stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectSubtype {
    /// Group mirroring a course's enrolment
    Course,
    /// Group mirroring a local group inside a course
    UserGroup,
    /// Team-backed group of a course; cannot exist without an owner
    CourseTeam,
    /// Contributor group of a course's site
    CourseSite,
}

impl ObjectSubtype {
    /// Subtypes attached directly to a course id
    pub const COURSE_LEVEL: [ObjectSubtype; 3] = [
        ObjectSubtype::Course,
        ObjectSubtype::CourseTeam,
        ObjectSubtype::CourseSite,
    ];

    pub fn requires_owner(self) -> bool {
        matches!(self, ObjectSubtype::CourseTeam)
    }

    /// Contributor groups have their membership driven by capabilities only
    pub fn manages_owners(self) -> bool {
        !matches!(self, ObjectSubtype::CourseSite)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ObjectSubtype::Course => "course",
            ObjectSubtype::UserGroup => "usergroup",
            ObjectSubtype::CourseTeam => "courseteam",
            ObjectSubtype::CourseSite => "coursesite",
        }
    }
}

impl fmt::Display for ObjectSubtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a mapping: one active mapping per key at most
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MappingKey {
    pub object_type: ObjectType,
    pub subtype: Option<ObjectSubtype>,
    pub local_id: LocalId,
}

impl MappingKey {
    pub fn user(local_id: LocalId) -> Self {
        Self {
            object_type: ObjectType::User,
            subtype: None,
            local_id,
        }
    }

    pub fn group(subtype: ObjectSubtype, local_id: LocalId) -> Self {
        Self {
            object_type: ObjectType::Group,
            subtype: Some(subtype),
            local_id,
        }
    }
}

impl fmt::Display for MappingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.subtype {
            Some(subtype) => write!(f, "{:?}/{}/{}", self.object_type, subtype, self.local_id),
            None => write!(f, "{:?}/{}", self.object_type, self.local_id),
        }
    }
}

/// Link between a local record and a remote directory object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMapping {
    pub object_type: ObjectType,
    pub subtype: Option<ObjectSubtype>,
    pub local_id: LocalId,
    pub remote_id: String,
    pub display_name: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl ObjectMapping {
    pub fn new(key: MappingKey, remote_id: impl Into<String>, display_name: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            object_type: key.object_type,
            subtype: key.subtype,
            local_id: key.local_id,
            remote_id: remote_id.into(),
            display_name,
            metadata: Map::new(),
            created_at: now,
            modified_at: now,
        }
    }

    /// User mapping carrying the remote principal name
    pub fn for_user(local_id: LocalId, remote_id: impl Into<String>, upn: Option<String>) -> Self {
        let mut mapping = Self::new(MappingKey::user(local_id), remote_id, upn.clone());
        if let Some(upn) = upn {
            mapping.metadata.insert(UPN_FIELD.to_string(), Value::String(upn));
        }
        mapping
    }

    pub fn key(&self) -> MappingKey {
        MappingKey {
            object_type: self.object_type,
            subtype: self.subtype,
            local_id: self.local_id,
        }
    }

    pub fn is_soft_deleted(&self) -> bool {
        self.flag(SOFT_DELETE_FLAG)
    }

    /// Soft-deleted because the course was disconnected, not because the
    /// remote object went away
    pub fn is_disconnected(&self) -> bool {
        self.flag(DISCONNECTED_FLAG)
    }

    pub fn set_soft_deleted(&mut self, deleted: bool) {
        self.set_flag(SOFT_DELETE_FLAG, deleted);
        if !deleted {
            self.metadata.remove(DISCONNECTED_FLAG);
        }
    }

    pub fn mark_disconnected(&mut self) {
        self.set_flag(SOFT_DELETE_FLAG, true);
        self.set_flag(DISCONNECTED_FLAG, true);
    }

    pub fn upn(&self) -> Option<&str> {
        self.metadata.get(UPN_FIELD).and_then(Value::as_str)
    }

    fn flag(&self, name: &str) -> bool {
        self.metadata
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn set_flag(&mut self, name: &str, value: bool) {
        if value {
            self.metadata.insert(name.to_string(), Value::Bool(true));
        } else {
            self.metadata.remove(name);
        }
        self.modified_at = Utc::now();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEventMapping {
    pub local_event_id: LocalId,
    pub remote_event_id: String,
    pub origin: EventOrigin,
    pub owning_user_id: LocalId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScopeType {
    Site,
    Course,
    User,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncDirection {
    Out,
    In,
    Both,
}

impl SyncDirection {
    pub fn pushes(self) -> bool {
        matches!(self, SyncDirection::Out | SyncDirection::Both)
    }

    pub fn pulls(self) -> bool {
        matches!(self, SyncDirection::In | SyncDirection::Both)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarSubscription {
    pub user_id: LocalId,
    pub scope_type: ScopeType,
    pub scope_id: LocalId,
    pub sync_direction: SyncDirection,
}

/// Which resumable sequence a cursor belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CursorKey {
    UserFull,
    UserDelta,
    CalendarInbound,
    CalendarScope(ScopeType, LocalId),
}

impl CursorKey {
    pub fn for_mode(mode: PullMode) -> Self {
        match mode {
            PullMode::Full => CursorKey::UserFull,
            PullMode::Delta => CursorKey::UserDelta,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub skip_token: Option<String>,
    pub delta_token: Option<String>,
    pub last_run: Option<DateTime<Utc>>,
}

impl SyncCursor {
    pub fn clear_tokens(&mut self) {
        self.skip_token = None;
        self.delta_token = None;
    }
}

/// Deferred capability reconciliation; `None` fields are wildcards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessSyncJob {
    pub id: Uuid,
    pub role_id: Option<LocalId>,
    pub user_id: Option<LocalId>,
    pub context_id: Option<LocalId>,
    pub queued_at: DateTime<Utc>,
}

impl AccessSyncJob {
    pub fn new(role_id: Option<LocalId>, user_id: Option<LocalId>, context_id: Option<LocalId>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role_id,
            user_id,
            context_id,
            queued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalUser {
    pub id: LocalId,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub suspended: bool,
}

/// Imported events take ids above this, clear of platform-assigned ids
pub const IMPORTED_EVENT_ID_BASE: LocalId = 1 << 48;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalEvent {
    pub id: LocalId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub start: DateTime<Utc>,
    #[serde(default)]
    pub duration_secs: i64,
    pub scope_type: ScopeType,
    pub scope_id: LocalId,
    pub owner_user_id: LocalId,
    /// Created by the inbound importer; never pushed back out
    #[serde(default)]
    pub imported: bool,
}

impl LocalEvent {
    pub fn end(&self) -> DateTime<Utc> {
        self.start + Duration::seconds(self.duration_secs.max(0))
    }
}

/// Fields of a local event about to be created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLocalEvent {
    pub name: String,
    pub description: String,
    pub start: DateTime<Utc>,
    pub duration_secs: i64,
    pub scope_type: ScopeType,
    pub scope_id: LocalId,
    pub owner_user_id: LocalId,
    pub imported: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextLevel {
    Site,
    Category,
    Course,
}

/// Node of the permission context tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub id: LocalId,
    pub level: ContextLevel,
    #[serde(default)]
    pub parent_id: Option<LocalId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Course {
    pub id: LocalId,
    pub name: String,
    pub context_id: LocalId,
    /// Overrides the site-wide reset behaviour for this course
    #[serde(default)]
    pub reset_action: Option<o365_sync_core::CourseResetAction>,
}

/// Group of users inside a course
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalGroup {
    pub id: LocalId,
    pub course_id: LocalId,
    pub name: String,
    #[serde(default)]
    pub members: Vec<LocalId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enrolment {
    pub course_id: LocalId,
    pub user_id: LocalId,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Role {
    pub id: LocalId,
    pub name: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub role_id: LocalId,
    pub user_id: LocalId,
    pub context_id: LocalId,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_delete_flag_lives_in_metadata() {
        let mut mapping = ObjectMapping::new(
            MappingKey::group(ObjectSubtype::Course, 4),
            "g-4",
            Some("Biology".to_string()),
        );
        assert!(!mapping.is_soft_deleted());

        mapping.mark_disconnected();
        assert!(mapping.is_soft_deleted());
        assert!(mapping.is_disconnected());
        assert_eq!(mapping.metadata.get("softdelete"), Some(&Value::Bool(true)));

        mapping.set_soft_deleted(false);
        assert!(!mapping.is_soft_deleted());
        assert!(!mapping.is_disconnected());
    }

    #[test]
    fn test_user_mapping_keeps_upn() {
        let mapping = ObjectMapping::for_user(9, "u-9", Some("nine@contoso.com".to_string()));
        assert_eq!(mapping.key(), MappingKey::user(9));
        assert_eq!(mapping.upn(), Some("nine@contoso.com"));
    }

    #[test]
    fn test_subtype_serializes_lowercase() {
        let json = serde_json::to_string(&ObjectSubtype::CourseTeam).unwrap();
        assert_eq!(json, "\"courseteam\"");
        assert!(ObjectSubtype::CourseTeam.requires_owner());
        assert!(!ObjectSubtype::CourseSite.manages_owners());
    }

    #[test]
    fn test_direction_predicates() {
        assert!(SyncDirection::Both.pushes() && SyncDirection::Both.pulls());
        assert!(!SyncDirection::In.pushes());
        assert!(!SyncDirection::Out.pulls());
    }

    #[test]
    fn test_event_end_never_precedes_start() {
        let event = LocalEvent {
            id: 1,
            name: "Exam".to_string(),
            description: String::new(),
            start: Utc::now(),
            duration_secs: -30,
            scope_type: ScopeType::Course,
            scope_id: 2,
            owner_user_id: 3,
            imported: false,
        };
        assert_eq!(event.end(), event.start);
    }
}
