//! In-process directory double and fixtures shared by the engine tests

use crate::model::*;
use crate::retry::RetryPolicy;
use crate::store::{LocalSnapshot, MemoryStore, MappingStore, StoreSnapshot};
use crate::SyncService;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use o365_sync_core::api::*;
use o365_sync_core::Configuration;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Scripted failure, turned into a fresh [`GraphError`] each time it fires
#[derive(Debug, Clone)]
pub enum Failure {
    Api { status: u16, code: &'static str },
    Decode,
}

impl Failure {
    pub fn not_found() -> Self {
        Failure::Api {
            status: 404,
            code: "Request_ResourceNotFound",
        }
    }

    pub fn forbidden() -> Self {
        Failure::Api {
            status: 403,
            code: "Authorization_RequestDenied",
        }
    }

    fn to_error(&self) -> GraphError {
        match self {
            Failure::Api { status, code } => GraphError::Api {
                status: *status,
                code: code.to_string(),
                message: "scripted failure".to_string(),
            },
            Failure::Decode => GraphError::Decode("unexpected end of input".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub target: CalendarTarget,
    pub subject: String,
    pub attendees: Vec<String>,
}

#[derive(Default)]
pub struct FakeState {
    pub groups: BTreeMap<String, RemoteGroup>,
    pub owners: BTreeMap<String, BTreeSet<String>>,
    pub members: BTreeMap<String, BTreeSet<String>>,
    /// Ids in the remote recycle bin
    pub deleted_groups: BTreeSet<String>,
    pub events: BTreeMap<String, StoredEvent>,
    /// Returned by every `list_events_since` call
    pub remote_events: Vec<RemoteEvent>,
    pub user_pages: VecDeque<std::result::Result<UserPage, Failure>>,
    /// `(mode, skip_token, delta_token)` of every user page request
    pub page_requests: Vec<(PullMode, Option<String>, Option<String>)>,
    pub calls: Vec<String>,
    failures: HashMap<String, VecDeque<Failure>>,
    next_id: u64,
}

pub struct FakeDirectory {
    pub state: Mutex<FakeState>,
    auth: Arc<AuthManager>,
    app_credentials: bool,
}

impl FakeDirectory {
    pub fn new() -> Self {
        Self::with_credentials(true)
    }

    pub fn with_credentials(app_credentials: bool) -> Self {
        let credentials = app_credentials.then(|| AppCredentials {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
        });
        let auth = AuthManager::new(
            reqwest::Client::new(),
            "contoso",
            "https://graph.microsoft.com",
            credentials,
            true,
        );
        Self {
            state: Mutex::new(FakeState::default()),
            auth: Arc::new(auth),
            app_credentials,
        }
    }

    /// Make the next `times` calls to `operation` fail
    pub fn fail_next(&self, operation: &str, failure: Failure, times: usize) {
        let mut state = self.state.lock();
        let queue = state.failures.entry(operation.to_string()).or_default();
        for _ in 0..times {
            queue.push_back(failure.clone());
        }
    }

    pub fn seed_group(&self, id: &str, owners: &[&str], members: &[&str]) {
        let mut state = self.state.lock();
        state.groups.insert(id.to_string(), remote_group(id, id));
        state
            .owners
            .insert(id.to_string(), owners.iter().map(|s| s.to_string()).collect());
        state
            .members
            .insert(id.to_string(), members.iter().map(|s| s.to_string()).collect());
    }

    pub fn owners(&self, group_id: &str) -> BTreeSet<String> {
        self.state.lock().owners.get(group_id).cloned().unwrap_or_default()
    }

    pub fn members(&self, group_id: &str) -> BTreeSet<String> {
        self.state.lock().members.get(group_id).cloned().unwrap_or_default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn calls_to(&self, operation: &str) -> usize {
        self.state.lock().calls.iter().filter(|c| *c == operation).count()
    }

    /// Calls that change remote state
    pub fn write_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| {
                !(c.starts_with("get_")
                    || c.starts_with("list_")
                    || c.starts_with("is_")
                    || c.starts_with("fetch_"))
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    fn record(&self, operation: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(operation.to_string());
        match state.failures.get_mut(operation).and_then(VecDeque::pop_front) {
            Some(failure) => Err(failure.to_error()),
            None => Ok(()),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        let mut state = self.state.lock();
        state.next_id += 1;
        format!("{}-{}", prefix, state.next_id)
    }

    fn not_found() -> GraphError {
        Failure::not_found().to_error()
    }
}

#[async_trait]
impl DirectoryClient for FakeDirectory {
    fn api_name(&self) -> &'static str {
        "fake"
    }

    fn calendar_auth(&self) -> &Arc<AuthManager> {
        &self.auth
    }

    fn app_credentials_available(&self) -> bool {
        self.app_credentials
    }

    async fn get_group(&self, group_id: &str) -> Result<RemoteGroup> {
        self.record("get_group")?;
        self.state
            .lock()
            .groups
            .get(group_id)
            .cloned()
            .ok_or_else(Self::not_found)
    }

    async fn create_group(&self, group: &NewGroup) -> Result<RemoteGroup> {
        self.record("create_group")?;
        let id = self.next_id("group");
        let created = remote_group(&id, &group.display_name);
        let mut state = self.state.lock();
        state.groups.insert(id.clone(), created.clone());
        state.owners.insert(id.clone(), group.owners.iter().cloned().collect());
        state.members.insert(id, BTreeSet::new());
        Ok(created)
    }

    async fn delete_group(&self, group_id: &str) -> Result<()> {
        self.record("delete_group")?;
        let mut state = self.state.lock();
        state.groups.remove(group_id).ok_or_else(Self::not_found)?;
        state.deleted_groups.insert(group_id.to_string());
        Ok(())
    }

    async fn is_group_in_deleted_items(&self, group_id: &str) -> Result<bool> {
        self.record("is_group_in_deleted_items")?;
        Ok(self.state.lock().deleted_groups.contains(group_id))
    }

    async fn restore_group(&self, group_id: &str) -> Result<()> {
        self.record("restore_group")?;
        let mut state = self.state.lock();
        if !state.deleted_groups.remove(group_id) {
            return Err(Self::not_found());
        }
        state.groups.insert(group_id.to_string(), remote_group(group_id, group_id));
        Ok(())
    }

    async fn list_group_members(&self, group_id: &str) -> Result<Vec<String>> {
        self.record("list_group_members")?;
        Ok(self.members(group_id).into_iter().collect())
    }

    async fn list_group_owners(&self, group_id: &str) -> Result<Vec<String>> {
        self.record("list_group_owners")?;
        Ok(self.owners(group_id).into_iter().collect())
    }

    async fn add_group_member(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.record("add_group_member")?;
        self.state
            .lock()
            .members
            .entry(group_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        Ok(())
    }

    async fn remove_group_member(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.record("remove_group_member")?;
        if let Some(members) = self.state.lock().members.get_mut(group_id) {
            members.remove(user_id);
        }
        Ok(())
    }

    async fn add_group_owner(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.record("add_group_owner")?;
        self.state
            .lock()
            .owners
            .entry(group_id.to_string())
            .or_default()
            .insert(user_id.to_string());
        Ok(())
    }

    async fn remove_group_owner(&self, group_id: &str, user_id: &str) -> Result<()> {
        self.record("remove_group_owner")?;
        if let Some(owners) = self.state.lock().owners.get_mut(group_id) {
            owners.remove(user_id);
        }
        Ok(())
    }

    async fn create_event(&self, target: &CalendarTarget, event: &NewEvent) -> Result<RemoteEvent> {
        self.record("create_event")?;
        let id = self.next_id("event");
        self.state.lock().events.insert(
            id.clone(),
            StoredEvent {
                target: target.clone(),
                subject: event.subject.clone(),
                attendees: event
                    .attendees
                    .iter()
                    .map(|a| a.email_address.address.clone())
                    .collect(),
            },
        );
        Ok(RemoteEvent {
            id,
            subject: Some(event.subject.clone()),
            body: Some(event.body.clone()),
            start: event.start.clone(),
            end: event.end.clone(),
            last_modified_date_time: Some(Utc::now()),
            is_cancelled: false,
        })
    }

    async fn update_event_attendees(
        &self,
        _target: &CalendarTarget,
        event_id: &str,
        attendees: &[Attendee],
    ) -> Result<()> {
        self.record("update_event_attendees")?;
        let mut state = self.state.lock();
        let event = state.events.get_mut(event_id).ok_or_else(Self::not_found)?;
        event.attendees = attendees.iter().map(|a| a.email_address.address.clone()).collect();
        Ok(())
    }

    async fn delete_event(&self, _target: &CalendarTarget, event_id: &str) -> Result<()> {
        self.record("delete_event")?;
        self.state
            .lock()
            .events
            .remove(event_id)
            .map(|_| ())
            .ok_or_else(Self::not_found)
    }

    async fn list_events_since(
        &self,
        _target: &CalendarTarget,
        since: DateTime<Utc>,
    ) -> Result<Vec<RemoteEvent>> {
        self.record("list_events_since")?;
        Ok(self
            .state
            .lock()
            .remote_events
            .iter()
            .filter(|e| e.last_modified_date_time.map(|m| m >= since).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn fetch_users_page(
        &self,
        mode: PullMode,
        skip_token: Option<&str>,
        delta_token: Option<&str>,
    ) -> Result<UserPage> {
        self.record("fetch_users_page")?;
        let mut state = self.state.lock();
        state.page_requests.push((
            mode,
            skip_token.map(str::to_string),
            delta_token.map(str::to_string),
        ));
        match state.user_pages.pop_front() {
            Some(Ok(page)) => Ok(page),
            Some(Err(failure)) => Err(failure.to_error()),
            None => Ok(UserPage::default()),
        }
    }
}

fn remote_group(id: &str, name: &str) -> RemoteGroup {
    RemoteGroup {
        id: id.to_string(),
        display_name: Some(name.to_string()),
        mail_nickname: Some(mail_nickname_for(name)),
        description: None,
        group_types: vec!["Unified".to_string()],
    }
}

pub fn create_test_remote_user(id: &str, upn: &str) -> RemoteUser {
    RemoteUser {
        id: id.to_string(),
        user_principal_name: Some(upn.to_string()),
        mail: Some(upn.to_string()),
        display_name: None,
        given_name: None,
        surname: None,
        account_enabled: Some(true),
        removed: None,
        legacy_deleted: false,
    }
}

pub fn create_test_remote_event(id: &str, subject: &str, start: DateTime<Utc>, minutes: i64) -> RemoteEvent {
    RemoteEvent {
        id: id.to_string(),
        subject: Some(subject.to_string()),
        body: Some(ItemBody::html("Remote notes")),
        start: DateTimeTimeZone::from_utc(start),
        end: DateTimeTimeZone::from_utc(start + chrono::Duration::minutes(minutes)),
        last_modified_date_time: Some(Utc::now()),
        is_cancelled: false,
    }
}

pub fn create_test_config() -> Configuration {
    Configuration {
        directory_enabled: true,
        tenant_id: "contoso".to_string(),
        ..Default::default()
    }
}

/// Retry policy that still makes three attempts but never waits long
pub fn create_test_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1))
}

pub const TEACHER_ROLE: LocalId = 1;
pub const STUDENT_ROLE: LocalId = 2;
pub const CONTRIBUTOR_ROLE: LocalId = 3;
pub const CATEGORY_CONTEXT: LocalId = 2;
pub const BIOLOGY: LocalId = 100;
pub const CHEMISTRY: LocalId = 200;

pub fn event_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()
}

/// Site → category → two courses
///
/// Users 1..=4 map to remote ids `A`..`D`; user 5 has no remote identity.
/// In Biology, users 1 and 2 are teachers and 1, 2, 3 are enrolled.
pub fn create_test_local() -> LocalSnapshot {
    let user = |id: LocalId, name: &str| LocalUser {
        id,
        username: format!("{}@contoso.com", name),
        email: Some(format!("{}@contoso.com", name)),
        suspended: false,
    };
    LocalSnapshot {
        users: vec![
            user(1, "alice"),
            user(2, "bob"),
            user(3, "carol"),
            user(4, "dave"),
            user(5, "erin"),
        ],
        contexts: vec![
            Context {
                id: 1,
                level: ContextLevel::Site,
                parent_id: None,
            },
            Context {
                id: CATEGORY_CONTEXT,
                level: ContextLevel::Category,
                parent_id: Some(1),
            },
            Context {
                id: 10,
                level: ContextLevel::Course,
                parent_id: Some(CATEGORY_CONTEXT),
            },
            Context {
                id: 20,
                level: ContextLevel::Course,
                parent_id: Some(CATEGORY_CONTEXT),
            },
        ],
        courses: vec![
            Course {
                id: BIOLOGY,
                name: "Biology".to_string(),
                context_id: 10,
                reset_action: None,
            },
            Course {
                id: CHEMISTRY,
                name: "Chemistry".to_string(),
                context_id: 20,
                reset_action: None,
            },
        ],
        groups: vec![LocalGroup {
            id: 7,
            course_id: BIOLOGY,
            name: "Lab A".to_string(),
            members: vec![3, 4],
        }],
        enrolments: [1, 2, 3]
            .into_iter()
            .map(|user_id| Enrolment {
                course_id: BIOLOGY,
                user_id,
                active: true,
            })
            .collect(),
        roles: vec![
            Role {
                id: TEACHER_ROLE,
                name: "editingteacher".to_string(),
                capabilities: vec!["course:manage".to_string(), "site:contribute".to_string()],
            },
            Role {
                id: STUDENT_ROLE,
                name: "student".to_string(),
                capabilities: Vec::new(),
            },
            Role {
                id: CONTRIBUTOR_ROLE,
                name: "contributor".to_string(),
                capabilities: vec!["site:contribute".to_string()],
            },
        ],
        role_assignments: vec![
            RoleAssignment {
                role_id: TEACHER_ROLE,
                user_id: 1,
                context_id: 10,
            },
            RoleAssignment {
                role_id: TEACHER_ROLE,
                user_id: 2,
                context_id: 10,
            },
            RoleAssignment {
                role_id: STUDENT_ROLE,
                user_id: 3,
                context_id: 10,
            },
        ],
        events: Vec::new(),
    }
}

pub fn create_test_store() -> Arc<MemoryStore> {
    let store = MemoryStore::from_snapshot(StoreSnapshot {
        local: create_test_local(),
        ..Default::default()
    });
    for (local, remote) in [(1, "A"), (2, "B"), (3, "C"), (4, "D")] {
        store
            .upsert_mapping(ObjectMapping::for_user(local, remote, None))
            .unwrap();
    }
    Arc::new(store)
}

pub struct TestWorld {
    pub directory: Arc<FakeDirectory>,
    pub store: Arc<MemoryStore>,
    pub service: Arc<SyncService>,
}

pub fn create_test_world() -> TestWorld {
    create_test_world_with(FakeDirectory::new(), create_test_config())
}

pub fn create_test_world_with(directory: FakeDirectory, config: Configuration) -> TestWorld {
    let directory = Arc::new(directory);
    let store = create_test_store();
    let service = Arc::new(SyncService::with_mapping_provisioner(
        Arc::new(config),
        directory.clone(),
        store.clone(),
        create_test_retry(),
    ));
    TestWorld {
        directory,
        store,
        service,
    }
}

/// Task sink that keeps what it was given
#[derive(Default)]
pub struct RecordingSink {
    pub requests: Mutex<Vec<crate::tasks::TaskRequest>>,
}

impl RecordingSink {
    pub fn tasks(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.task.clone()).collect()
    }
}

impl crate::tasks::TaskSink for RecordingSink {
    fn enqueue(&self, request: crate::tasks::TaskRequest) {
        self.requests.lock().push(request);
    }
}
