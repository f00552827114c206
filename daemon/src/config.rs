use anyhow::Result;
use o365_sync::retry::DEFAULT_RETRYABLE_CODES;
use o365_sync::tasks::{
    ACCESS_SYNC, CALENDAR_IMPORT, GROUP_MEMBERSHIP, GROUP_PROVISION, USER_SYNC_DELTA, USER_SYNC_FULL,
};
use o365_sync::RetryPolicy;
use o365_sync_core::api::{AppCredentials, ClientSettings};
use o365_sync_core::Configuration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::telemetry::{TelemetryConfig, ROTATION_FREQUENCIES};

/// Environment variable that overrides `client.client_secret`
pub const CLIENT_SECRET_ENV: &str = "O365_CLIENT_SECRET";

/// Tasks that can run without input and so may be put on a schedule
pub const SCHEDULABLE_TASKS: [&str; 6] = [
    ACCESS_SYNC,
    CALENDAR_IMPORT,
    GROUP_MEMBERSHIP,
    GROUP_PROVISION,
    USER_SYNC_DELTA,
    USER_SYNC_FULL,
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub directory: Configuration,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default = "default_schedules")]
    pub schedules: Vec<TaskSchedule>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub client_id: String,
    /// Prefer the environment variable over storing the secret here
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_secret: String,
    #[serde(default = "default_login_base")]
    pub login_base: String,
    /// Send every API call to this base URL instead
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_override: Option<String>,
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Pause before each remote call
    #[serde(default = "default_pacing", with = "humantime_serde")]
    pub pacing: Duration,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

/// Propagation-delay retry around membership and group-exists calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,
    #[serde(default = "default_retry_delay", with = "humantime_serde")]
    pub delay: Duration,
    #[serde(default = "default_retryable_codes")]
    pub codes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON snapshot of mappings, cursors and queued jobs
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
    /// Records exported by the local platform, reloaded periodically
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_export: Option<PathBuf>,
    #[serde(default = "default_local_refresh_interval", with = "humantime_serde")]
    pub local_refresh_interval: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Executions of one request, including the first, before it is dropped
    #[serde(default = "default_max_task_attempts")]
    pub max_task_attempts: u32,
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,
}

/// HTTP intake for host events and adhoc tasks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSchedule {
    pub task: String,
    #[serde(flatten)]
    pub schedule_type: ScheduleType,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ScheduleType {
    #[serde(rename = "interval")]
    Interval {
        #[serde(with = "humantime_serde")]
        interval: Duration,
    },
    #[serde(rename = "cron")]
    Cron {
        expression: String,
    },
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            directory: Configuration::default(),
            client: ClientConfig::default(),
            retry: RetryConfig::default(),
            store: StoreConfig::default(),
            dispatcher: DispatcherConfig::default(),
            api: ApiConfig::default(),
            schedules: default_schedules(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            login_base: default_login_base(),
            endpoint_override: None,
            timeout: default_request_timeout(),
            pacing: default_pacing(),
            page_size: default_page_size(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: default_retry_attempts(),
            delay: default_retry_delay(),
            codes: default_retryable_codes(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            local_export: None,
            local_refresh_interval: default_local_refresh_interval(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            max_task_attempts: default_max_task_attempts(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_bind_address(),
            port: default_api_port(),
        }
    }
}

impl ClientConfig {
    /// Application credential, with the secret taken from the environment first
    pub fn credentials(&self) -> Option<AppCredentials> {
        let secret = std::env::var(CLIENT_SECRET_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| self.client_secret.clone());
        if self.client_id.is_empty() || secret.is_empty() {
            return None;
        }
        Some(AppCredentials {
            client_id: self.client_id.clone(),
            client_secret: secret,
        })
    }

    pub fn settings(&self) -> ClientSettings {
        ClientSettings {
            credentials: self.credentials(),
            login_base: self.login_base.clone(),
            endpoint_override: self.endpoint_override.clone(),
            timeout: self.timeout,
            pacing: self.pacing,
            page_size: self.page_size,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.attempts, self.delay).with_codes(self.codes.clone())
    }
}

impl DaemonConfig {
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: DaemonConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.directory.api_base_resource)?;
        url::Url::parse(&self.client.login_base)?;
        if let Some(endpoint) = &self.client.endpoint_override {
            url::Url::parse(endpoint)?;
        }

        if self.directory.directory_enabled {
            if self.directory.tenant_id.is_empty() {
                anyhow::bail!("directory.tenant_id is required when the directory is enabled");
            }
            if self.client.client_id.is_empty() {
                anyhow::bail!("client.client_id is required when the directory is enabled");
            }
        }

        if self.retry.attempts == 0 {
            anyhow::bail!("retry.attempts must be at least 1");
        }
        if self.dispatcher.max_task_attempts == 0 {
            anyhow::bail!("dispatcher.max_task_attempts must be at least 1");
        }
        if self.dispatcher.queue_size == 0 {
            anyhow::bail!("dispatcher.queue_size must be at least 1");
        }

        for schedule in &self.schedules {
            if !SCHEDULABLE_TASKS.contains(&schedule.task.as_str()) {
                anyhow::bail!("Task cannot be scheduled: {}", schedule.task);
            }
            match &schedule.schedule_type {
                ScheduleType::Interval { interval } if interval.is_zero() => {
                    anyhow::bail!("Interval for task {} must be positive", schedule.task);
                }
                ScheduleType::Cron { expression } => {
                    cron::Schedule::from_str(expression).map_err(|e| {
                        anyhow::anyhow!("Invalid cron expression '{}': {}", expression, e)
                    })?;
                }
                _ => {}
            }
        }

        if let Some(export) = &self.store.local_export {
            if !export.exists() {
                anyhow::bail!("Local export does not exist: {}", export.display());
            }
        }

        let frequency = self.telemetry.log_rotation.frequency.as_str();
        if !ROTATION_FREQUENCIES.contains(&frequency) {
            anyhow::bail!("Unknown log rotation frequency: {}", frequency);
        }

        Ok(())
    }

    /// `--config`, or `o365-sync.toml` in the working directory
    pub fn resolve_path(path: Option<&PathBuf>) -> PathBuf {
        path.cloned()
            .unwrap_or_else(|| PathBuf::from("o365-sync.toml"))
    }
}

// Default value functions
fn default_true() -> bool { true }

fn default_login_base() -> String {
    o365_sync_core::api::auth::DEFAULT_LOGIN_BASE.to_string()
}
fn default_request_timeout() -> Duration { Duration::from_secs(30) }
fn default_pacing() -> Duration { Duration::from_millis(50) }
fn default_page_size() -> u32 { 100 }

fn default_retry_attempts() -> u32 { 3 }
fn default_retry_delay() -> Duration { Duration::from_secs(10) }
fn default_retryable_codes() -> Vec<String> {
    DEFAULT_RETRYABLE_CODES.iter().map(|c| c.to_string()).collect()
}

fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("o365-sync")
        .join("state.json")
}
fn default_local_refresh_interval() -> Duration { Duration::from_secs(300) }

fn default_queue_size() -> usize { 1000 }
fn default_max_task_attempts() -> u32 { 5 }
fn default_initial_backoff() -> Duration { Duration::from_secs(30) }
fn default_max_backoff() -> Duration { Duration::from_secs(30 * 60) }

fn default_api_bind_address() -> String { "127.0.0.1".to_string() }
fn default_api_port() -> u16 { 8710 }

fn default_schedules() -> Vec<TaskSchedule> {
    let interval = |task: &str, secs: u64| TaskSchedule {
        task: task.to_string(),
        schedule_type: ScheduleType::Interval {
            interval: Duration::from_secs(secs),
        },
        enabled: true,
    };
    let cron = |task: &str, expression: &str| TaskSchedule {
        task: task.to_string(),
        schedule_type: ScheduleType::Cron {
            expression: expression.to_string(),
        },
        enabled: true,
    };

    vec![
        interval(ACCESS_SYNC, 5 * 60),
        interval(CALENDAR_IMPORT, 15 * 60),
        interval(USER_SYNC_DELTA, 60 * 60),
        interval(GROUP_PROVISION, 60 * 60),
        cron(USER_SYNC_FULL, "0 0 2 * * Sun"),
        cron(GROUP_MEMBERSHIP, "0 30 1 * * *"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use o365_sync_core::CourseResetAction;

    #[test]
    fn test_default_config_validates() {
        let config = DaemonConfig::default();
        config.validate().unwrap();
        assert_eq!(config.schedules.len(), 6);
        assert_eq!(config.dispatcher.max_task_attempts, 5);
    }

    #[test]
    fn test_minimal_toml_takes_defaults() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [directory]
            directory_enabled = true
            tenant_id = "contoso"
            course_reset_action = "disconnect_and_recreate"

            [client]
            client_id = "app-1"
            pacing = "10ms"
            "#,
        )
        .unwrap();

        assert!(config.directory.is_configured());
        assert_eq!(
            config.directory.course_reset_action,
            CourseResetAction::DisconnectAndRecreate
        );
        assert_eq!(config.client.pacing, Duration::from_millis(10));
        assert_eq!(config.retry.delay, Duration::from_secs(10));
        assert_eq!(config.schedules.len(), 6);
        config.validate().unwrap();
    }

    #[test]
    fn test_schedules_parse_both_kinds() {
        let config: DaemonConfig = toml::from_str(
            r#"
            [[schedules]]
            task = "calendar_import"
            type = "interval"
            interval = "2m"

            [[schedules]]
            task = "user_sync_full"
            type = "cron"
            expression = "0 0 3 * * *"
            enabled = false
            "#,
        )
        .unwrap();

        assert!(matches!(
            config.schedules[0].schedule_type,
            ScheduleType::Interval { interval } if interval == Duration::from_secs(120)
        ));
        assert!(!config.schedules[1].enabled);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = DaemonConfig::default();
        config.schedules[0].schedule_type = ScheduleType::Cron {
            expression: "every tuesday".to_string(),
        };
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.schedules[0].task = "calendar_sync".to_string();
        assert!(config.validate().is_err());

        let mut config = DaemonConfig::default();
        config.directory.directory_enabled = true;
        config.directory.tenant_id = "contoso".to_string();
        assert!(config.validate().is_err(), "client id is required");

        let mut config = DaemonConfig::default();
        config.client.endpoint_override = Some("not a url".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_credentials_need_id_and_secret() {
        let mut client = ClientConfig::default();
        client.client_secret = "s3cret".to_string();
        assert!(client.credentials().is_none());

        client.client_id = "app-1".to_string();
        if std::env::var(CLIENT_SECRET_ENV).is_err() {
            let credentials = client.credentials().unwrap();
            assert_eq!(credentials.client_secret, "s3cret");
        }
    }

    #[test]
    fn test_retry_policy_from_config() {
        let retry = RetryConfig {
            attempts: 4,
            delay: Duration::from_secs(1),
            codes: vec!["Request_ResourceNotFound".to_string()],
        };
        let policy = retry.policy();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.retryable_codes.len(), 1);
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("o365-sync.toml");
        let mut config = DaemonConfig::default();
        config.client.client_id = "app-1".to_string();
        config.client.client_secret = "kept-out-of-env".to_string();

        config.save(&path).await.unwrap();
        let loaded = DaemonConfig::load(&path).await.unwrap();

        assert_eq!(loaded.client.client_id, "app-1");
        assert_eq!(loaded.schedules.len(), config.schedules.len());
        assert_eq!(loaded.dispatcher.initial_backoff, config.dispatcher.initial_backoff);
    }
}
