use anyhow::Result;
use cron::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::daemon::{DispatchRequest, TriggerSource};

/// Turns configured schedules into dispatcher requests
#[derive(Debug)]
pub struct TaskScheduler {
    entries: Arc<RwLock<HashMap<String, ScheduledTask>>>,
    running: Arc<RwLock<bool>>,
    handles: Arc<RwLock<HashMap<String, tokio::task::JoinHandle<()>>>>,
}

#[derive(Debug, Clone)]
pub struct ScheduledTask {
    pub id: String,
    /// Registered task name sent to the dispatcher
    pub task: String,
    pub schedule_type: ScheduleType,
    pub dispatch_tx: mpsc::Sender<DispatchRequest>,
    pub enabled: bool,
    pub last_run: Option<Instant>,
    pub next_run: Option<Instant>,
}

#[derive(Debug, Clone)]
pub enum ScheduleType {
    Interval { interval: Duration },
    Cron { schedule: Schedule },
}

#[derive(Debug, Clone)]
pub struct ScheduleStatus {
    pub id: String,
    pub task: String,
    pub enabled: bool,
    pub last_run: Option<Instant>,
    pub next_run: Option<Instant>,
}

impl TaskScheduler {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(RwLock::new(false)),
            handles: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn add(&self, entry: ScheduledTask) {
        let mut entries = self.entries.write().await;
        info!("Adding schedule {} for task {}", entry.id, entry.task);
        entries.insert(entry.id.clone(), entry);
    }

    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.write().await;
        if *running {
            warn!("Task scheduler is already running");
            return Ok(());
        }

        *running = true;
        drop(running);
        info!("Starting task scheduler");

        let entries: Vec<ScheduledTask> = self.entries.read().await.values().cloned().collect();
        for entry in entries {
            self.spawn_entry(entry).await;
        }

        Ok(())
    }

    pub async fn stop(&self) {
        let mut running = self.running.write().await;
        if !*running {
            return;
        }

        *running = false;
        info!("Stopping task scheduler");

        let mut handles = self.handles.write().await;
        for (id, handle) in handles.drain() {
            debug!("Stopping schedule {}", id);
            handle.abort();
        }
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub async fn list(&self) -> Vec<ScheduleStatus> {
        let entries = self.entries.read().await;
        let mut statuses: Vec<ScheduleStatus> = entries
            .values()
            .map(|entry| ScheduleStatus {
                id: entry.id.clone(),
                task: entry.task.clone(),
                enabled: entry.enabled,
                last_run: entry.last_run,
                next_run: entry.next_run,
            })
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    async fn spawn_entry(&self, entry: ScheduledTask) {
        if !entry.enabled {
            debug!("Schedule {} is disabled, not starting it", entry.id);
            return;
        }

        let running = self.running.clone();
        let entries = self.entries.clone();
        let id = entry.id.clone();

        let handle = match entry.schedule_type.clone() {
            ScheduleType::Interval { interval } => tokio::spawn(async move {
                Self::run_interval(entry, interval, running, entries).await;
            }),
            ScheduleType::Cron { schedule } => tokio::spawn(async move {
                Self::run_cron(entry, schedule, running, entries).await;
            }),
        };

        self.handles.write().await.insert(id, handle);
    }

    async fn run_interval(
        entry: ScheduledTask,
        interval: Duration,
        running: Arc<RwLock<bool>>,
        entries: Arc<RwLock<HashMap<String, ScheduledTask>>>,
    ) {
        info!("Task {} runs every {:?}", entry.task, interval);

        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // the first tick completes immediately

        while *running.read().await {
            ticker.tick().await;

            if !Self::send(&entry, &running).await {
                break;
            }

            let mut entries = entries.write().await;
            if let Some(current) = entries.get_mut(&entry.id) {
                current.last_run = Some(Instant::now());
                current.next_run = Some(Instant::now() + interval);
            }
        }

        debug!("Schedule {} stopped", entry.id);
    }

    async fn run_cron(
        entry: ScheduledTask,
        schedule: Schedule,
        running: Arc<RwLock<bool>>,
        entries: Arc<RwLock<HashMap<String, ScheduledTask>>>,
    ) {
        info!("Task {} runs on a cron schedule", entry.task);

        while *running.read().await {
            let now = chrono::Utc::now();
            let next = match schedule.after(&now).next() {
                Some(datetime) => datetime,
                None => {
                    error!("Cron schedule {} has no upcoming run", entry.id);
                    break;
                }
            };
            let wait = (next - now).to_std().unwrap_or(Duration::from_secs(60));

            {
                let mut entries = entries.write().await;
                if let Some(current) = entries.get_mut(&entry.id) {
                    current.next_run = Some(Instant::now() + wait);
                }
            }
            debug!("Task {} next runs at {} (in {:?})", entry.task, next, wait);

            sleep(wait).await;

            if !Self::send(&entry, &running).await {
                break;
            }

            let mut entries = entries.write().await;
            if let Some(current) = entries.get_mut(&entry.id) {
                current.last_run = Some(Instant::now());
            }
        }

        debug!("Schedule {} stopped", entry.id);
    }

    /// False when the dispatcher has gone away
    async fn send(entry: &ScheduledTask, running: &Arc<RwLock<bool>>) -> bool {
        if !*running.read().await {
            return false;
        }
        debug!("Triggering scheduled task {}", entry.task);
        let request = DispatchRequest::new(
            o365_sync::TaskRequest::new(entry.task.clone(), serde_json::Value::Null),
            TriggerSource::Schedule,
        );
        match entry.dispatch_tx.send(request).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to queue scheduled task {}: {}", entry.task, e);
                false
            }
        }
    }
}

impl ScheduledTask {
    pub fn new_interval(
        id: String,
        task: String,
        interval: Duration,
        dispatch_tx: mpsc::Sender<DispatchRequest>,
    ) -> Self {
        Self {
            id,
            task,
            schedule_type: ScheduleType::Interval { interval },
            dispatch_tx,
            enabled: true,
            last_run: None,
            next_run: Some(Instant::now() + interval),
        }
    }

    pub fn new_cron(
        id: String,
        task: String,
        expression: &str,
        dispatch_tx: mpsc::Sender<DispatchRequest>,
    ) -> Result<Self> {
        let schedule = Schedule::from_str(expression)
            .map_err(|e| anyhow::anyhow!("Invalid cron expression '{}': {}", expression, e))?;

        let now = chrono::Utc::now();
        let next_run = schedule.after(&now).next().map(|datetime| {
            let wait = (datetime - now).to_std().unwrap_or(Duration::from_secs(60));
            Instant::now() + wait
        });

        Ok(Self {
            id,
            task,
            schedule_type: ScheduleType::Cron { schedule },
            dispatch_tx,
            enabled: true,
            last_run: None,
            next_run,
        })
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_interval_schedule_sends_requests() {
        let (tx, mut rx) = mpsc::channel(8);
        let scheduler = TaskScheduler::new();
        scheduler
            .add(ScheduledTask::new_interval(
                "import".to_string(),
                "calendar_import".to_string(),
                Duration::from_secs(60),
                tx,
            ))
            .await;
        scheduler.start().await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.request.task, "calendar_import");
        assert!(first.request.data.is_null());
        assert!(matches!(first.source, TriggerSource::Schedule));
        assert_eq!(first.attempt, 0);

        let second = rx.recv().await.unwrap();
        assert_eq!(second.request.task, "calendar_import");
        assert!(scheduler.list().await[0].last_run.is_some());

        scheduler.stop().await;
        assert!(!scheduler.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_schedule_never_fires() {
        let (tx, mut rx) = mpsc::channel(8);
        let scheduler = TaskScheduler::new();
        scheduler
            .add(
                ScheduledTask::new_interval(
                    "delta".to_string(),
                    "user_sync_delta".to_string(),
                    Duration::from_secs(1),
                    tx,
                )
                .disabled(),
            )
            .await;
        scheduler.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
        scheduler.stop().await;
    }

    #[test]
    fn test_cron_expression_is_validated() {
        let (tx, _rx) = mpsc::channel(1);
        assert!(ScheduledTask::new_cron(
            "full".to_string(),
            "user_sync_full".to_string(),
            "not cron",
            tx.clone()
        )
        .is_err());

        let entry =
            ScheduledTask::new_cron("full".to_string(), "user_sync_full".to_string(), "0 0 2 * * Sun", tx)
                .unwrap();
        assert!(entry.next_run.is_some());
    }
}
