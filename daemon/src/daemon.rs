use anyhow::Result;
use backoff::{backoff::Backoff, ExponentialBackoffBuilder};
use o365_sync::store::{JobQueue, LocalSnapshot};
use o365_sync::tasks::ACCESS_SYNC;
use o365_sync::{
    HostEvent, HostEventHandlers, MemoryStore, ReconcileMetrics, SyncError, SyncService,
    TaskRegistry, TaskRequest, TaskSink,
};
use o365_sync_core::api::build_directory_client;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

use crate::config::{DaemonConfig, DispatcherConfig, ScheduleType};
use crate::routes::{self, ApiState};
use crate::scheduler::{ScheduledTask, TaskScheduler};
use crate::telemetry::{DaemonMetrics, TelemetrySystem};

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub request: TaskRequest,
    pub source: TriggerSource,
    /// Failed executions so far
    pub attempt: u32,
    pub queued_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    Schedule,
    HostEvent,
    Adhoc,
    Startup,
    Retry,
}

impl DispatchRequest {
    pub fn new(request: TaskRequest, source: TriggerSource) -> Self {
        Self {
            request,
            source,
            attempt: 0,
            queued_at: Instant::now(),
        }
    }
}

/// Feeds deferred work into the dispatcher channel
pub struct ChannelSink {
    tx: mpsc::Sender<DispatchRequest>,
    source: TriggerSource,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<DispatchRequest>, source: TriggerSource) -> Self {
        Self { tx, source }
    }
}

impl TaskSink for ChannelSink {
    fn enqueue(&self, request: TaskRequest) {
        let identity = request.identity();
        if let Err(e) = self.tx.try_send(DispatchRequest::new(request, self.source)) {
            error!(identity = %identity, "Failed to queue task: {}", e);
        }
    }
}

/// Collects deferred work so a one-shot command can run it afterwards
#[derive(Default)]
pub struct InlineSink {
    queue: Mutex<VecDeque<TaskRequest>>,
}

impl InlineSink {
    fn pop(&self) -> Option<TaskRequest> {
        self.queue.lock().pop_front()
    }
}

impl TaskSink for InlineSink {
    fn enqueue(&self, request: TaskRequest) {
        self.queue.lock().push_back(request);
    }
}

/// Store, service and task registry built from one configuration
pub struct SyncRuntime {
    pub store: Arc<MemoryStore>,
    pub service: Arc<SyncService>,
    pub registry: Arc<TaskRegistry>,
}

impl SyncRuntime {
    pub fn build(config: &DaemonConfig) -> Result<Self> {
        let store = Arc::new(MemoryStore::open(&config.store.path)?);
        if let Some(export) = &config.store.local_export {
            load_local_export(&store, export)?;
        }

        let client = build_directory_client(&config.directory, &config.client.settings())?;
        let service = Arc::new(SyncService::with_mapping_provisioner(
            Arc::new(config.directory.clone()),
            client,
            store.clone(),
            config.retry.policy(),
        ));
        let registry = Arc::new(TaskRegistry::with_defaults(service.clone()));

        info!(
            store = %config.store.path.display(),
            tasks = ?registry.names(),
            "Sync runtime ready"
        );
        Ok(Self {
            store,
            service,
            registry,
        })
    }

    pub fn handlers(&self, sink: Arc<dyn TaskSink>) -> HostEventHandlers {
        HostEventHandlers::new(self.service.clone(), sink)
    }

    /// Run one task now and persist the store
    pub async fn run_task(&self, request: &TaskRequest) -> Result<ReconcileMetrics> {
        let result = self
            .registry
            .execute(&request.task, request.data.clone())
            .await;
        self.store.save()?;
        Ok(result?)
    }

    /// Handle one host event, then run whatever it deferred
    pub async fn handle_event_inline(&self, event: &HostEvent) -> Result<Vec<ReconcileMetrics>> {
        let sink = Arc::new(InlineSink::default());
        let handled = self.handlers(sink.clone()).handle(event).await;
        if !handled {
            self.store.save()?;
            anyhow::bail!("Handling {:?} failed", event.kind);
        }

        let mut runs = Vec::new();
        while let Some(request) = sink.pop() {
            runs.push(self.run_task(&request).await?);
        }
        self.store.save()?;
        Ok(runs)
    }
}

/// Replace the local records with the host platform's export
pub fn load_local_export(store: &MemoryStore, path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(path)?;
    let local: LocalSnapshot = serde_json::from_str(&content)?;
    debug!(
        users = local.users.len(),
        courses = local.courses.len(),
        events = local.events.len(),
        "Loaded local export"
    );
    store.refresh_local(local);
    Ok(())
}

/// Delay before the `failures`-th re-queue of a request
pub fn requeue_delay(config: &DispatcherConfig, failures: u32) -> Duration {
    let mut backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(config.initial_backoff)
        .with_randomization_factor(0.0)
        .with_multiplier(2.0)
        .with_max_interval(config.max_backoff)
        .with_max_elapsed_time(None)
        .build();
    (0..failures.max(1))
        .filter_map(|_| backoff.next_backoff())
        .last()
        .unwrap_or(config.initial_backoff)
}

/// Errors that will fail the same way however often they are retried
fn is_permanent(error: &SyncError) -> bool {
    matches!(
        error,
        SyncError::UnknownTask(_) | SyncError::InvalidTaskData { .. } | SyncError::Serialization(_)
    )
}

/// Executes requests one at a time and re-queues failures
pub struct Dispatcher {
    registry: Arc<TaskRegistry>,
    store: Arc<MemoryStore>,
    metrics: DaemonMetrics,
    config: DispatcherConfig,
    tx: mpsc::Sender<DispatchRequest>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<TaskRegistry>,
        store: Arc<MemoryStore>,
        metrics: DaemonMetrics,
        config: DispatcherConfig,
        tx: mpsc::Sender<DispatchRequest>,
    ) -> Self {
        Self {
            registry,
            store,
            metrics,
            config,
            tx,
        }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<DispatchRequest>) {
        info!("Dispatcher started");
        while let Some(dispatch) = rx.recv().await {
            self.process(dispatch).await;
        }
        info!("Dispatcher stopped");
    }

    /// Execute one request; false when it failed
    #[instrument(
        skip(self, dispatch),
        fields(task = %dispatch.request.task, source = ?dispatch.source, attempt = dispatch.attempt)
    )]
    pub async fn process(&self, mut dispatch: DispatchRequest) -> bool {
        let started = Instant::now();
        debug!(waited_ms = dispatch.queued_at.elapsed().as_millis() as u64, "Dispatching");

        let result = self
            .registry
            .execute(&dispatch.request.task, dispatch.request.data.clone())
            .await;

        if let Err(e) = self.store.save() {
            error!("Failed to persist store: {}", e);
        }

        let task = dispatch.request.task.clone();
        match result {
            Ok(run) => {
                self.metrics.record_run(&task, &run);
                true
            }
            Err(e) => {
                self.metrics.record_failure(&task, started.elapsed());
                dispatch.attempt += 1;

                if is_permanent(&e) {
                    error!(identity = %dispatch.request.identity(), "Dropping task: {}", e);
                } else if dispatch.attempt >= self.config.max_task_attempts {
                    error!(
                        identity = %dispatch.request.identity(),
                        attempts = dispatch.attempt,
                        "Giving up on task: {}", e
                    );
                } else {
                    warn!("Task failed, will retry: {}", e);
                    self.requeue(dispatch);
                }
                false
            }
        }
    }

    fn requeue(&self, mut dispatch: DispatchRequest) {
        let delay = requeue_delay(&self.config, dispatch.attempt);
        debug!(delay_secs = delay.as_secs(), "Re-queueing task");

        self.metrics
            .task_requeues_total
            .with_label_values(&[&dispatch.request.task])
            .inc();
        let pending = self.metrics.pending_requeues.clone();
        pending.inc();

        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pending.dec();
            dispatch.source = TriggerSource::Retry;
            dispatch.queued_at = Instant::now();
            if let Err(e) = tx.send(dispatch).await {
                warn!("Dispatcher gone, dropping retry: {}", e);
            }
        });
    }
}

pub struct SyncDaemon {
    config: DaemonConfig,
    runtime: SyncRuntime,
    telemetry: TelemetrySystem,
    scheduler: TaskScheduler,
    tasks: HashMap<String, tokio::task::JoinHandle<()>>,
}

impl SyncDaemon {
    pub fn new(config: DaemonConfig, telemetry: TelemetrySystem) -> Result<Self> {
        info!("Initializing sync daemon");
        config.validate()?;
        let runtime = SyncRuntime::build(&config)?;

        Ok(Self {
            config,
            runtime,
            telemetry,
            scheduler: TaskScheduler::new(),
            tasks: HashMap::new(),
        })
    }

    #[instrument(skip(self), fields(daemon_id = %self.telemetry.daemon_id()))]
    pub async fn run(mut self) -> Result<()> {
        info!("Starting sync daemon");

        let (tx, rx) = mpsc::channel::<DispatchRequest>(self.config.dispatcher.queue_size);

        let uptime = self.telemetry.start_background_tasks();
        self.tasks.insert("uptime".to_string(), uptime);

        if self.telemetry.config().metrics.enabled {
            self.start_metrics_server().await?;
        }
        if self.config.api.enabled {
            self.start_api_server(tx.clone()).await?;
        }
        if self.config.store.local_export.is_some() {
            self.start_local_refresh();
        }

        self.start_dispatcher(tx.clone(), rx);
        self.resume_pending_jobs(&tx);
        self.start_schedules(tx).await?;

        info!("Sync daemon started successfully");

        tokio::signal::ctrl_c().await?;
        info!("Ctrl+C received, shutting down");

        self.shutdown().await;
        info!("Sync daemon stopped");
        Ok(())
    }

    fn start_dispatcher(&mut self, tx: mpsc::Sender<DispatchRequest>, rx: mpsc::Receiver<DispatchRequest>) {
        let dispatcher = Dispatcher::new(
            self.runtime.registry.clone(),
            self.runtime.store.clone(),
            self.telemetry.metrics().clone(),
            self.config.dispatcher.clone(),
            tx,
        );
        let handle = tokio::spawn(dispatcher.run(rx));
        self.tasks.insert("dispatcher".to_string(), handle);
    }

    /// Access jobs persisted by a previous run still need draining
    fn resume_pending_jobs(&self, tx: &mpsc::Sender<DispatchRequest>) {
        let pending = self.runtime.store.pending_access_jobs().len();
        if pending == 0 {
            return;
        }
        info!(pending, "Resuming queued access jobs");
        let request = TaskRequest::new(ACCESS_SYNC, serde_json::Value::Null);
        if let Err(e) = tx.try_send(DispatchRequest::new(request, TriggerSource::Startup)) {
            warn!("Could not queue access job drain: {}", e);
        }
    }

    async fn start_schedules(&mut self, tx: mpsc::Sender<DispatchRequest>) -> Result<()> {
        for (index, schedule) in self.config.schedules.iter().enumerate() {
            let id = format!("{}-{}", schedule.task, index);
            let entry = match &schedule.schedule_type {
                ScheduleType::Interval { interval } => {
                    ScheduledTask::new_interval(id, schedule.task.clone(), *interval, tx.clone())
                }
                ScheduleType::Cron { expression } => {
                    ScheduledTask::new_cron(id, schedule.task.clone(), expression, tx.clone())?
                }
            };
            let entry = if schedule.enabled { entry } else { entry.disabled() };
            self.scheduler.add(entry).await;
        }

        self.scheduler.start().await?;
        for status in self.scheduler.list().await {
            debug!(
                id = %status.id,
                task = %status.task,
                enabled = status.enabled,
                last_run = ?status.last_run,
                next_run = ?status.next_run,
                "Schedule registered"
            );
        }
        info!("Started {} schedules", self.config.schedules.len());
        Ok(())
    }

    fn start_local_refresh(&mut self) {
        let Some(export) = self.config.store.local_export.clone() else {
            return;
        };
        let store = self.runtime.store.clone();
        let period = self.config.store.local_refresh_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = load_local_export(&store, &export) {
                    error!("Failed to reload local export {}: {}", export.display(), e);
                }
            }
        });
        self.tasks.insert("local_refresh".to_string(), handle);
    }

    async fn start_metrics_server(&mut self) -> Result<()> {
        let metrics = &self.telemetry.config().metrics;
        let bind_addr = format!("{}:{}", metrics.bind_address, metrics.port);
        let app = self.telemetry.create_metrics_server();
        self.serve("metrics_server", bind_addr, app).await
    }

    async fn start_api_server(&mut self, tx: mpsc::Sender<DispatchRequest>) -> Result<()> {
        let bind_addr = format!("{}:{}", self.config.api.bind_address, self.config.api.port);
        let handlers = self
            .runtime
            .handlers(Arc::new(ChannelSink::new(tx.clone(), TriggerSource::HostEvent)));
        let state = ApiState {
            handlers: Arc::new(handlers),
            sink: Arc::new(ChannelSink::new(tx, TriggerSource::Adhoc)),
            registry: self.runtime.registry.clone(),
            metrics: self.telemetry.metrics().clone(),
        };
        self.serve("api_server", bind_addr, routes::router(state)).await
    }

    async fn serve(&mut self, name: &str, bind_addr: String, app: axum::Router) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
        info!("{} listening on {}", name, bind_addr);

        let label = name.to_string();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("{} stopped: {}", label, e);
            }
        });
        self.tasks.insert(name.to_string(), handle);
        Ok(())
    }

    async fn shutdown(&mut self) {
        info!("Shutting down sync daemon");

        if self.scheduler.is_running().await {
            self.scheduler.stop().await;
        }
        for (name, handle) in self.tasks.drain() {
            debug!("Stopping task: {}", name);
            handle.abort();
        }

        if let Err(e) = self.runtime.store.save() {
            error!("Failed to persist store on shutdown: {}", e);
        }
    }
}

impl Drop for SyncDaemon {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.drain() {
            handle.abort();
        }
    }
}
