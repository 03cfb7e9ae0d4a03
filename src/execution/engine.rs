//! Pipeline Execution Engine
//!
//! The facade tying everything together. An [`Engine`] owns the registered
//! pipelines, the run registry, the concurrency governor and the
//! integrations. Every submitted run becomes its own tokio task that:
//!
//! 1. waits for a governor slot (or gives up if cancelled while queued)
//! 2. walks the pipeline's steps through a [`Runner`]
//! 3. records the terminal status and archives the final snapshot

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::actions::Integrations;
use super::governor::{Admission, Governor, Permit};
use super::runner::{RunDefaults, RunOutcome, Runner};
use crate::config::EngineConfig;
use crate::duration::format_duration;
use crate::error::{ConfigError, EngineError, SubmitError};
use crate::monitoring::{PipelineCounters, RunArchive, RunRegistry};
use crate::pipeline::{validate_pipeline, PipelineDefinition};
use crate::run::{FailureReason, RunId, RunSnapshot, RunStatus, RunSummary, Trigger};
use crate::scope::Scope;

/// Live control handles for a run that has not finished yet.
#[derive(Debug)]
struct RunHandle {
    cancel: CancellationToken,
    status: watch::Receiver<RunStatus>,
}

#[derive(Debug)]
struct EngineInner {
    config: EngineConfig,
    integrations: Integrations,
    pipelines: RwLock<HashMap<String, Arc<PipelineDefinition>>>,
    registry: Arc<RunRegistry>,
    governor: Governor,
    archive: Option<RunArchive>,
    shutdown: CancellationToken,
    runs: Mutex<HashMap<RunId, RunHandle>>,
    schedules: Mutex<Vec<JoinHandle<()>>>,
}

/// Runs pipelines and answers questions about their runs.
///
/// Cheap to clone; clones share the same state.
///
/// # Example
///
/// ```rust,no_run
/// use std::collections::BTreeMap;
/// use callflow::{load_pipeline, Engine, EngineConfig, Trigger};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let engine = Engine::new(EngineConfig::load("callflow.yaml")?)?;
///     engine.register_pipeline(load_pipeline("call_debtor.yaml")?)?;
///
///     let mut params = BTreeMap::new();
///     params.insert("full_name".to_string(), "Ivan Petrov".into());
///     let id = engine.submit_run("call_debtor", params, Trigger::manual())?;
///
///     let run = engine.wait_for_run(id).await?;
///     println!("{}: {}", run.id, run.status);
///     engine.shutdown().await;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Creates an engine with integrations built from `config`.
    ///
    /// Must be called from within a tokio runtime; connection pools are
    /// created here (they connect lazily).
    pub fn new(config: EngineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let integrations = Integrations::from_config(&config)?;
        Ok(Self::with_integrations(config, integrations))
    }

    /// Creates an engine around caller-supplied integrations.
    pub fn with_integrations(config: EngineConfig, integrations: Integrations) -> Self {
        let archive = config.archive_dir.as_ref().map(RunArchive::new);
        if let Some(archive) = &archive {
            info!("Archiving finished runs to {}", archive.root().display());
        }
        Self {
            inner: Arc::new(EngineInner {
                registry: Arc::new(RunRegistry::new(config.history_limit)),
                governor: Governor::new(config.default_max_concurrent),
                archive,
                integrations,
                config,
                pipelines: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                runs: Mutex::new(HashMap::new()),
                schedules: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Validates and registers a pipeline.
    ///
    /// Every `db_query` connection must be configured.
    pub fn register_pipeline(&self, pipeline: PipelineDefinition) -> Result<(), ConfigError> {
        validate_pipeline(&pipeline)?;

        let missing: Vec<ConfigError> = pipeline
            .steps
            .iter()
            .filter_map(|step| {
                let connection = step.action.connection()?;
                (!self.inner.integrations.has_datastore(connection)).then(|| {
                    ConfigError::UnknownConnection {
                        step: step.name.clone(),
                        connection: connection.to_string(),
                    }
                })
            })
            .collect();
        if let Some(error) = ConfigError::from_list(missing) {
            return Err(error);
        }

        let mut pipelines = self.inner.pipelines.write();
        if pipelines.contains_key(&pipeline.name) {
            return Err(ConfigError::DuplicatePipeline(pipeline.name));
        }

        self.inner
            .governor
            .configure(&pipeline.name, pipeline.max_concurrent);
        self.inner.registry.ensure_pipeline(&pipeline.name);
        info!(
            "Registered pipeline '{}' ({} steps)",
            pipeline.name,
            pipeline.len()
        );
        pipelines.insert(pipeline.name.clone(), Arc::new(pipeline));
        Ok(())
    }

    /// Names of registered pipelines, sorted.
    pub fn pipelines(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.pipelines.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn pipeline(&self, name: &str) -> Option<Arc<PipelineDefinition>> {
        self.inner.pipelines.read().get(name).cloned()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn archive(&self) -> Option<&RunArchive> {
        self.inner.archive.as_ref()
    }

    /// Submits a run and returns its id immediately.
    ///
    /// Absent parameters take their declared defaults; undeclared extra
    /// parameters are kept. The run starts once the pipeline's governor
    /// grants it a slot.
    pub fn submit_run(
        &self,
        pipeline: &str,
        params: BTreeMap<String, Value>,
        trigger: Trigger,
    ) -> Result<RunId, SubmitError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(SubmitError::ShuttingDown);
        }
        let definition = self
            .pipeline(pipeline)
            .ok_or_else(|| SubmitError::UnknownPipeline(pipeline.to_string()))?;
        let input = definition.resolve_inputs(params)?;

        let id = RunId::new();
        let submitted_at = self.inner.integrations.clock().now();
        self.inner.registry.register_queued(RunSnapshot::queued(
            id,
            pipeline,
            trigger.clone(),
            input.clone(),
            submitted_at,
        ));

        let (status_tx, status_rx) = watch::channel(RunStatus::Queued);
        let cancel = self.inner.shutdown.child_token();
        self.inner.runs.lock().insert(
            id,
            RunHandle {
                cancel: cancel.clone(),
                status: status_rx,
            },
        );

        info!(
            "[{}] Submitted run of '{}' ({} trigger)",
            id,
            pipeline,
            trigger.label()
        );
        let admission = self.inner.governor.admit(pipeline, id);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner
                .drive(id, definition, Scope::with_params(input), admission, cancel, status_tx)
                .await;
        });
        Ok(id)
    }

    /// Requests cancellation of a run.
    ///
    /// Queued runs leave the queue; running runs stop at the next
    /// cancellation point. Finished runs are left untouched.
    pub fn cancel_run(&self, id: RunId) -> Result<(), EngineError> {
        if let Some(handle) = self.inner.runs.lock().get(&id) {
            info!("[{}] Cancellation requested", id);
            handle.cancel.cancel();
            return Ok(());
        }
        match self.inner.registry.status(id) {
            Some(_) => Ok(()),
            None => Err(EngineError::UnknownRun(id.to_string())),
        }
    }

    /// Waits until a run is terminal and returns its final snapshot.
    pub async fn wait_for_run(&self, id: RunId) -> Result<RunSnapshot, EngineError> {
        let status = self
            .inner
            .runs
            .lock()
            .get(&id)
            .map(|handle| handle.status.clone());
        if let Some(mut status) = status {
            // A closed channel means the run already finished.
            let _ = status.wait_for(RunStatus::is_terminal).await;
        }
        self.get_run(id)
    }

    /// The current snapshot of a run.
    pub fn get_run(&self, id: RunId) -> Result<RunSnapshot, EngineError> {
        self.inner
            .registry
            .get(id)
            .ok_or_else(|| EngineError::UnknownRun(id.to_string()))
    }

    pub fn get_pipeline_counters(&self, pipeline: &str) -> Result<PipelineCounters, EngineError> {
        self.inner
            .registry
            .counters(pipeline)
            .ok_or_else(|| EngineError::UnknownPipeline(pipeline.to_string()))
    }

    /// Up to `limit` runs of a pipeline, newest first.
    pub fn list_recent_runs(&self, pipeline: &str, limit: usize) -> Vec<RunSummary> {
        self.inner.registry.recent(pipeline, limit)
    }

    /// Starts interval triggers for every pipeline that declares a schedule.
    ///
    /// The first run of each fires one interval from now. Returns how many
    /// schedules are active.
    pub fn start_schedules(&self) -> usize {
        let mut schedules = self.inner.schedules.lock();
        if !schedules.is_empty() {
            warn!("Schedules already started");
            return schedules.len();
        }

        let scheduled: Vec<Arc<PipelineDefinition>> = self
            .inner
            .pipelines
            .read()
            .values()
            .filter(|p| p.schedule.is_some())
            .cloned()
            .collect();

        for pipeline in scheduled {
            let Some(schedule) = pipeline.schedule.clone() else {
                continue;
            };
            let Some(first) = Instant::now().checked_add(schedule.every) else {
                warn!("Schedule interval of '{}' is too large, not scheduling", pipeline.name);
                continue;
            };
            let engine = self.clone();
            let shutdown = self.inner.shutdown.clone();
            let every = format_duration(schedule.every);
            info!("Scheduling '{}' every {}", pipeline.name, every);

            schedules.push(tokio::spawn(async move {
                let mut ticker = interval_at(first, schedule.every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            let trigger = Trigger::Scheduled { every: every.clone() };
                            if let Err(e) = engine.submit_run(&pipeline.name, schedule.params.clone(), trigger) {
                                warn!("Scheduled run of '{}' rejected: {}", pipeline.name, e);
                            }
                        }
                    }
                }
                debug!("Schedule for '{}' stopped", pipeline.name);
            }));
        }
        schedules.len()
    }

    /// Stops schedules, cancels every unfinished run and waits for them to
    /// reach a terminal state. New submissions are rejected from here on.
    pub async fn shutdown(&self) {
        info!("Shutting down engine");
        self.inner.shutdown.cancel();

        let schedules = std::mem::take(&mut *self.inner.schedules.lock());
        for handle in schedules {
            if let Err(e) = handle.await {
                error!("Schedule task failed: {}", e);
            }
        }

        let pending: Vec<watch::Receiver<RunStatus>> = self
            .inner
            .runs
            .lock()
            .values()
            .map(|handle| handle.status.clone())
            .collect();
        info!("Waiting for {} unfinished run(s)", pending.len());
        for mut status in pending {
            let _ = status.wait_for(RunStatus::is_terminal).await;
        }
        info!("Engine stopped");
    }
}

impl EngineInner {
    async fn drive(
        self: Arc<Self>,
        id: RunId,
        pipeline: Arc<PipelineDefinition>,
        scope: Scope,
        admission: Admission,
        cancel: CancellationToken,
        status_tx: watch::Sender<RunStatus>,
    ) {
        let Some(permit) = self.admit(id, admission, &cancel).await else {
            self.complete(
                id,
                RunStatus::Cancelled,
                Some(FailureReason::cancelled(None, "cancelled while queued")),
                &status_tx,
            );
            self.runs.lock().remove(&id);
            return;
        };

        let started_at = self.integrations.clock().now();
        if self.registry.mark_running(id, started_at) {
            status_tx.send_replace(RunStatus::Running);
            info!("[{}] Admitted run of '{}'", id, pipeline.name);

            let runner = Runner {
                run_id: id,
                pipeline: Arc::clone(&pipeline),
                registry: Arc::clone(&self.registry),
                integrations: self.integrations.clone(),
                defaults: RunDefaults {
                    step_timeout: self.config.default_step_timeout,
                    poll_interval: self.config.poll_interval,
                    retry: self.config.retry.clone(),
                },
                cancel,
            };
            // A panic inside the run must still leave it terminal.
            let outcome = match tokio::spawn(async move { runner.run(scope).await }).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let message = panic_message(e);
                    error!("[{}] Run task aborted: {}", id, message);
                    let step = self
                        .registry
                        .get(id)
                        .and_then(|run| run.current_step)
                        .and_then(|index| pipeline.steps.get(index))
                        .map(|step| step.name.as_str());
                    RunOutcome {
                        status: RunStatus::Failed,
                        reason: Some(FailureReason::aborted(step, message)),
                    }
                }
            };
            self.complete(id, outcome.status, outcome.reason, &status_tx);
        } else {
            warn!("[{}] Run left the queued state before admission", id);
            status_tx.send_replace(self.registry.status(id).unwrap_or(RunStatus::Cancelled));
        }

        drop(permit);
        self.runs.lock().remove(&id);
    }

    /// Resolves to a permit, or `None` if the run was cancelled first.
    async fn admit(
        &self,
        id: RunId,
        admission: Admission,
        cancel: &CancellationToken,
    ) -> Option<Permit> {
        match admission {
            Admission::Granted(permit) => Some(permit),
            Admission::Queued(mut queued) => {
                debug!("[{}] Waiting for a free slot", id);
                let granted = tokio::select! {
                    permit = queued.wait() => permit,
                    _ = cancel.cancelled() => None,
                };
                if granted.is_none() {
                    queued.withdraw();
                }
                granted
            }
        }
    }

    fn complete(
        &self,
        id: RunId,
        status: RunStatus,
        reason: Option<FailureReason>,
        status_tx: &watch::Sender<RunStatus>,
    ) {
        let ended_at = self.integrations.clock().now();
        match self.registry.finish(id, status, reason, ended_at) {
            Some(snapshot) => {
                match &snapshot.reason {
                    None => info!("[{}] Run of '{}' {}", id, snapshot.pipeline, status),
                    Some(reason) => info!(
                        "[{}] Run of '{}' {}: {}",
                        id, snapshot.pipeline, status, reason
                    ),
                }
                if let Some(archive) = &self.archive {
                    if let Err(e) = archive.save(&snapshot) {
                        warn!("[{}] Failed to archive run: {}", id, e);
                    }
                }
            }
            None => warn!("[{}] Could not move run to {}", id, status),
        }
        status_tx.send_replace(status);
    }
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    if let Some(text) = payload.downcast_ref::<&str>() {
        format!("run task panicked: {}", text)
    } else if let Some(text) = payload.downcast_ref::<String>() {
        format!("run task panicked: {}", text)
    } else {
        "run task panicked".to_string()
    }
}
