use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use miya_observability::{emit_event, redact_text, ObservabilityEvent};
use miya_types::{
    BackgroundTask, CreateSessionRequest, HostEvent, LaunchInput, MessagePart, ModelSpec,
    PromptBody, TaskStatus, SESSION_STATUS_EVENT, SESSION_STATUS_IDLE,
};

use crate::admission::AdmissionController;
use crate::completion::{parent_notice, result_or_placeholder};
use crate::config::PluginConfig;
use crate::delegation::{allowed_subagents, is_delegation_allowed, tool_permissions_for};
use crate::error::{BackgroundError, Result};
use crate::event_bus::{
    task_event, EventBus, TASK_CANCELLED_EVENT, TASK_COMPLETED_EVENT, TASK_FAILED_EVENT,
    TASK_LAUNCHED_EVENT, TASK_STARTED_EVENT,
};
use crate::fallback::{AttemptFailure, FallbackExecutor};
use crate::platform::SessionPlatform;
use crate::registry::{TaskOutcome, TaskRegistry};

const COMPONENT: &str = "background.manager";

pub const CREATE_SESSION_FAILED: &str = "Failed to create background session";

#[derive(Clone, Default)]
pub struct ManagerOptions {
    /// Working directory passed along when creating child sessions.
    pub directory: Option<String>,
    pub event_bus: EventBus,
}

/// Live view of one launched task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: String,
    record: watch::Receiver<BackgroundTask>,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn snapshot(&self) -> BackgroundTask {
        self.record.borrow().clone()
    }

    pub fn status(&self) -> TaskStatus {
        self.record.borrow().status
    }

    /// Resolves once the task is terminal.
    pub async fn wait(&mut self) -> BackgroundTask {
        let _ = self.record.wait_for(|task| task.is_terminal()).await;
        self.snapshot()
    }
}

enum StartOutcome {
    Running {
        session_id: String,
        model: Option<ModelSpec>,
    },
    Failed {
        error: String,
        session_id: Option<String>,
    },
    Cancelled,
}

enum Settled {
    Running(BackgroundTask, Option<ModelSpec>),
    Terminal(BackgroundTask),
}

struct State {
    registry: TaskRegistry,
    admission: AdmissionController,
}

struct Inner {
    platform: Arc<dyn SessionPlatform>,
    config: PluginConfig,
    directory: Option<String>,
    fallback: FallbackExecutor,
    events: EventBus,
    state: Mutex<State>,
    continuations: watch::Sender<usize>,
}

struct ContinuationGuard {
    inner: Arc<Inner>,
}

impl Drop for ContinuationGuard {
    fn drop(&mut self) {
        self.inner
            .continuations
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

/// Launches agent prompts into child sessions and tracks them until they
/// settle. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct BackgroundTaskManager {
    inner: Arc<Inner>,
}

impl BackgroundTaskManager {
    pub fn new(platform: Arc<dyn SessionPlatform>, config: PluginConfig) -> Result<Self> {
        Self::with_options(platform, config, ManagerOptions::default())
    }

    pub fn with_options(
        platform: Arc<dyn SessionPlatform>,
        config: PluginConfig,
        options: ManagerOptions,
    ) -> Result<Self> {
        config.validate()?;
        let (continuations, _) = watch::channel(0usize);
        let state = State {
            registry: TaskRegistry::new(),
            admission: AdmissionController::new(config.background.max_concurrent_starts),
        };
        Ok(Self {
            inner: Arc::new(Inner {
                platform,
                fallback: FallbackExecutor::new(config.fallback_timeout()),
                config,
                directory: options.directory,
                events: options.event_bus,
                state: Mutex::new(state),
                continuations,
            }),
        })
    }

    pub fn config(&self) -> &PluginConfig {
        &self.inner.config
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.inner.events
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<HostEvent> {
        self.inner.events.subscribe()
    }

    /// Registers a task and returns without waiting on the platform. The
    /// task is `starting` when a start slot was free, `pending` otherwise.
    pub fn launch(&self, input: LaunchInput) -> Result<TaskHandle> {
        validate_launch(&input)?;
        if Handle::try_current().is_err() {
            return Err(BackgroundError::NoRuntime);
        }

        let task = BackgroundTask::new(generate_task_id(), input);
        let (record, start) = {
            let mut state = self.inner.state.lock();
            let record = state.registry.insert(task.clone());
            let start = if state.admission.admit(&task.id) {
                let start = state.registry.begin_start(&task.id);
                if start.is_none() {
                    state.admission.release();
                }
                start
            } else {
                None
            };
            (record, start)
        };

        emit_event(
            Level::INFO,
            ObservabilityEvent {
                event: "task.launched",
                component: COMPONENT,
                task_id: Some(&task.id),
                parent_session_id: Some(&task.parent_session_id),
                agent: Some(&task.agent),
                status: Some(record.borrow().status.as_str()),
                detail: Some(&redact_text(&task.prompt)),
                ..Default::default()
            },
        );
        self.inner
            .events
            .publish(task_event(TASK_LAUNCHED_EVENT, &task));

        if let Some((started, cancel)) = start {
            self.spawn_start(started, cancel);
        }
        Ok(TaskHandle {
            id: task.id,
            record,
        })
    }

    /// Cancels one task, or every task when `task_id` is `None`. Returns how
    /// many tasks this call moved to `cancelled`.
    pub fn cancel(&self, task_id: Option<&str>) -> usize {
        let cancelled = {
            let mut state = self.inner.state.lock();
            let ids = match task_id {
                Some(id) => vec![id.to_string()],
                None => state.registry.ids(),
            };
            let mut cancelled = Vec::new();
            for id in ids {
                if let Some(task) = state.registry.finish(&id, TaskOutcome::Cancelled) {
                    state.admission.remove(&id);
                    cancelled.push(task);
                }
            }
            cancelled
        };
        let count = cancelled.len();
        for task in cancelled {
            self.after_terminal(task);
        }
        count
    }

    /// Cancels everything and drops the start queue.
    pub fn shutdown(&self) -> usize {
        let drained = self.inner.state.lock().admission.clear_queue();
        let cancelled = self.cancel(None);
        tracing::info!(
            cancelled,
            queued = drained.len(),
            "background task manager shut down"
        );
        cancelled
    }

    pub fn get_result(&self, task_id: &str) -> Option<BackgroundTask> {
        self.inner.state.lock().registry.snapshot(task_id)
    }

    pub fn list_tasks(&self) -> Vec<BackgroundTask> {
        self.inner.state.lock().registry.list()
    }

    /// Waits until the task is terminal or `timeout` passes, then returns the
    /// latest snapshot either way. `None` only for unknown ids.
    pub async fn wait_for_completion(
        &self,
        task_id: &str,
        timeout: Option<Duration>,
    ) -> Option<BackgroundTask> {
        let mut record = self.inner.state.lock().registry.subscribe(task_id)?;
        let wait = record.wait_for(|task| task.is_terminal());
        match timeout {
            Some(limit) => {
                let _ = tokio::time::timeout(limit, wait).await;
            }
            None => {
                let _ = wait.await;
            }
        }
        let snapshot = record.borrow().clone();
        Some(snapshot)
    }

    /// Agent bound to `session_id`, or the root agent for outside sessions.
    pub fn session_agent(&self, session_id: &str) -> String {
        self.inner
            .state
            .lock()
            .registry
            .bindings()
            .resolve(session_id)
            .to_string()
    }

    pub fn is_agent_allowed(&self, parent_session_id: &str, agent: &str) -> bool {
        let parent_agent = self.session_agent(parent_session_id);
        is_delegation_allowed(&parent_agent, agent)
    }

    pub fn get_allowed_subagents(&self, parent_session_id: &str) -> Vec<String> {
        let parent_agent = self.session_agent(parent_session_id);
        allowed_subagents(&parent_agent)
            .iter()
            .map(|agent| agent.to_string())
            .collect()
    }

    /// Completes the running task bound to the event's session once that
    /// session reports idle. Anything else is ignored.
    pub async fn handle_session_status(&self, event: &HostEvent) {
        if event.event_type != SESSION_STATUS_EVENT {
            return;
        }
        let Some(session_id) = event.session_id() else {
            return;
        };
        let task_id = self
            .inner
            .state
            .lock()
            .registry
            .running_task_for_session(session_id);
        let Some(task_id) = task_id else {
            return;
        };
        if event.status_type() != Some(SESSION_STATUS_IDLE) {
            return;
        }

        let outcome = match self.inner.platform.fetch_messages(session_id).await {
            Ok(messages) => TaskOutcome::Completed(result_or_placeholder(&messages)),
            Err(err) => TaskOutcome::Failed {
                error: format!("{err:#}"),
                session_id: None,
            },
        };
        let finished = self.inner.state.lock().registry.finish(&task_id, outcome);
        match finished {
            Some(task) => self.after_terminal(task),
            None => tracing::debug!(
                task_id = %task_id,
                session_id = %session_id,
                "idle event arrived after task settled"
            ),
        }
    }

    /// Resolves when no start sequence or parent notification is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.inner.continuations.subscribe();
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    fn spawn_tracked<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!("no tokio runtime available; dropping background continuation");
            return;
        };
        self.inner.continuations.send_modify(|count| *count += 1);
        let guard = ContinuationGuard {
            inner: self.inner.clone(),
        };
        runtime.spawn(async move {
            let _guard = guard;
            future.await;
        });
    }

    fn spawn_start(&self, task: BackgroundTask, cancel: CancellationToken) {
        let manager = self.clone();
        self.spawn_tracked(async move {
            manager.run_start(task, cancel).await;
        });
    }

    async fn run_start(&self, task: BackgroundTask, cancel: CancellationToken) {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => StartOutcome::Cancelled,
            outcome = self.start_session(&task) => outcome,
        };
        self.settle_start(&task, outcome);
    }

    async fn start_session(&self, task: &BackgroundTask) -> StartOutcome {
        let request = CreateSessionRequest {
            parent_id: task.parent_session_id.clone(),
            title: format!("Background: {}", task.description),
            directory: self.inner.directory.clone(),
        };
        let created = match self.inner.platform.create_session(request).await {
            Ok(created) => created,
            Err(err) => {
                return StartOutcome::Failed {
                    error: format!("{err:#}"),
                    session_id: None,
                }
            }
        };
        let Some(session_id) = created.usable_id().map(str::to_string) else {
            return StartOutcome::Failed {
                error: CREATE_SESSION_FAILED.to_string(),
                session_id: None,
            };
        };
        self.inner
            .state
            .lock()
            .registry
            .bind_session(&session_id, &task.agent);

        let base = PromptBody {
            agent: Some(task.agent.clone()),
            model: None,
            variant: self.inner.config.agent_variant(&task.agent).map(str::to_string),
            tools: Some(tool_permissions_for(&task.agent)),
            parts: vec![MessagePart::text(task.prompt.clone())],
        };
        let chain = self.inner.config.fallback_chain(&task.agent);
        let platform = self.inner.platform.clone();
        let result = self
            .inner
            .fallback
            .run(&chain, |model| {
                let platform = platform.clone();
                let session_id = session_id.clone();
                let body = PromptBody {
                    model,
                    ..base.clone()
                };
                async move { platform.prompt(&session_id, body).await }
            })
            .await;

        match result {
            Ok(success) => {
                self.log_failed_attempts(task, &session_id, &success.failures);
                StartOutcome::Running {
                    session_id,
                    model: success.model,
                }
            }
            Err(err) => {
                self.log_failed_attempts(task, &session_id, &err.failures);
                StartOutcome::Failed {
                    error: err.to_string(),
                    session_id: Some(session_id),
                }
            }
        }
    }

    fn log_failed_attempts(
        &self,
        task: &BackgroundTask,
        session_id: &str,
        failures: &[AttemptFailure],
    ) {
        for failure in failures {
            emit_event(
                Level::WARN,
                ObservabilityEvent {
                    event: "fallback.attempt.failed",
                    component: COMPONENT,
                    task_id: Some(&task.id),
                    session_id: Some(session_id),
                    agent: Some(&task.agent),
                    model: Some(&failure.candidate),
                    detail: Some(&failure.reason),
                    ..Default::default()
                },
            );
        }
    }

    fn settle_start(&self, task: &BackgroundTask, outcome: StartOutcome) {
        let (settled, ready) = {
            let mut state = self.inner.state.lock();
            let settled = match outcome {
                StartOutcome::Running { session_id, model } => state
                    .registry
                    .mark_running(&task.id, &session_id)
                    .map(|snapshot| Settled::Running(snapshot, model)),
                StartOutcome::Failed { error, session_id } => state
                    .registry
                    .finish(&task.id, TaskOutcome::Failed { error, session_id })
                    .map(Settled::Terminal),
                StartOutcome::Cancelled => None,
            };
            state.admission.release();
            let ready = drain_ready(&mut state);
            (settled, ready)
        };

        match settled {
            Some(Settled::Running(snapshot, model)) => {
                let model = model.as_ref().map(ToString::to_string);
                emit_event(
                    Level::INFO,
                    ObservabilityEvent {
                        event: "task.started",
                        component: COMPONENT,
                        task_id: Some(&snapshot.id),
                        session_id: snapshot.session_id.as_deref(),
                        parent_session_id: Some(&snapshot.parent_session_id),
                        agent: Some(&snapshot.agent),
                        model: model.as_deref(),
                        status: Some(snapshot.status.as_str()),
                        ..Default::default()
                    },
                );
                self.inner
                    .events
                    .publish(task_event(TASK_STARTED_EVENT, &snapshot));
            }
            Some(Settled::Terminal(snapshot)) => self.after_terminal(snapshot),
            None => tracing::debug!(
                task_id = %task.id,
                "start sequence settled after the task left starting"
            ),
        }

        for (next, cancel) in ready {
            self.spawn_start(next, cancel);
        }
    }

    fn after_terminal(&self, task: BackgroundTask) {
        let (level, event, bus_event) = match task.status {
            TaskStatus::Failed => (Level::WARN, "task.failed", TASK_FAILED_EVENT),
            TaskStatus::Cancelled => (Level::INFO, "task.cancelled", TASK_CANCELLED_EVENT),
            _ => (Level::INFO, "task.completed", TASK_COMPLETED_EVENT),
        };
        emit_event(
            level,
            ObservabilityEvent {
                event,
                component: COMPONENT,
                task_id: Some(&task.id),
                session_id: task.session_id.as_deref(),
                parent_session_id: Some(&task.parent_session_id),
                agent: Some(&task.agent),
                status: Some(task.status.as_str()),
                detail: task.error.as_deref(),
                ..Default::default()
            },
        );
        self.inner.events.publish(task_event(bus_event, &task));
        self.notify_parent(task);
    }

    fn notify_parent(&self, task: BackgroundTask) {
        let platform = self.inner.platform.clone();
        self.spawn_tracked(async move {
            let notice = parent_notice(&task);
            if let Err(err) = platform
                .prompt(&task.parent_session_id, PromptBody::text(notice))
                .await
            {
                let detail = format!("{err:#}");
                emit_event(
                    Level::WARN,
                    ObservabilityEvent {
                        event: "notification.failed",
                        component: COMPONENT,
                        task_id: Some(&task.id),
                        parent_session_id: Some(&task.parent_session_id),
                        agent: Some(&task.agent),
                        status: Some(task.status.as_str()),
                        detail: Some(&detail),
                        ..Default::default()
                    },
                );
            }
        });
    }
}

fn drain_ready(state: &mut State) -> Vec<(BackgroundTask, CancellationToken)> {
    let mut ready = Vec::new();
    while let Some(next) = state.admission.next_ready() {
        match state.registry.begin_start(&next) {
            Some(started) => ready.push(started),
            None => state.admission.release(),
        }
    }
    ready
}

fn validate_launch(input: &LaunchInput) -> Result<()> {
    for (field, value) in [
        ("agent", &input.agent),
        ("prompt", &input.prompt),
        ("description", &input.description),
        ("parentSessionId", &input.parent_session_id),
    ] {
        if value.trim().is_empty() {
            return Err(BackgroundError::InvalidLaunch(format!(
                "{field} must not be empty"
            )));
        }
    }
    Ok(())
}

fn generate_task_id() -> String {
    format!("bg_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use miya_types::{CreatedSession, SessionMessage};

    struct Unreachable;

    #[async_trait]
    impl SessionPlatform for Unreachable {
        async fn create_session(&self, _: CreateSessionRequest) -> anyhow::Result<CreatedSession> {
            anyhow::bail!("unreachable")
        }

        async fn prompt(&self, _: &str, _: PromptBody) -> anyhow::Result<()> {
            anyhow::bail!("unreachable")
        }

        async fn fetch_messages(&self, _: &str) -> anyhow::Result<Vec<SessionMessage>> {
            anyhow::bail!("unreachable")
        }
    }

    fn manager() -> BackgroundTaskManager {
        BackgroundTaskManager::new(Arc::new(Unreachable), PluginConfig::default())
            .expect("manager")
    }

    #[test]
    fn task_ids_are_prefixed_and_unique() {
        let a = generate_task_id();
        let b = generate_task_id();
        assert!(a.starts_with("bg_"));
        assert_ne!(a, b);
    }

    #[test]
    fn blank_fields_are_rejected() {
        let err = validate_launch(&LaunchInput::new("2-code-search", "  ", "d", "ses_1"))
            .expect_err("blank prompt");
        assert!(err.to_string().contains("prompt"));
        assert!(validate_launch(&LaunchInput::new("a", "p", "d", "s")).is_ok());
    }

    #[test]
    fn launch_outside_runtime_fails_without_registering() {
        let manager = manager();
        let err = manager
            .launch(LaunchInput::new("2-code-search", "find", "search", "ses_1"))
            .expect_err("no runtime");
        assert!(matches!(err, BackgroundError::NoRuntime));
        assert!(manager.list_tasks().is_empty());
    }

    #[test]
    fn invalid_config_is_refused() {
        let mut config = PluginConfig::default();
        config.background.max_concurrent_starts = Some(0);
        assert!(BackgroundTaskManager::new(Arc::new(Unreachable), config).is_err());
    }

    #[tokio::test]
    async fn create_failure_marks_task_failed() {
        let manager = manager();
        let handle = manager
            .launch(LaunchInput::new("2-code-search", "find", "search", "ses_1"))
            .expect("launch");
        manager.wait_idle().await;
        let task = handle.snapshot();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("unreachable"));
        assert!(task.session_id.is_none());
    }
}
