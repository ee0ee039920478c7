use std::collections::HashMap;

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use miya_types::{BackgroundTask, TaskStatus};

use crate::delegation::ROOT_AGENT;

/// How a task leaves the non-terminal states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed(String),
    Failed {
        error: String,
        session_id: Option<String>,
    },
    Cancelled,
}

impl TaskOutcome {
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskOutcome::Completed(_) => TaskStatus::Completed,
            TaskOutcome::Failed { .. } => TaskStatus::Failed,
            TaskOutcome::Cancelled => TaskStatus::Cancelled,
        }
    }
}

struct TaskEntry {
    record: watch::Sender<BackgroundTask>,
    cancel: CancellationToken,
}

/// Session id to the agent running in it. Entries are never removed so late
/// delegation checks from a finished child still resolve.
#[derive(Debug, Default)]
pub struct SessionBindings {
    agents: HashMap<String, String>,
}

impl SessionBindings {
    pub fn bind(&mut self, session_id: impl Into<String>, agent: impl Into<String>) {
        self.agents.insert(session_id.into(), agent.into());
    }

    pub fn agent_for(&self, session_id: &str) -> Option<&str> {
        self.agents.get(session_id).map(String::as_str)
    }

    /// Bound agent, or the root agent for sessions we never spawned.
    pub fn resolve(&self, session_id: &str) -> &str {
        self.agent_for(session_id).unwrap_or(ROOT_AGENT)
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

/// Owns every task record. Each record lives in a `watch` channel so handles
/// and waiters observe transitions without touching the registry lock.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: HashMap<String, TaskEntry>,
    order: Vec<String>,
    running_sessions: HashMap<String, String>,
    bindings: SessionBindings,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, task: BackgroundTask) -> watch::Receiver<BackgroundTask> {
        let id = task.id.clone();
        let (record, rx) = watch::channel(task);
        self.tasks.insert(
            id.clone(),
            TaskEntry {
                record,
                cancel: CancellationToken::new(),
            },
        );
        self.order.push(id);
        rx
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn snapshot(&self, task_id: &str) -> Option<BackgroundTask> {
        self.tasks
            .get(task_id)
            .map(|entry| entry.record.borrow().clone())
    }

    pub fn subscribe(&self, task_id: &str) -> Option<watch::Receiver<BackgroundTask>> {
        self.tasks.get(task_id).map(|entry| entry.record.subscribe())
    }

    pub fn list(&self) -> Vec<BackgroundTask> {
        self.order
            .iter()
            .filter_map(|id| self.snapshot(id))
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.order.clone()
    }

    pub fn status(&self, task_id: &str) -> Option<TaskStatus> {
        self.tasks
            .get(task_id)
            .map(|entry| entry.record.borrow().status)
    }

    pub fn bindings(&self) -> &SessionBindings {
        &self.bindings
    }

    pub fn bind_session(&mut self, session_id: &str, agent: &str) {
        self.bindings.bind(session_id, agent);
    }

    /// `pending -> starting`. Returns the snapshot and the task's cancel
    /// token, or `None` when the task already left `pending`.
    pub fn begin_start(&mut self, task_id: &str) -> Option<(BackgroundTask, CancellationToken)> {
        let entry = self.tasks.get(task_id)?;
        let moved = entry.record.send_if_modified(|task| {
            if task.status != TaskStatus::Pending {
                return false;
            }
            task.status = TaskStatus::Starting;
            true
        });
        if !moved {
            return None;
        }
        Some((entry.record.borrow().clone(), entry.cancel.clone()))
    }

    /// `starting -> running`, recording the session id in the same step.
    pub fn mark_running(&mut self, task_id: &str, session_id: &str) -> Option<BackgroundTask> {
        let entry = self.tasks.get(task_id)?;
        let moved = entry.record.send_if_modified(|task| {
            if task.status != TaskStatus::Starting {
                return false;
            }
            task.session_id = Some(session_id.to_string());
            task.status = TaskStatus::Running;
            true
        });
        if !moved {
            return None;
        }
        self.running_sessions
            .insert(session_id.to_string(), task_id.to_string());
        Some(entry.record.borrow().clone())
    }

    /// Moves a task into a terminal state exactly once. Later calls for the
    /// same task return `None` and change nothing.
    pub fn finish(&mut self, task_id: &str, outcome: TaskOutcome) -> Option<BackgroundTask> {
        let entry = self.tasks.get(task_id)?;
        let moved = entry.record.send_if_modified(|task| {
            if task.is_terminal() {
                return false;
            }
            task.status = outcome.status();
            task.completed_at = Some(Utc::now());
            match &outcome {
                TaskOutcome::Completed(result) => task.result = Some(result.clone()),
                TaskOutcome::Failed { error, session_id } => {
                    task.error = Some(error.clone());
                    if task.session_id.is_none() {
                        task.session_id = session_id.clone();
                    }
                }
                TaskOutcome::Cancelled => {}
            }
            true
        });
        if !moved {
            return None;
        }
        entry.cancel.cancel();
        let snapshot = entry.record.borrow().clone();
        if let Some(session_id) = snapshot.session_id.as_deref() {
            if self.running_sessions.get(session_id).map(String::as_str) == Some(task_id) {
                self.running_sessions.remove(session_id);
            }
        }
        Some(snapshot)
    }

    /// Task currently `running` in `session_id`, if any.
    pub fn running_task_for_session(&self, session_id: &str) -> Option<String> {
        let task_id = self.running_sessions.get(session_id)?;
        (self.status(task_id) == Some(TaskStatus::Running)).then(|| task_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use miya_types::LaunchInput;

    fn task(id: &str) -> BackgroundTask {
        BackgroundTask::new(
            id,
            LaunchInput::new("2-code-search", "find", "search", "ses_parent"),
        )
    }

    #[test]
    fn lifecycle_moves_forward_only() {
        let mut registry = TaskRegistry::new();
        let rx = registry.insert(task("bg_1"));

        assert!(registry.mark_running("bg_1", "ses_child").is_none());
        let (started, token) = registry.begin_start("bg_1").expect("start");
        assert_eq!(started.status, TaskStatus::Starting);
        assert!(registry.begin_start("bg_1").is_none());

        let running = registry.mark_running("bg_1", "ses_child").expect("run");
        assert_eq!(running.session_id.as_deref(), Some("ses_child"));
        assert_eq!(
            registry.running_task_for_session("ses_child").as_deref(),
            Some("bg_1")
        );

        let done = registry
            .finish("bg_1", TaskOutcome::Completed("ok".to_string()))
            .expect("finish");
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.completed_at.is_some());
        assert!(token.is_cancelled());
        assert_eq!(rx.borrow().status, TaskStatus::Completed);
        assert!(registry.running_task_for_session("ses_child").is_none());
    }

    #[test]
    fn terminal_state_is_sticky() {
        let mut registry = TaskRegistry::new();
        registry.insert(task("bg_1"));
        registry
            .finish("bg_1", TaskOutcome::Cancelled)
            .expect("cancel");

        assert!(registry
            .finish("bg_1", TaskOutcome::Completed("late".to_string()))
            .is_none());
        assert!(registry.begin_start("bg_1").is_none());
        let snapshot = registry.snapshot("bg_1").expect("task");
        assert_eq!(snapshot.status, TaskStatus::Cancelled);
        assert!(snapshot.result.is_none());
    }

    #[test]
    fn failure_keeps_existing_session_and_records_new_one() {
        let mut registry = TaskRegistry::new();
        registry.insert(task("bg_1"));
        registry.begin_start("bg_1");
        let failed = registry
            .finish(
                "bg_1",
                TaskOutcome::Failed {
                    error: "All fallback models failed.".to_string(),
                    session_id: Some("ses_child".to_string()),
                },
            )
            .expect("fail");
        assert_eq!(failed.session_id.as_deref(), Some("ses_child"));
        assert_eq!(failed.error.as_deref(), Some("All fallback models failed."));
    }

    #[test]
    fn bindings_default_to_root_agent() {
        let mut registry = TaskRegistry::new();
        assert_eq!(registry.bindings().resolve("ses_unknown"), ROOT_AGENT);
        registry.bind_session("ses_child", "5-code-fixer");
        assert_eq!(registry.bindings().resolve("ses_child"), "5-code-fixer");
        assert_eq!(registry.bindings().len(), 1);
    }

    #[test]
    fn list_preserves_launch_order() {
        let mut registry = TaskRegistry::new();
        for id in ["bg_b", "bg_a", "bg_c"] {
            registry.insert(task(id));
        }
        let ids: Vec<String> = registry.list().into_iter().map(|task| task.id).collect();
        assert_eq!(ids, vec!["bg_b", "bg_a", "bg_c"]);
    }
}
