use serde_json::json;
use tokio::sync::broadcast;

use miya_types::{BackgroundTask, HostEvent};

pub const TASK_LAUNCHED_EVENT: &str = "background.task.launched";
pub const TASK_STARTED_EVENT: &str = "background.task.started";
pub const TASK_COMPLETED_EVENT: &str = "background.task.completed";
pub const TASK_FAILED_EVENT: &str = "background.task.failed";
pub const TASK_CANCELLED_EVENT: &str = "background.task.cancelled";

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HostEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(2048);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: HostEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn task_event(event_type: &str, task: &BackgroundTask) -> HostEvent {
    HostEvent::new(
        event_type,
        json!({
            "taskID": task.id,
            "sessionID": task.session_id,
            "parentSessionID": task.parent_session_id,
            "agent": task.agent,
            "status": task.status,
            "error": task.error,
        }),
    )
}
