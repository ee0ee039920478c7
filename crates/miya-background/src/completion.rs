use miya_types::{BackgroundTask, MessageRole, SessionMessage, TaskStatus};

pub const NO_OUTPUT: &str = "(No output)";

/// Joins the readable text of every assistant message, in order, with a
/// blank line between parts. Returns `None` when nothing readable remains.
pub fn extract_result(messages: &[SessionMessage]) -> Option<String> {
    let chunks: Vec<&str> = messages
        .iter()
        .filter(|message| message.role == MessageRole::Assistant)
        .flat_map(|message| message.parts.iter())
        .filter_map(|part| part.readable_text())
        .collect();
    if chunks.is_empty() {
        return None;
    }
    Some(chunks.join("\n\n"))
}

pub fn result_or_placeholder(messages: &[SessionMessage]) -> String {
    extract_result(messages).unwrap_or_else(|| NO_OUTPUT.to_string())
}

/// Text posted back into the parent session once a task settles.
pub fn parent_notice(task: &BackgroundTask) -> String {
    match task.status {
        TaskStatus::Failed => format!(
            "[Background task \"{}\" failed: {}]",
            task.description,
            task.error.as_deref().unwrap_or("unknown error")
        ),
        TaskStatus::Cancelled => format!("[Background task \"{}\" cancelled]", task.description),
        _ => format!("[Background task \"{}\" completed]", task.description),
    }
}
