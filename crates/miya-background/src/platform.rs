use async_trait::async_trait;

use miya_types::{CreateSessionRequest, CreatedSession, PromptBody, SessionMessage};

/// Host agent platform the manager drives. Errors are surfaced verbatim in
/// task failures, so implementations should attach readable context.
#[async_trait]
pub trait SessionPlatform: Send + Sync {
    async fn create_session(&self, request: CreateSessionRequest) -> anyhow::Result<CreatedSession>;

    async fn prompt(&self, session_id: &str, body: PromptBody) -> anyhow::Result<()>;

    async fn fetch_messages(&self, session_id: &str) -> anyhow::Result<Vec<SessionMessage>>;
}
