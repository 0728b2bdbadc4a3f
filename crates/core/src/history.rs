use async_trait::async_trait;

/// Collaborator told about every call that ends, so the companion's session history can
/// be updated.
#[async_trait]
pub trait SessionHistory: Send + Sync {
    async fn session_ended(&self, companion_id: &str) -> anyhow::Result<()>;
}

/// Keeps no history.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHistory;

#[async_trait]
impl SessionHistory for NoopHistory {
    async fn session_ended(&self, companion_id: &str) -> anyhow::Result<()> {
        tracing::debug!(companion_id, "Session ended; history disabled.");
        Ok(())
    }
}
