//! AI answer backend and chat profile boundaries

use async_trait::async_trait;

use crate::error::BillingResult;

/// Reply produced by the answer backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Answer {
    pub text: String,
    /// Opaque conversation handle to send back on the next turn
    pub conversation_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnswerError {
    #[error("answer backend overloaded")]
    Overloaded,

    #[error("answer backend failed: {0}")]
    Failed(String),
}

#[async_trait]
pub trait AnswerBackend: Send + Sync {
    async fn ask(
        &self,
        message: &str,
        identity: &str,
        conversation_token: Option<&str>,
    ) -> Result<Answer, AnswerError>;
}

/// Display-name lookup on the chat platform
#[async_trait]
pub trait ProfileSource: Send + Sync {
    async fn display_name(&self, identity: &str) -> BillingResult<String>;
}
