//! Dify chat-messages client

use async_trait::async_trait;
use quotagate_billing::{Answer, AnswerBackend, AnswerError};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct ChatRequest<'a> {
    inputs: serde_json::Map<String, serde_json::Value>,
    query: &'a str,
    response_mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    user: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    answer: String,
    #[serde(default)]
    conversation_id: Option<String>,
}

/// Blocking-mode Dify client
#[derive(Clone)]
pub struct DifyClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
}

impl DifyClient {
    pub fn new(http: reqwest::Client, api_url: &str, api_key: &str) -> Self {
        Self {
            http,
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

fn is_overloaded(status: StatusCode, body: &str) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::SERVICE_UNAVAILABLE
        || body.to_ascii_lowercase().contains("overloaded")
}

#[async_trait]
impl AnswerBackend for DifyClient {
    async fn ask(
        &self,
        message: &str,
        identity: &str,
        conversation_token: Option<&str>,
    ) -> Result<Answer, AnswerError> {
        let request = ChatRequest {
            inputs: serde_json::Map::new(),
            query: message,
            response_mode: "blocking",
            conversation_id: conversation_token.filter(|t| !t.is_empty()),
            user: identity,
        };

        let response = self
            .http
            .post(format!("{}/chat-messages", self.api_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AnswerError::Failed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if is_overloaded(status, &body) {
                return Err(AnswerError::Overloaded);
            }
            return Err(AnswerError::Failed(format!("dify returned {}: {}", status, body)));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AnswerError::Failed(format!("dify response: {}", e)))?;

        Ok(Answer {
            text: parsed.answer,
            conversation_token: parsed.conversation_id.filter(|id| !id.is_empty()),
        })
    }
}
