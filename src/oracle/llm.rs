//! Oracle backed by an OpenAI-compatible chat completion endpoint.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::model::{Ms, Reservation};

use super::parse::{
    intent_prompt, judgment_prompt, parse_intent_reply, parse_judgment_reply, parse_score_reply,
    priority_prompt,
};
use super::{Judgment, Oracle, OracleError, ParsedIntent};

/// Sends one user message per call to `POST {base_url}/v1/chat/completions`
/// and parses the first choice's content.
pub struct LlmOracle {
    base_url: String,
    api_key: Option<String>,
    model: String,
    request_timeout: Duration,
    /// Shared HTTP client for connection pooling
    client: Arc<Client>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ReplyMessage,
}

#[derive(Deserialize)]
struct ReplyMessage {
    #[serde(default)]
    content: Option<String>,
}

impl LlmOracle {
    pub fn new(
        base_url: String,
        api_key: Option<String>,
        model: String,
        request_timeout: Duration,
        client: Arc<Client>,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model,
            request_timeout,
            client,
        }
    }

    async fn complete(&self, prompt: &str) -> Result<String, OracleError> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: 0.0,
        };

        let mut request = self
            .client
            .post(&url)
            .json(&body)
            .timeout(self.request_timeout);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let timeout_ms = self.request_timeout.as_millis() as u64;
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                OracleError::Timeout(timeout_ms)
            } else {
                OracleError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(OracleError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                OracleError::Timeout(timeout_ms)
            } else {
                OracleError::InvalidResponse(format!("chat completion body: {e}"))
            }
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| OracleError::InvalidResponse("empty completion".into()))
    }
}

#[async_trait]
impl Oracle for LlmOracle {
    fn name(&self) -> &str {
        &self.model
    }

    async fn parse_intent(&self, text: &str, reference: Ms) -> Result<ParsedIntent, OracleError> {
        let reply = self.complete(&intent_prompt(text, reference)).await?;
        parse_intent_reply(&reply)
    }

    async fn score_priority(&self, purpose: &str, duration_hours: f64) -> Result<i64, OracleError> {
        let reply = self.complete(&priority_prompt(purpose, duration_hours)).await?;
        parse_score_reply(&reply)
    }

    async fn judge_conflict(
        &self,
        candidate: &Reservation,
        incumbent: &Reservation,
    ) -> Result<Judgment, OracleError> {
        let reply = self.complete(&judgment_prompt(candidate, incumbent)).await?;
        parse_judgment_reply(&reply)
    }
}
