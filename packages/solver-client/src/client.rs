//! The solver HTTP client and the `Solver` trait seam.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Result, SolverError};

/// A single chat message in the completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Trait abstracting the text-completion endpoint.
///
/// Implementations wrap the real HTTP endpoint or a scripted mock. Extraction
/// code depends on this trait, never on `SolverClient` directly.
#[async_trait]
pub trait Solver: Send + Sync {
    /// Run a completion with an explicit temperature.
    async fn complete_with_temperature(&self, messages: &[ChatMessage], temperature: f32)
        -> Result<String>;

    /// Run a completion at the default extraction temperature (0.2).
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.complete_with_temperature(&[ChatMessage::user(prompt)], 0.2)
            .await
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

/// HTTP client for the solver endpoint.
#[derive(Clone)]
pub struct SolverClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
}

impl SolverClient {
    /// Create a client against an explicit endpoint URL and model id.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_default(),
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            max_tokens: 2048,
        }
    }

    /// Create from `SOLVER_URL`, `SOLVER_MODEL_ID` and optional `SOLVER_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("SOLVER_URL")
            .map_err(|_| SolverError::Config("SOLVER_URL not set".to_string()))?;
        let model = std::env::var("SOLVER_MODEL_ID")
            .map_err(|_| SolverError::Config("SOLVER_MODEL_ID not set".to_string()))?;
        let mut client = Self::new(base_url, model);
        if let Ok(key) = std::env::var("SOLVER_API_KEY") {
            client.api_key = Some(key);
        }
        Ok(client)
    }

    /// Set the bearer API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Set the completion token cap (default 2048).
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Current model id.
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl Solver for SolverClient {
    async fn complete_with_temperature(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String> {
        let request = CompletionRequest {
            model: &self.model,
            messages,
            temperature,
            max_tokens: self.max_tokens,
        };

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        tracing::debug!(model = %self.model, temperature, "solver completion starting");

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = status.as_u16(), "solver returned error status");
            return Err(SolverError::Status {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|e| SolverError::Malformed(e.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| SolverError::Malformed("empty choices array".to_string()))
    }
}
