//! OpenAI-compatible chat completion client.
//!
//! Shared by the intent classifier (hybrid query weighting) and the account
//! judge (human vs brand). One call is one HTTP request; retries, timeouts
//! and rate budgets are applied by the callers.
//!
//! Error mapping:
//! - HTTP 429 (rate limited) and 5xx (server error) → retryable
//! - HTTP 4xx (client error, not 429) → fatal
//! - Network errors → retryable

use anyhow::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use profile_fusion_core::FusionError;

use crate::config::{api_key_from_env, LlmConfig};

/// Chat message for a completion request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
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

/// The assistant's reply and the metered token usage, if reported.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub content: String,
    pub total_tokens: Option<u64>,
}

/// Rough token estimate used to reserve budget before a call.
pub fn estimate_tokens(messages: &[ChatMessage], max_tokens: u32) -> u64 {
    let chars: usize = messages.iter().map(|m| m.content.len()).sum();
    (chars / 4) as u64 + u64::from(max_tokens)
}

#[derive(Clone)]
pub struct ChatClient {
    http: Client,
    url: String,
    model: String,
    api_key: String,
    max_tokens: u32,
}

impl ChatClient {
    /// Build a client from an `[intent]` or `[classifier]` section.
    ///
    /// Fails when the API key variable is not set.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key = api_key_from_env(&config.api_key_env)?;
        Ok(Self::new(
            config.url.clone(),
            config.model.clone(),
            api_key,
            config.max_tokens,
        ))
    }

    pub fn new(url: String, model: String, api_key: String, max_tokens: u32) -> Self {
        Self {
            http: Client::new(),
            url,
            model,
            api_key,
            max_tokens,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn max_tokens(&self) -> u32 {
        self.max_tokens
    }

    /// Send one completion request at temperature 0.
    pub async fn complete(&self, messages: &[ChatMessage]) -> Result<Completion, FusionError> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0.0,
            "max_tokens": self.max_tokens,
        });

        let response = self
            .http
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| FusionError::external("chat completion", e.to_string(), true))?;

        let status = response.status();
        if !status.is_success() {
            let retryable = status.as_u16() == 429 || status.is_server_error();
            let text = response.text().await.unwrap_or_default();
            return Err(FusionError::external(
                "chat completion",
                format!("HTTP {}: {}", status, truncate(&text, 200)),
                retryable,
            ));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| FusionError::external("chat completion", e.to_string(), true))?;
        parse_completion(&json)
    }
}

/// Extract `choices[0].message.content` and `usage.total_tokens`.
pub fn parse_completion(json: &serde_json::Value) -> Result<Completion, FusionError> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| {
            FusionError::external("chat completion", "response has no message content", false)
        })?;
    Ok(Completion {
        content: content.trim().to_string(),
        total_tokens: json.pointer("/usage/total_tokens").and_then(|t| t.as_u64()),
    })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
