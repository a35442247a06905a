//! Language-model endpoint: OpenAI-compatible chat completions.
//!
//! The model is only used for classification fallback and for free-form answers when no
//! response template fits. Output that cannot be parsed, including output cut off at
//! `max_tokens`, is re-prompted once with the parse error echoed back; a second failure is a
//! `ModelOutput` error that callers turn into a templated reply.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ClientHandle, Gateway, Target, UpstreamError};
use crate::error::{OpsError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    /// The model stopped at `max_tokens`.
    pub truncated: bool,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(
        &self,
        client: &ClientHandle,
        request: &CompletionRequest,
    ) -> std::result::Result<Completion, UpstreamError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

/// Chat-completions client for any OpenAI-compatible endpoint (OpenRouter, vLLM, Azure, ...).
pub struct ChatCompletionsModel {
    api_key: Option<String>,
    model: String,
}

impl ChatCompletionsModel {
    pub fn new(api_key: Option<String>, model: &str) -> Self {
        Self {
            api_key: api_key
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty()),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl LanguageModel for ChatCompletionsModel {
    async fn complete(
        &self,
        client: &ClientHandle,
        request: &CompletionRequest,
    ) -> std::result::Result<Completion, UpstreamError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let mut req = client
            .http()
            .post(client.url("chat/completions"))
            .header("Content-Type", "application/json")
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let res = req.send().await.map_err(UpstreamError::from_reqwest)?;
        let status = res.status();
        if !status.is_success() {
            debug!(target: "opsflow::gateway", status = status.as_u16(), "model endpoint error response");
            return Err(UpstreamError::from_status(status));
        }
        let parsed: ChatResponse = res.json().await.map_err(UpstreamError::from_reqwest)?;
        let choice = parsed.choices.into_iter().next();
        let truncated = choice
            .as_ref()
            .and_then(|c| c.finish_reason.as_deref())
            .map(|r| r == "length")
            .unwrap_or(false);
        let text = choice.and_then(|c| c.message.content).unwrap_or_default();
        Ok(Completion { text, truncated })
    }
}

/// Pull the JSON object out of a model reply: fenced ```json blocks first, then the outermost
/// `{ ... }` span.
pub fn extract_json(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            let inner = after[..end].trim();
            if inner.starts_with('{') {
                return Some(inner);
            }
        }
    }
    let open = trimmed.find('{')?;
    let close = trimmed.rfind('}')?;
    (close > open).then(|| &trimmed[open..=close])
}

fn parse_structured<T: DeserializeOwned>(completion: &Completion) -> std::result::Result<T, String> {
    if completion.truncated {
        return Err("response was truncated at max_tokens".to_string());
    }
    let json = extract_json(&completion.text).ok_or_else(|| "no JSON object found".to_string())?;
    serde_json::from_str::<T>(json).map_err(|e| e.to_string())
}

impl Gateway {
    /// Request defaults from config (`llm.max_tokens`, `llm.temperature`).
    pub fn completion_request(&self, system: &str, user: &str) -> CompletionRequest {
        CompletionRequest {
            system: system.to_string(),
            user: user.to_string(),
            max_tokens: self.llm_defaults.0,
            temperature: self.llm_defaults.1,
        }
    }

    /// One raw completion through the `LanguageModel` circuit.
    pub async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        let model: Arc<dyn LanguageModel> = match &self.model {
            Some(m) => Arc::clone(m),
            None => {
                return Err(OpsError::Configuration(
                    "no language model configured".to_string(),
                ))
            }
        };
        self.call(Target::LanguageModel, "complete", move |client| async move {
            model.complete(&client, &request).await
        })
        .await
    }

    /// Free text. An empty or truncated reply is re-prompted once.
    pub async fn complete_text(&self, request: CompletionRequest) -> Result<String> {
        let first = self.complete(request.clone()).await?;
        if !first.truncated && !first.text.trim().is_empty() {
            return Ok(first.text);
        }
        warn!(target: "opsflow::gateway", truncated = first.truncated, "unusable model reply; re-prompting once");
        let mut retry = request;
        retry.user.push_str(
            "\n\nYour previous reply was empty or cut off. Answer again in at most three short sentences.",
        );
        let second = self.complete(retry).await?;
        if second.truncated || second.text.trim().is_empty() {
            return Err(OpsError::ModelOutput(
                "model reply empty or truncated after re-prompt".to_string(),
            ));
        }
        Ok(second.text)
    }

    /// JSON reply deserialized into `T`. On a parse failure the model is asked once more with
    /// the parse error echoed; a second failure returns `ModelOutput`.
    pub async fn structured_completion<T: DeserializeOwned>(
        &self,
        request: CompletionRequest,
    ) -> Result<T> {
        let first = self.complete(request.clone()).await?;
        let err = match parse_structured::<T>(&first) {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        warn!(target: "opsflow::gateway", error = %err, "malformed model output; re-prompting once");
        let mut retry = request;
        retry.user.push_str(&format!(
            "\n\nYour previous reply could not be parsed: {}. Reply with a single JSON object only.",
            err
        ));
        let second = self.complete(retry).await?;
        parse_structured::<T>(&second).map_err(OpsError::ModelOutput)
    }
}
