//! # Response Generator
//!
//! Turns the conversation history into the assistant's next spoken line.
//!
//! ## Fallback policy:
//! 1. Ask the primary model, bounded by the generation timeout
//! 2. If it errors, times out, or answers with nothing, send the *same*
//!    history once to the fallback model
//! 3. If that fails too, report `PipelineError::Generation`; the caller
//!    appends nothing and waits for the next utterance
//!
//! The caller's history is only borrowed: generation never mutates it.

use crate::config::GenerationConfig;
use crate::conversation::instructions::greeting_instruction;
use crate::conversation::session::{ConversationTurn, ReminderKind, Role};
use crate::error::PipelineError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Sampling settings for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Ask the backend for a JSON object instead of free text
    pub json_response: bool,
}

/// A chat-completion capability (one model behind one endpoint).
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn model(&self) -> &str;

    async fn complete(
        &self,
        messages: &[ConversationTurn],
        options: &GenerationOptions,
    ) -> Result<String, PipelineError>;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// OpenAI-compatible `chat/completions` backend.
pub struct OpenAiChatBackend {
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
}

impl OpenAiChatBackend {
    pub fn new(config: &GenerationConfig, model: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .context("failed to build generation HTTP client")?;

        Ok(Self {
            client,
            url: format!("{}/chat/completions", config.endpoint.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl ChatBackend for OpenAiChatBackend {
    fn model(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[ConversationTurn],
        options: &GenerationOptions,
    ) -> Result<String, PipelineError> {
        let request = ChatRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|turn| ChatMessage {
                    role: turn.role.as_str(),
                    content: &turn.content,
                })
                .collect(),
            max_tokens: options.max_tokens,
            temperature: options.temperature,
            response_format: options
                .json_response
                .then_some(ResponseFormat { kind: "json_object" }),
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::Generation(format!("{}: request failed: {}", self.model, e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Generation(format!(
                "{}: API returned {}: {}",
                self.model, status, body
            )));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            PipelineError::Generation(format!("{}: unreadable response: {}", self.model, e))
        })?;

        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default())
    }
}

/// Text produced for one turn and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    pub model: String,
    pub used_fallback: bool,
}

pub struct ResponseGenerator {
    primary: Arc<dyn ChatBackend>,
    fallback: Arc<dyn ChatBackend>,
    reply_options: GenerationOptions,
    greeting_options: GenerationOptions,
    timeout: Duration,
}

impl ResponseGenerator {
    pub fn new(
        primary: Arc<dyn ChatBackend>,
        fallback: Arc<dyn ChatBackend>,
        config: &GenerationConfig,
    ) -> Self {
        Self {
            primary,
            fallback,
            reply_options: GenerationOptions {
                max_tokens: config.max_tokens,
                temperature: config.temperature,
                json_response: false,
            },
            greeting_options: GenerationOptions {
                max_tokens: config.greeting_max_tokens,
                temperature: config.temperature,
                json_response: false,
            },
            timeout: config.timeout(),
        }
    }

    /// Wire both backends to the configured OpenAI-compatible endpoint.
    pub fn from_config(config: &GenerationConfig) -> Result<Self> {
        let primary = Arc::new(OpenAiChatBackend::new(config, &config.primary_model)?);
        let fallback = Arc::new(OpenAiChatBackend::new(config, &config.fallback_model)?);
        Ok(Self::new(primary, fallback, config))
    }

    pub fn primary(&self) -> Arc<dyn ChatBackend> {
        self.primary.clone()
    }

    /// Next assistant line for `history`.
    pub async fn generate(&self, history: &[ConversationTurn]) -> Result<Reply, PipelineError> {
        self.complete_with_fallback(history, &self.reply_options).await
    }

    /// Opening line of the call.
    ///
    /// The greeting instruction is sent as a transient user turn; it is not
    /// part of the session history.
    pub async fn generate_greeting(
        &self,
        history: &[ConversationTurn],
        kind: ReminderKind,
    ) -> Result<Reply, PipelineError> {
        let mut messages = history.to_vec();
        messages.push(ConversationTurn::new(Role::User, greeting_instruction(kind)));
        self.complete_with_fallback(&messages, &self.greeting_options).await
    }

    async fn complete_with_fallback(
        &self,
        messages: &[ConversationTurn],
        options: &GenerationOptions,
    ) -> Result<Reply, PipelineError> {
        let primary_error = match self.attempt(self.primary.as_ref(), messages, options).await {
            Ok(text) => {
                return Ok(Reply {
                    text,
                    model: self.primary.model().to_string(),
                    used_fallback: false,
                })
            }
            Err(e) => e,
        };

        warn!(model = self.primary.model(), "primary model failed, trying fallback: {}", primary_error);

        match self.attempt(self.fallback.as_ref(), messages, options).await {
            Ok(text) => Ok(Reply {
                text,
                model: self.fallback.model().to_string(),
                used_fallback: true,
            }),
            Err(fallback_error) => Err(PipelineError::Generation(format!(
                "primary: {}; fallback: {}",
                primary_error, fallback_error
            ))),
        }
    }

    async fn attempt(
        &self,
        backend: &dyn ChatBackend,
        messages: &[ConversationTurn],
        options: &GenerationOptions,
    ) -> Result<String, PipelineError> {
        let text = tokio::time::timeout(self.timeout, backend.complete(messages, options))
            .await
            .map_err(|_| {
                PipelineError::Generation(format!("{}: timed out after {:?}", backend.model(), self.timeout))
            })??;

        let text = text.trim();
        if text.is_empty() {
            return Err(PipelineError::Generation(format!(
                "{}: empty reply",
                backend.model()
            )));
        }

        debug!(model = backend.model(), characters = text.len(), "reply generated");
        Ok(text.to_string())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedChat;
    use super::*;
    use crate::config::AppConfig;

    fn history() -> Vec<ConversationTurn> {
        vec![
            ConversationTurn::new(Role::System, "be brief"),
            ConversationTurn::new(Role::Assistant, "Hello"),
            ConversationTurn::new(Role::User, "I already sent it back"),
        ]
    }

    fn generator(primary: Arc<ScriptedChat>, fallback: Arc<ScriptedChat>) -> ResponseGenerator {
        let mut config = AppConfig::default().generation;
        config.timeout_secs = 1;
        ResponseGenerator::new(primary, fallback, &config)
    }

    #[tokio::test]
    async fn test_primary_reply_is_used() {
        let primary = ScriptedChat::new("gpt-4o", vec![Ok(" Thank you! ".to_string())]);
        let fallback = ScriptedChat::new("gpt-3.5-turbo", vec![]);

        let reply = generator(primary, fallback.clone()).generate(&history()).await.unwrap();
        assert_eq!(reply.text, "Thank you!");
        assert!(!reply.used_fallback);
        assert!(fallback.requests().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_gets_identical_history() {
        let primary = ScriptedChat::new("gpt-4o", vec![Ok("   ".to_string())]);
        let fallback = ScriptedChat::new("gpt-3.5-turbo", vec![Ok("Great, thanks.".to_string())]);

        let reply = generator(primary.clone(), fallback.clone())
            .generate(&history())
            .await
            .unwrap();

        assert!(reply.used_fallback);
        assert_eq!(reply.model, "gpt-3.5-turbo");
        assert_eq!(primary.requests()[0], fallback.requests()[0]);
    }

    #[tokio::test]
    async fn test_both_failing_yields_generation_error() {
        let primary = ScriptedChat::failing("gpt-4o");
        let fallback = ScriptedChat::failing("gpt-3.5-turbo");
        let history = history();

        let result = generator(primary, fallback).generate(&history).await;
        assert!(matches!(result, Err(PipelineError::Generation(_))));
        assert_eq!(history.len(), 3);
    }

    #[tokio::test]
    async fn test_slow_primary_times_out_into_fallback() {
        let primary = ScriptedChat::with_delay(
            "gpt-4o",
            vec![Ok("late".to_string())],
            Duration::from_secs(5),
        );
        let fallback = ScriptedChat::new("gpt-3.5-turbo", vec![Ok("on time".to_string())]);

        let reply = generator(primary, fallback).generate(&history()).await.unwrap();
        assert_eq!(reply.text, "on time");
    }

    #[tokio::test]
    async fn test_greeting_instruction_is_transient() {
        let primary = ScriptedChat::new("gpt-4o", vec![Ok("Hi, this is your care team.".to_string())]);
        let fallback = ScriptedChat::failing("gpt-3.5-turbo");
        let history = vec![ConversationTurn::new(Role::System, "be brief")];

        let reply = generator(primary.clone(), fallback)
            .generate_greeting(&history, ReminderKind::FitKit)
            .await
            .unwrap();

        assert_eq!(reply.text, "Hi, this is your care team.");
        let sent = &primary.requests()[0];
        assert_eq!(sent.len(), 2);
        assert!(sent[1].content.contains("FIT kit"));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_request_serialization() {
        let turns = history();
        let request = ChatRequest {
            model: "gpt-4o",
            messages: turns
                .iter()
                .map(|t| ChatMessage { role: t.role.as_str(), content: &t.content })
                .collect(),
            max_tokens: 150,
            temperature: 0.7,
            response_format: None,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["messages"][2]["role"], "user");
        assert!(value.get("response_format").is_none());
    }
}
