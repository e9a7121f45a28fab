pub mod prompt;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::{BackendConfig, BackendKind, LlmConfig};
use prompt::PromptLibrary;

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// Transient per-call parameter overrides. Passing them per call (instead of
/// mutating backend state) means the defaults are untouched after the call
/// returns, whatever the outcome.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub model: Option<String>,
}

/// A black-box text-completion service.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, messages: &[ChatMessage], opts: &CallOptions) -> anyhow::Result<String>;
}

// ── OpenAI-compatible HTTP backend ────────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Chat backend speaking the OpenAI-compatible completion API, which covers
/// hosted services and local Ollama-style servers alike.
pub struct HttpBackend {
    name: String,
    client: Client,
    base_url: String,
    api_key: Option<String>,
    default_model: String,
    default_temperature: f64,
    default_max_tokens: u32,
}

impl HttpBackend {
    pub fn new(name: &str, backend: &BackendConfig, llm: &LlmConfig) -> Self {
        Self {
            name: name.to_string(),
            client: Client::new(),
            base_url: backend.host.trim_end_matches('/').to_string(),
            api_key: backend.api_key.clone(),
            default_model: backend.model.clone(),
            default_temperature: llm.temperature,
            default_max_tokens: llm.max_tokens,
        }
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, messages: &[ChatMessage], opts: &CallOptions) -> anyhow::Result<String> {
        let model = opts.model.as_deref().unwrap_or(&self.default_model);
        let request = ChatRequest {
            model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: &m.role,
                    content: &m.content,
                })
                .collect(),
            temperature: opts.temperature.unwrap_or(self.default_temperature),
            max_tokens: opts.max_tokens.unwrap_or(self.default_max_tokens),
        };

        let url = format!("{}/v1/chat/completions", self.base_url);
        let mut http = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            http = http.bearer_auth(key);
        }

        let response = http.send().await.context("LLM request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM backend {} returned {status}: {body}", self.name);
        }

        let parsed: ChatResponse = response.json().await.context("invalid LLM response")?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.is_empty())
            .with_context(|| format!("LLM backend {} returned no content", self.name))
    }
}

// ── Native Ollama backend ─────────────────────────────────────────

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f64,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    message: ResponseMessage,
}

/// Chat backend speaking Ollama's native `/api/chat` endpoint, for local
/// servers that do not expose the OpenAI compatibility layer.
pub struct OllamaBackend {
    name: String,
    client: Client,
    base_url: String,
    default_model: String,
    default_temperature: f64,
    default_max_tokens: u32,
}

impl OllamaBackend {
    pub fn new(name: &str, backend: &BackendConfig, llm: &LlmConfig) -> Self {
        Self {
            name: name.to_string(),
            client: Client::new(),
            base_url: backend.host.trim_end_matches('/').to_string(),
            default_model: backend.model.clone(),
            default_temperature: llm.temperature,
            default_max_tokens: llm.max_tokens,
        }
    }
}

#[async_trait]
impl ChatBackend for OllamaBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, messages: &[ChatMessage], opts: &CallOptions) -> anyhow::Result<String> {
        let model = opts.model.as_deref().unwrap_or(&self.default_model);
        let request = OllamaRequest {
            model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: &m.role,
                    content: &m.content,
                })
                .collect(),
            stream: false,
            options: OllamaOptions {
                temperature: opts.temperature.unwrap_or(self.default_temperature),
                num_predict: opts.max_tokens.unwrap_or(self.default_max_tokens),
            },
        };

        let url = format!("{}/api/chat", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("LLM request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM backend {} returned {status}: {body}", self.name);
        }

        let parsed: OllamaResponse = response.json().await.context("invalid LLM response")?;
        parsed
            .message
            .content
            .filter(|c| !c.is_empty())
            .with_context(|| format!("LLM backend {} returned no content", self.name))
    }
}

fn build_backend(name: &str, backend: &BackendConfig, llm: &LlmConfig) -> Box<dyn ChatBackend> {
    match backend.kind {
        BackendKind::OpenAi => Box::new(HttpBackend::new(name, backend, llm)),
        BackendKind::Ollama => Box::new(OllamaBackend::new(name, backend, llm)),
    }
}

// ── Orchestrator with primary → fallback failover ─────────────────

/// Routes chat calls to a primary backend, falling back to the secondary on
/// any failure. Owns the prompt library.
pub struct ChatOrchestrator {
    primary: Box<dyn ChatBackend>,
    fallback: Option<Box<dyn ChatBackend>>,
    prompts: PromptLibrary,
}

impl ChatOrchestrator {
    pub fn new(
        primary: Box<dyn ChatBackend>,
        fallback: Option<Box<dyn ChatBackend>>,
        prompts: PromptLibrary,
    ) -> Self {
        Self {
            primary,
            fallback,
            prompts,
        }
    }

    /// Build from config; `None` when the LLM integration is disabled or no
    /// backend is configured.
    pub fn from_config(llm: &LlmConfig) -> anyhow::Result<Option<Self>> {
        if !llm.enabled {
            return Ok(None);
        }
        let Some(primary_cfg) = &llm.primary else {
            warn!("llm.enabled is set but no [llm.primary] backend is configured");
            return Ok(None);
        };
        let primary = build_backend("primary", primary_cfg, llm);
        let fallback = llm
            .fallback
            .as_ref()
            .map(|cfg| build_backend("fallback", cfg, llm));
        let prompts = PromptLibrary::load(&llm.prompts_dir)?;
        Ok(Some(Self::new(primary, fallback, prompts)))
    }

    async fn chat_with_failover(
        &self,
        messages: &[ChatMessage],
        opts: &CallOptions,
    ) -> anyhow::Result<String> {
        match self.primary.chat(messages, opts).await {
            Ok(text) => Ok(text),
            Err(primary_err) => match &self.fallback {
                Some(fallback) => {
                    warn!(
                        backend = %self.primary.name(),
                        error = %primary_err,
                        "primary LLM backend failed, trying fallback"
                    );
                    fallback.chat(messages, opts).await
                }
                None => Err(primary_err),
            },
        }
    }

    pub async fn send_message(
        &self,
        system_prompt: Option<&str>,
        user_message: &str,
        opts: &CallOptions,
    ) -> anyhow::Result<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = system_prompt {
            messages.push(ChatMessage::new("system", system));
        }
        messages.push(ChatMessage::new("user", user_message));
        self.chat_with_failover(&messages, opts).await
    }

    /// Render a named prompt with the given input bindings and send it.
    /// Bindings are validated against the template's declared placeholders
    /// before any text is substituted.
    pub async fn send_prompt(
        &self,
        prompt_name: &str,
        inputs: &HashMap<String, String>,
        opts: &CallOptions,
    ) -> anyhow::Result<String> {
        let messages = self.prompts.render(prompt_name, inputs)?;
        debug!(prompt = %prompt_name, "sending rendered prompt");
        self.chat_with_failover(&messages, opts).await
    }

    pub fn has_prompt(&self, name: &str) -> bool {
        self.prompts.contains(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct ScriptedBackend {
        name: &'static str,
        fail: bool,
        calls: Mutex<Vec<CallOptions>>,
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        fn name(&self) -> &str {
            self.name
        }

        async fn chat(
            &self,
            _messages: &[ChatMessage],
            opts: &CallOptions,
        ) -> anyhow::Result<String> {
            self.calls.lock().push(opts.clone());
            if self.fail {
                anyhow::bail!("{} is down", self.name)
            }
            Ok(format!("{} says hi", self.name))
        }
    }

    fn backend(name: &'static str, fail: bool) -> Box<ScriptedBackend> {
        Box::new(ScriptedBackend {
            name,
            fail,
            calls: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn primary_failure_falls_back() {
        let orchestrator = ChatOrchestrator::new(
            backend("primary", true),
            Some(backend("fallback", false)),
            PromptLibrary::empty(),
        );
        let out = orchestrator
            .send_message(None, "hello", &CallOptions::default())
            .await
            .unwrap();
        assert_eq!(out, "fallback says hi");
    }

    #[tokio::test]
    async fn primary_success_skips_fallback() {
        let orchestrator = ChatOrchestrator::new(
            backend("primary", false),
            Some(backend("fallback", false)),
            PromptLibrary::empty(),
        );
        let out = orchestrator
            .send_message(Some("be brief"), "hello", &CallOptions::default())
            .await
            .unwrap();
        assert_eq!(out, "primary says hi");
    }

    #[tokio::test]
    async fn no_fallback_propagates_error() {
        let orchestrator =
            ChatOrchestrator::new(backend("primary", true), None, PromptLibrary::empty());
        assert!(orchestrator
            .send_message(None, "hello", &CallOptions::default())
            .await
            .is_err());
    }
}
