use crate::env::EnvSource;
use crate::error::{Error, Result};
use crate::http::{HttpClient, HttpSettings};
use crate::resolver::ModelHandle;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

const USER_AGENT: &str = concat!("crew-llm/", env!("CARGO_PKG_VERSION"));

/// LLM provider — determines API format and endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Local Ollama server, spoken to through its OpenAI-compatible `/v1` API.
    #[default]
    Ollama,
    OpenRouter,
    Groq,
    /// Any OpenAI-compatible API (api.openai.com, together.ai, vLLM, ...)
    #[serde(rename = "openai")]
    OpenAi,
    Anthropic,
}

impl Provider {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::Ollama => "http://localhost:11434",
            Self::OpenRouter => "https://openrouter.ai/api/v1",
            Self::Groq => "https://api.groq.com/openai/v1",
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Anthropic => "https://api.anthropic.com/v1",
        }
    }

    /// Env var holding the API key, or `None` for providers that take no key.
    pub fn default_api_key_env(&self) -> Option<&'static str> {
        match self {
            Self::Ollama => None,
            Self::OpenRouter => Some("OPENROUTER_API_KEY"),
            Self::Groq => Some("GROQ_API_KEY"),
            Self::OpenAi => Some("OPENAI_API_KEY"),
            Self::Anthropic => Some("ANTHROPIC_API_KEY"),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ollama => "ollama",
            Self::OpenRouter => "openrouter",
            Self::Groq => "groq",
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
        }
    }

    /// Strip a `provider/` routing prefix some configs carry (`ollama/llama3.2`).
    pub fn normalize_model<'a>(&self, model: &'a str) -> &'a str {
        let model = model.trim();
        match self {
            Self::Ollama => model.strip_prefix("ollama/").unwrap_or(model),
            _ => model,
        }
    }

    fn chat_url(&self, base_url: &str) -> String {
        let base = base_url.trim_end_matches('/');
        match self {
            Self::Anthropic => format!("{base}/messages"),
            Self::Ollama if !base.ends_with("/v1") => format!("{base}/v1/chat/completions"),
            _ => format!("{base}/chat/completions"),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Everything needed to build an [`LlmClient`].
#[derive(Debug, Clone)]
pub struct ClientSpec {
    pub provider: Provider,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub max_tokens: u32,
    pub http: HttpSettings,
}

pub struct LlmClient {
    provider: Provider,
    api_key: Option<String>,
    model: String,
    max_tokens: u32,
    url: String,
    http: HttpClient,
}

// -- Anthropic format --

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Msg<'a>>,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicBlock>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    text: Option<String>,
}

// -- OpenAI-compatible format --

#[derive(Serialize)]
struct OpenAiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    stream: bool,
    messages: Vec<Msg<'a>>,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    #[serde(default)]
    content: Option<String>,
}

// -- Shared --

#[derive(Serialize)]
struct Msg<'a> {
    role: &'a str,
    content: &'a str,
}

impl LlmClient {
    pub fn new(
        provider: Provider,
        api_key: Option<String>,
        model: &str,
        max_tokens: u32,
        base_url: Option<&str>,
        http: HttpSettings,
    ) -> Result<Self> {
        let base_url = base_url.unwrap_or_else(|| provider.default_base_url());
        reqwest::Url::parse(base_url)
            .map_err(|e| Error::config(format!("invalid base_url {base_url:?}: {e}")))?;

        let model = provider.normalize_model(model);
        if model.is_empty() {
            return Err(Error::config(format!("{provider}: model name is empty")));
        }

        Ok(Self {
            provider,
            api_key,
            model: model.to_string(),
            max_tokens,
            url: provider.chat_url(base_url),
            http: HttpClient::new(USER_AGENT, http)?,
        })
    }

    /// Build from a [`ClientSpec`], reading the API key from the configured env var.
    pub fn from_spec(spec: &ClientSpec, env: &dyn EnvSource) -> Result<Self> {
        let key_var = spec
            .api_key_env
            .as_deref()
            .or_else(|| spec.provider.default_api_key_env());
        let api_key = match key_var {
            Some(var) => Some(env.get(var).ok_or_else(|| {
                Error::config(format!("{}: API key variable {var} is not set", spec.provider))
            })?),
            None => None,
        };
        Self::new(
            spec.provider,
            api_key,
            &spec.model,
            spec.max_tokens,
            spec.base_url.as_deref(),
            spec.http,
        )
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn complete_anthropic(&self, prompt: &str) -> Result<String> {
        let request = AnthropicRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: vec![Msg {
                role: "user",
                content: prompt,
            }],
        };

        let body = serde_json::to_string(&request)
            .map_err(|e| Error::parse(format!("serialize request: {e}")))?;

        let api_key = self.api_key.as_deref().unwrap_or_default();
        let response_text = self
            .http
            .post_json_raw(
                &self.url,
                &body,
                &[("x-api-key", api_key), ("anthropic-version", "2023-06-01")],
            )
            .await
            .map_err(|e| {
                warn!("Anthropic API error: {e}");
                e
            })?;

        let resp: AnthropicResponse = serde_json::from_str(&response_text)
            .map_err(|e| Error::parse(format!("parse Anthropic response: {e}")))?;

        Ok(resp
            .content
            .into_iter()
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("\n"))
    }

    async fn complete_openai(&self, prompt: &str) -> Result<String> {
        let request = OpenAiRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            stream: false,
            messages: vec![Msg {
                role: "user",
                content: prompt,
            }],
        };

        let body = serde_json::to_string(&request)
            .map_err(|e| Error::parse(format!("serialize request: {e}")))?;

        let bearer = self.api_key.as_ref().map(|key| format!("Bearer {key}"));
        let headers: Vec<(&str, &str)> = bearer
            .as_deref()
            .map(|value| vec![("Authorization", value)])
            .unwrap_or_default();

        let response_text = self
            .http
            .post_json_raw(&self.url, &body, &headers)
            .await
            .map_err(|e| {
                warn!(provider = %self.provider, "LLM API error: {e}");
                e
            })?;

        let resp: OpenAiResponse = serde_json::from_str(&response_text)
            .map_err(|e| Error::parse(format!("parse LLM response: {e}")))?;

        resp.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::parse("no choices in LLM response"))
    }
}

#[async_trait]
impl ModelHandle for LlmClient {
    async fn complete(&self, prompt: &str) -> Result<String> {
        debug!(provider = %self.provider, model = %self.model, "sending LLM request");

        match self.provider {
            Provider::Anthropic => self.complete_anthropic(prompt).await,
            Provider::Ollama | Provider::OpenRouter | Provider::Groq | Provider::OpenAi => {
                self.complete_openai(prompt).await
            }
        }
    }
}

impl fmt::Debug for LlmClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmClient")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("url", &self.url)
            .field("has_api_key", &self.api_key.is_some())
            .finish()
    }
}
