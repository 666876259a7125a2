//! LLM request execution
//!
//! The pipeline talks to language models only through `RequestExecutor`:
//! one prompt in, one text out, with the executor owning its own rate
//! limiting and bounded retry. Callers must still treat a returned error as
//! a normal outcome.

pub mod client;
pub mod parse;

pub use client::HttpRequestExecutor;
pub use parse::{decode, extract_json_object, Structured};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Supported OpenAI-compatible providers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Groq,
    Gemini,
    OpenAI,
    OpenRouter,
}

impl LlmProvider {
    /// Chat-completions endpoint for this provider
    pub fn endpoint(&self) -> &'static str {
        match self {
            LlmProvider::Groq => "https://api.groq.com/openai/v1/chat/completions",
            LlmProvider::Gemini => {
                "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions"
            }
            LlmProvider::OpenAI => "https://api.openai.com/v1/chat/completions",
            LlmProvider::OpenRouter => "https://openrouter.ai/api/v1/chat/completions",
        }
    }

    /// Default model for this provider
    pub fn default_model(&self) -> &'static str {
        match self {
            LlmProvider::Groq => "llama-3.3-70b-versatile",
            LlmProvider::Gemini => "gemini-2.0-flash",
            LlmProvider::OpenAI => "gpt-4o-mini",
            LlmProvider::OpenRouter => "anthropic/claude-3.5-sonnet",
        }
    }

    /// Environment variable holding the API key
    pub fn api_key_env(&self) -> &'static str {
        match self {
            LlmProvider::Groq => "GROQ_API_KEY",
            LlmProvider::Gemini => "GEMINI_API_KEY",
            LlmProvider::OpenAI => "OPENAI_API_KEY",
            LlmProvider::OpenRouter => "OPENROUTER_API_KEY",
        }
    }

    /// Parse provider from string
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "groq" => Some(LlmProvider::Groq),
            "gemini" | "google" => Some(LlmProvider::Gemini),
            "openai" | "oa" => Some(LlmProvider::OpenAI),
            "openrouter" | "or" => Some(LlmProvider::OpenRouter),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LlmProvider::Groq => "groq",
            LlmProvider::Gemini => "gemini",
            LlmProvider::OpenAI => "openai",
            LlmProvider::OpenRouter => "openrouter",
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out")]
    Timeout,
    #[error("LLM API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Request queue closed")]
    Closed,
}

impl ExecutorError {
    /// Rate limits, network failures and upstream 5xx are worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            ExecutorError::RateLimited { .. } | ExecutorError::Network(_) | ExecutorError::Timeout => true,
            ExecutorError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// One prompt for the executor
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmRequest {
    pub prompt: String,
    pub system: Option<String>,
    /// Model id to use instead of the configured one
    pub model_hint: Option<String>,
    /// Provider to route to instead of the default one
    pub provider: Option<LlmProvider>,
    /// Ask the provider for a JSON object response
    pub json_output: bool,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model_hint = Some(model.into());
        self
    }

    pub fn with_provider(mut self, provider: LlmProvider) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn expect_json(mut self) -> Self {
        self.json_output = true;
        self
    }
}

/// `(prompt, model hint) -> text`, shared by every pipeline call site
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(&self, request: LlmRequest) -> Result<String, ExecutorError>;
}
