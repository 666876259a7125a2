//! HTTP request executor for OpenAI-compatible chat-completion APIs
//!
//! Each provider gets its own request queue. A dispatcher task drains the
//! queue, spacing upstream requests by `min_request_spacing_ms` and keeping
//! at most `max_in_flight` requests open. Rate-limited and transient
//! failures are retried inside the executor; everything else is returned to
//! the caller immediately.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ExecutorError, LlmProvider, LlmRequest, RequestExecutor};
use crate::config::LlmConfig;
use crate::retry::RetryPolicy;

/// Cap for executor backoff (5 minutes)
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Base executor backoff
const BASE_BACKOFF: Duration = Duration::from_secs(1);

/// Random extra delay per retry
const MAX_JITTER: Duration = Duration::from_secs(1);

static TRY_AGAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)try again in\s+(?:(\d+)m)?(\d+(?:\.\d+)?)(ms|s)")
        .expect("valid retry hint regex")
});

/// Delay hinted by an upstream message such as "Please try again in 7.5s"
pub fn parse_retry_after(message: &str) -> Option<Duration> {
    let caps = TRY_AGAIN.captures(message)?;
    let minutes: f64 = caps
        .get(1)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0.0);
    let value: f64 = caps.get(2)?.as_str().parse().ok()?;
    let secs = match caps.get(3)?.as_str().to_lowercase().as_str() {
        "ms" => value / 1000.0,
        _ => value,
    };
    Some(Duration::from_secs_f64(minutes * 60.0 + secs))
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<ErrorDetail>,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

fn classify_error(status: u16, body: &str, retry_after: Option<Duration>) -> ExecutorError {
    let detail = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.error)
        .unwrap_or_default();
    let message = detail.message.unwrap_or_else(|| body.chars().take(500).collect());
    let code = detail
        .code
        .map(|c| c.as_str().map(str::to_string).unwrap_or_else(|| c.to_string()))
        .unwrap_or_default();

    let rate_limited = status == 429
        || code == "rate_limit_exceeded"
        || message.to_lowercase().contains("rate limit");

    if rate_limited {
        ExecutorError::RateLimited {
            retry_after: retry_after.or_else(|| parse_retry_after(&message)),
            message,
        }
    } else {
        ExecutorError::Api { status, message }
    }
}

fn classify_transport(e: reqwest::Error) -> ExecutorError {
    if e.is_timeout() {
        ExecutorError::Timeout
    } else {
        ExecutorError::Network(e.to_string())
    }
}

/// Key preview for logs: first and last 4 characters
fn key_preview(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() > 8 {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        "****".to_string()
    }
}

struct QueuedRequest {
    request: LlmRequest,
    reply: oneshot::Sender<Result<String, ExecutorError>>,
}

/// Upstream connection for one provider
struct ProviderClient {
    http: Client,
    provider: LlmProvider,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f64,
    max_retries: u32,
    retry: RetryPolicy,
}

impl ProviderClient {
    async fn send_once(&self, request: &LlmRequest) -> Result<String, ExecutorError> {
        let mut messages = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.push(json!({"role": "user", "content": request.prompt}));

        let model = request.model_hint.as_deref().unwrap_or(&self.model);
        let mut body = json!({
            "model": model,
            "messages": messages,
            "temperature": self.temperature,
        });
        if request.json_output {
            body["response_format"] = json!({"type": "json_object"});
        }

        let response = self
            .http
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<f64>().ok())
                .map(Duration::from_secs_f64);
            let text = response.text().await.unwrap_or_default();
            return Err(classify_error(status.as_u16(), &text, retry_after));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ExecutorError::InvalidResponse(e.to_string()))?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| ExecutorError::InvalidResponse("empty completion".to_string()))
    }

    async fn send_with_retry(&self, request: &LlmRequest) -> Result<String, ExecutorError> {
        let mut attempt = 1;
        loop {
            match self.send_once(request).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() && attempt <= self.max_retries => {
                    let delay = match &e {
                        ExecutorError::RateLimited {
                            retry_after: Some(hint),
                            ..
                        } => *hint,
                        _ => self.retry.jittered_delay(attempt),
                    };
                    warn!(
                        "{} request failed (attempt {}/{}): {}. Retrying in {:?}",
                        self.provider.as_str(),
                        attempt,
                        self.max_retries + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

async fn dispatch(
    mut rx: mpsc::UnboundedReceiver<QueuedRequest>,
    client: Arc<ProviderClient>,
    spacing: Duration,
    max_in_flight: usize,
) {
    let permits = Arc::new(Semaphore::new(max_in_flight));
    let mut last_sent: Option<Instant> = None;

    while let Some(queued) = rx.recv().await {
        if let Some(last) = last_sent {
            tokio::time::sleep_until(last + spacing).await;
        }
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        last_sent = Some(Instant::now());

        let client = client.clone();
        tokio::spawn(async move {
            let result = client.send_with_retry(&queued.request).await;
            // Caller may have given up; nothing to do then
            let _ = queued.reply.send(result);
            drop(permit);
        });
    }
    debug!("{} request queue closed", client.provider.as_str());
}

/// `RequestExecutor` over one queue per configured provider.
///
/// Must be constructed inside a tokio runtime (dispatchers are spawned).
pub struct HttpRequestExecutor {
    default_provider: LlmProvider,
    queues: HashMap<LlmProvider, mpsc::UnboundedSender<QueuedRequest>>,
}

impl HttpRequestExecutor {
    pub fn new(config: &LlmConfig) -> Result<Self, ExecutorError> {
        let mut executor = Self {
            default_provider: config.provider,
            queues: HashMap::new(),
        };
        executor.add_provider(config)?;
        Ok(executor)
    }

    /// Register another provider (replaces an existing queue for it)
    pub fn add_provider(&mut self, config: &LlmConfig) -> Result<(), ExecutorError> {
        let api_key = config.api_key.clone().filter(|k| !k.is_empty()).ok_or_else(|| {
            ExecutorError::Config(format!(
                "missing API key for {} (set {})",
                config.provider.as_str(),
                config.provider.api_key_env()
            ))
        })?;

        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ExecutorError::Config(e.to_string()))?;

        info!(
            "LLM executor: provider={}, model={}, spacing={}ms, in_flight={}, api_key={}",
            config.provider.as_str(),
            config.model(),
            config.min_request_spacing_ms,
            config.max_in_flight,
            key_preview(&api_key)
        );

        let client = Arc::new(ProviderClient {
            http,
            provider: config.provider,
            endpoint: config.endpoint(),
            api_key,
            model: config.model(),
            temperature: config.temperature,
            max_retries: config.max_retries,
            retry: RetryPolicy::exponential(config.max_retries + 1, BASE_BACKOFF, MAX_BACKOFF)
                .with_jitter(MAX_JITTER),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(dispatch(
            rx,
            client,
            Duration::from_millis(config.min_request_spacing_ms),
            config.max_in_flight.max(1),
        ));
        self.queues.insert(config.provider, tx);
        Ok(())
    }
}

#[async_trait]
impl RequestExecutor for HttpRequestExecutor {
    async fn execute(&self, request: LlmRequest) -> Result<String, ExecutorError> {
        let provider = request.provider.unwrap_or(self.default_provider);
        let queue = self.queues.get(&provider).ok_or_else(|| {
            ExecutorError::Config(format!("provider {} is not configured", provider.as_str()))
        })?;

        let (reply, rx) = oneshot::channel();
        queue
            .send(QueuedRequest { request, reply })
            .map_err(|_| ExecutorError::Closed)?;
        rx.await.map_err(|_| ExecutorError::Closed)?
    }
}
