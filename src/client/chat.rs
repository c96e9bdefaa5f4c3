//! Chat-completion client for OpenAI-compatible endpoints.
//!
//! Epistemic foundation:
//! - K_i: The OpenAI chat completions schema is the wire format
//! - B_i: API will respond within timeout (might fail)
//! - B_i: Response will be valid JSON with at least one choice (might fail)
//! - I^B: Whether a failure is worth retrying is classified, not decided, here

use crate::models::{ApiError, ChatMessage, Conversation, CuratorError, OpenAiConfig, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Chat completion request payload.
#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
}

/// Chat completion response.
#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
    usage: Option<TokenUsage>,
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

/// API error response (OpenAI-compatible).
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Token usage reported by the endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Response from a completion request.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Text of the first choice
    pub content: String,
    /// Model used (may differ from requested)
    pub model: String,
    /// Usage block, when the endpoint sent one
    pub usage: Option<TokenUsage>,
    /// Request duration
    pub duration: Duration,
}

/// A remote chat-completion endpoint.
#[async_trait]
pub trait ChatClient: Send + Sync {
    /// Send one conversation and return the first completion.
    async fn complete(&self, model: &str, conversation: &Conversation) -> Result<Completion>;
}

#[async_trait]
impl<C: ChatClient + ?Sized> ChatClient for Arc<C> {
    async fn complete(&self, model: &str, conversation: &Conversation) -> Result<Completion> {
        (**self).complete(model, conversation).await
    }
}

/// HTTP client for an OpenAI-compatible chat completions endpoint.
///
/// Makes exactly one attempt per call. Retries come from
/// `Dispatcher::with_max_retries` or, outside a dispatcher,
/// [`RetryingClient`](crate::client::RetryingClient).
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
    timeout: Duration,
}

impl OpenAiClient {
    /// Create a new client.
    pub fn new(api_key: &str, base_url: Option<String>, timeout_secs: Option<u64>) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs.unwrap_or(180));

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(CuratorError::Network)?;

        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| CuratorError::InvalidInput("API key is not a valid header value".to_string()))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        Ok(Self {
            client,
            base_url: base_url
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
            headers,
            timeout,
        })
    }

    /// Create a client from the `[openai]` config section.
    pub fn from_config(config: &OpenAiConfig, api_key: &str) -> Result<Self> {
        Self::new(
            api_key,
            Some(config.base_url.clone()),
            Some(config.timeout_secs),
        )
    }

    fn classify_status(status: u16, headers: &HeaderMap, body: &str, model: &str) -> CuratorError {
        if status == 429 {
            let retry_after = headers
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<f64>().ok())
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .unwrap_or(1.0);
            return CuratorError::RateLimited {
                retry_after_secs: retry_after,
            };
        }

        let error = match status {
            401 | 403 => ApiError::AuthenticationFailed,
            404 => ApiError::ModelNotFound(model.to_string()),
            _ => {
                let message = serde_json::from_str::<ApiErrorResponse>(body)
                    .map(|e| e.error.message)
                    .unwrap_or_else(|_| body.to_string());
                ApiError::Status { status, message }
            }
        };
        CuratorError::Api(error)
    }
}

#[async_trait]
impl ChatClient for OpenAiClient {
    /// B_i(API available) → Result
    /// B_i(valid response) → Result
    async fn complete(&self, model: &str, conversation: &Conversation) -> Result<Completion> {
        let start = Instant::now();
        let request = ChatCompletionRequest {
            model,
            messages: &conversation.messages,
        };
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .headers(self.headers.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CuratorError::Timeout(self.timeout)
                } else {
                    CuratorError::Network(e)
                }
            })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            debug!(status = status, model = model, "Chat completion failed");
            return Err(Self::classify_status(status, &headers, &body, model));
        }

        let body: ChatCompletionResponse = response.json().await.map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to parse response: {e}"))
        })?;

        let content = body
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ApiError::InvalidResponse("No choices in response".to_string()))?
            .message
            .content
            .ok_or_else(|| ApiError::InvalidResponse("First choice has no text content".to_string()))?;

        Ok(Completion {
            content,
            model: body.model.unwrap_or_else(|| model.to_string()),
            usage: body.usage,
            duration: start.elapsed(),
        })
    }
}
