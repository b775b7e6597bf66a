use std::time::Duration;

use reqwest::Client;
use tokio::time::sleep;

use super::error::ProviderError;
use super::types::{Completion, Message, MessagesRequest, MessagesResponse};

const API_URL: &str = "https://api.anthropic.com/v1/messages";

/// Transport errors get at most this many attempts inside the client.
const MAX_TRANSPORT_ATTEMPTS: u32 = 3;

/// Seam for the raw provider call. The router and the stage runtime are
/// written against this trait so tests can swap in a mock provider.
pub trait CompletionClient: Send + Sync {
    fn complete(
        &self,
        model: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> impl Future<Output = Result<Completion, ProviderError>> + Send;
}

pub struct AnthropicClient {
    api_key: String,
    client: Client,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(api_key, API_URL.to_string())
    }

    /// Create a client pointing at a custom base URL (useful for testing).
    pub fn with_base_url(api_key: String, base_url: String) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .expect("failed to build HTTP client");
        Self {
            api_key,
            client,
            base_url,
        }
    }

    async fn send_message(&self, req: &MessagesRequest) -> Result<MessagesResponse, ProviderError> {
        let response = self
            .client
            .post(&self.base_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .json(req)
            .send()
            .await?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1000);
            return Err(ProviderError::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.json::<MessagesResponse>().await?;
        Ok(body)
    }

    /// Send with a bounded exponential backoff on transport errors
    /// (network failures, 5xx). Rate limits and client errors surface
    /// immediately so upstream policy can react to them.
    async fn send_with_retry(
        &self,
        req: &MessagesRequest,
    ) -> Result<MessagesResponse, ProviderError> {
        let mut attempt = 1;
        loop {
            match self.send_message(req).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_transport() && attempt < MAX_TRANSPORT_ATTEMPTS => {
                    sleep(transport_backoff(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl CompletionClient for AnthropicClient {
    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<Completion, ProviderError> {
        let req = MessagesRequest {
            model: model.to_string(),
            max_tokens,
            messages: vec![Message {
                role: "user".into(),
                content: prompt.to_string(),
            }],
        };

        let resp = self.send_with_retry(&req).await?;
        Ok(Completion {
            content: resp.text(),
            model: resp.model.clone(),
            usage: Some(resp.usage),
        })
    }
}

/// Backoff for transport retries: 2^attempt seconds clamped to [2s, 10s].
fn transport_backoff(attempt: u32) -> Duration {
    Duration::from_secs((1u64 << attempt).clamp(2, 10))
}
