use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Reasoning effort requested for a call. Batch items start at `Low` and
/// escalate to `High` on retry; recipe drafting and refinement always run at
/// `High`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effort {
    #[default]
    Low,
    Medium,
    High,
}

impl Effort {
    pub fn as_str(self) -> &'static str {
        match self {
            Effort::Low => "low",
            Effort::Medium => "medium",
            Effort::High => "high",
        }
    }

    pub fn escalated(self) -> Self {
        Effort::High
    }
}

#[derive(Debug, Clone, Error)]
pub enum LlmError {
    /// Worth retrying: network failures, 5xx, plain rate limiting.
    #[error("transient gateway failure: {0}")]
    Transient(String),
    /// Not worth retrying: auth errors, quota exhaustion, malformed output.
    #[error("permanent gateway failure: {0}")]
    Permanent(String),
}

/// The single seam to the language model gateway. Everything above this trait
/// is deterministic and testable without a network.
#[async_trait]
pub trait LlmService: Send + Sync {
    /// Free-form text generation (recipe drafting, refinement).
    async fn generate_text(&self, prompt: &str, effort: Effort) -> Result<String, LlmError>;

    /// JSON generation constrained by `schema` (listings, judge verdicts).
    async fn generate_structured(
        &self,
        prompt: &str,
        schema: &Value,
        effort: Effort,
    ) -> Result<Value, LlmError>;

    /// Script generation (extraction and validation code).
    async fn generate_code(&self, prompt: &str, effort: Effort) -> Result<String, LlmError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub function_name: String,
    pub max_retries: u32,
    pub initial_backoff: Duration,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, LlmError> {
        let base_url = std::env::var("LLM_GATEWAY_URL")
            .map_err(|_| LlmError::Permanent("LLM_GATEWAY_URL is not set".to_string()))?;
        let function_name =
            std::env::var("LLM_FUNCTION_NAME").unwrap_or_else(|_| "listwright".to_string());
        let max_retries = std::env::var("LLM_MAX_RETRIES")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(3);
        let backoff_ms = std::env::var("LLM_INITIAL_BACKOFF_MS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(2_000);
        Ok(Self {
            base_url,
            api_key: std::env::var("LLM_GATEWAY_API_KEY").ok(),
            function_name,
            max_retries,
            initial_backoff: Duration::from_millis(backoff_ms),
        })
    }
}

/// HTTP client for an OpenAI-compatible inference gateway, with exponential
/// backoff on transient failures. Quota exhaustion is treated as permanent so
/// a batch run fails fast instead of hammering a dead key.
pub struct GatewayClient {
    http: reqwest::Client,
    config: GatewayConfig,
}

#[derive(Serialize)]
struct InferenceRequest<'a> {
    function_name: &'a str,
    input: InferenceInput<'a>,
    effort: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    output_schema: Option<&'a Value>,
}

#[derive(Serialize)]
struct InferenceInput<'a> {
    messages: Vec<InferenceMessage<'a>>,
}

#[derive(Serialize)]
struct InferenceMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct InferenceResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

impl GatewayClient {
    pub fn new(config: GatewayConfig) -> Result<Self, LlmError> {
        let timeout_secs = std::env::var("HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(120);
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| LlmError::Permanent(format!("http client: {err}")))?;
        Ok(Self { http, config })
    }

    pub fn from_env() -> Result<Self, LlmError> {
        Self::new(GatewayConfig::from_env()?)
    }

    async fn infer(
        &self,
        prompt: &str,
        effort: Effort,
        output_schema: Option<&Value>,
    ) -> Result<String, LlmError> {
        let url = format!("{}/inference", self.config.base_url.trim_end_matches('/'));
        let body = InferenceRequest {
            function_name: &self.config.function_name,
            input: InferenceInput {
                messages: vec![InferenceMessage {
                    role: "user",
                    content: prompt,
                }],
            },
            effort: effort.as_str(),
            output_schema,
        };

        let mut last_error = LlmError::Transient("no attempts made".to_string());
        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let backoff = self.config.initial_backoff * 2u32.saturating_pow(attempt - 1);
                tracing::warn!(
                    target = "listwright.llm",
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %last_error,
                    "retrying gateway call"
                );
                tokio::time::sleep(backoff).await;
            }
            match self.attempt(&url, &body).await {
                Ok(text) => return Ok(text),
                Err(err @ LlmError::Permanent(_)) => return Err(err),
                Err(err) => last_error = err,
            }
        }
        Err(last_error)
    }

    async fn attempt(
        &self,
        url: &str,
        body: &InferenceRequest<'_>,
    ) -> Result<String, LlmError> {
        let mut request = self.http.post(url).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.header("X-API-Key", key);
        }
        let response = request
            .send()
            .await
            .map_err(|err| LlmError::Transient(format!("gateway request failed: {err}")))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|err| LlmError::Transient(format!("gateway body read failed: {err}")))?;

        if !status.is_success() {
            return Err(classify_http_failure(status.as_u16(), &text));
        }

        let parsed: InferenceResponse = serde_json::from_str(&text)
            .map_err(|err| LlmError::Permanent(format!("unexpected gateway response: {err}")))?;
        let combined: String = parsed
            .content
            .into_iter()
            .map(|block| block.text)
            .collect();
        if combined.trim().is_empty() {
            return Err(LlmError::Permanent("gateway returned no text".to_string()));
        }
        Ok(combined)
    }
}

fn classify_http_failure(status: u16, body: &str) -> LlmError {
    let lower = body.to_lowercase();
    let quota_exhausted = lower.contains("quota") || lower.contains("billing");
    match status {
        429 if quota_exhausted => {
            LlmError::Permanent(format!("quota exhausted ({status}): {body}"))
        }
        429 | 500..=599 => LlmError::Transient(format!("gateway returned {status}")),
        _ => LlmError::Permanent(format!("gateway returned {status}: {body}")),
    }
}

#[async_trait]
impl LlmService for GatewayClient {
    async fn generate_text(&self, prompt: &str, effort: Effort) -> Result<String, LlmError> {
        self.infer(prompt, effort, None).await
    }

    async fn generate_structured(
        &self,
        prompt: &str,
        schema: &Value,
        effort: Effort,
    ) -> Result<Value, LlmError> {
        let text = self.infer(prompt, effort, Some(schema)).await?;
        parse_structured(&text)
    }

    async fn generate_code(&self, prompt: &str, effort: Effort) -> Result<String, LlmError> {
        self.infer(prompt, effort, None).await
    }
}

/// Gateways occasionally wrap schema-constrained output in markdown fences;
/// strip them before giving up.
fn parse_structured(text: &str) -> Result<Value, LlmError> {
    let stripped = crate::recipe::strip_code_fences(text);
    serde_json::from_str(stripped.trim())
        .map_err(|err| LlmError::Permanent(format!("gateway output is not valid JSON: {err}")))
}

#[cfg(test)]
pub mod testing {
    //! Programmable in-process stand-in for the gateway. Tests hand it
    //! closures per call kind; it tracks total and concurrent calls.

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    type TextFn = dyn Fn(&str, Effort) -> Result<String, LlmError> + Send + Sync;
    type StructuredFn = dyn Fn(&str, &Value, Effort) -> Result<Value, LlmError> + Send + Sync;

    pub struct FakeLlm {
        pub delay: Duration,
        pub calls: AtomicUsize,
        in_flight: AtomicUsize,
        pub max_in_flight: AtomicUsize,
        text: Box<TextFn>,
        structured: Box<StructuredFn>,
        code: Box<TextFn>,
    }

    impl FakeLlm {
        pub fn new() -> Self {
            Self {
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                text: Box::new(|_, _| Ok("ok".to_string())),
                structured: Box::new(|_, _, _| Ok(json!({}))),
                code: Box::new(|_, _| Ok(String::new())),
            }
        }

        pub fn with_text(
            mut self,
            f: impl Fn(&str, Effort) -> Result<String, LlmError> + Send + Sync + 'static,
        ) -> Self {
            self.text = Box::new(f);
            self
        }

        pub fn with_structured(
            mut self,
            f: impl Fn(&str, &Value, Effort) -> Result<Value, LlmError> + Send + Sync + 'static,
        ) -> Self {
            self.structured = Box::new(f);
            self
        }

        pub fn with_code(
            mut self,
            f: impl Fn(&str, Effort) -> Result<String, LlmError> + Send + Sync + 'static,
        ) -> Self {
            self.code = Box::new(f);
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn into_service(self) -> Arc<dyn LlmService> {
            Arc::new(self)
        }

        async fn enter(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }

        fn leave(&self) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl LlmService for FakeLlm {
        async fn generate_text(&self, prompt: &str, effort: Effort) -> Result<String, LlmError> {
            self.enter().await;
            let out = (self.text)(prompt, effort);
            self.leave();
            out
        }

        async fn generate_structured(
            &self,
            prompt: &str,
            schema: &Value,
            effort: Effort,
        ) -> Result<Value, LlmError> {
            self.enter().await;
            let out = (self.structured)(prompt, schema, effort);
            self.leave();
            out
        }

        async fn generate_code(&self, prompt: &str, effort: Effort) -> Result<String, LlmError> {
            self.enter().await;
            let out = (self.code)(prompt, effort);
            self.leave();
            out
        }
    }
}
