//! OpenRouter transport for scoring backends.
//!
//! Speaks the OpenAI-compatible `/chat/completions` protocol, so any compatible
//! endpoint can stand in through [`OpenRouterSettings::base_url`]. The adapter
//! owns the mapping from HTTP exchanges onto [`ProviderError`]: 429 and 5xx
//! are transient, other non-success statuses are the caller's fault, and a
//! reply that declines the task is a refusal rather than text to parse.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error::{ErrorContext, ProviderError};
use super::types::{ChatRequest, ChatResponse, FinishReason, Message};

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

const MAX_REPLY_BYTES: usize = 1 << 20;
const MAX_INPUT_CHARS: usize = 500_000;
/// Used when a 429 carries no parseable `retry-after`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

#[async_trait]
pub trait ChatProvider: Send + Sync {
    /// Provider name for usage records.
    fn name(&self) -> &'static str;

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct OpenRouterSettings {
    pub api_key: String,
    pub base_url: String,
    /// Transport backstop. Per-sample deadlines are enforced by the sampler.
    pub request_timeout: Duration,
    pub referer: Option<String>,
    pub app_title: Option<String>,
}

impl OpenRouterSettings {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(120),
            referer: None,
            app_title: None,
        }
    }

    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// `OPENROUTER_API_KEY` is required. `OPENROUTER_BASE_URL`,
    /// `OPENROUTER_TIMEOUT_SECONDS`, `OPENROUTER_REFERER` and
    /// `OPENROUTER_APP_TITLE` are optional.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ProviderError::Config("OPENROUTER_API_KEY not set".into()))?;
        let mut settings = Self::new(api_key);
        if let Ok(url) = std::env::var("OPENROUTER_BASE_URL") {
            settings.base_url = url;
        }
        if let Some(secs) = std::env::var("OPENROUTER_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.trim().parse().ok())
        {
            settings.request_timeout = Duration::from_secs(secs);
        }
        settings.referer = std::env::var("OPENROUTER_REFERER").ok();
        settings.app_title = std::env::var("OPENROUTER_APP_TITLE").ok();
        Ok(settings)
    }
}

#[derive(Debug, Clone)]
pub struct OpenRouterAdapter {
    client: reqwest::Client,
    endpoint: String,
}

impl OpenRouterAdapter {
    pub fn new(settings: OpenRouterSettings) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", settings.api_key))
            .map_err(|_| ProviderError::Config("API key is not a valid header value".into()))?;
        headers.insert(AUTHORIZATION, bearer);
        for (name, value) in [
            ("HTTP-Referer", &settings.referer),
            ("X-Title", &settings.app_title),
        ] {
            if let Some(value) = value.as_deref().and_then(|v| HeaderValue::from_str(v).ok()) {
                headers.insert(name, value);
            }
        }

        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::Config(format!("http client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!(
                "{}/chat/completions",
                settings.base_url.trim_end_matches('/')
            ),
        })
    }

    pub fn from_env() -> Result<Self, ProviderError> {
        Self::new(OpenRouterSettings::from_env()?)
    }
}

#[async_trait]
impl ChatProvider for OpenRouterAdapter {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let chars = req.input_chars();
        if chars > MAX_INPUT_CHARS {
            return Err(ProviderError::TooLarge {
                chars,
                max: MAX_INPUT_CHARS,
            });
        }

        let started = Instant::now();
        let body = WireRequest {
            model: &req.model,
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            response_format: req
                .json_mode
                .then(|| serde_json::json!({ "type": "json_object" })),
        };
        let response = self.client.post(&self.endpoint).json(&body).send().await?;

        let status = response.status().as_u16();
        let request_id = header(response.headers(), "x-request-id");
        let retry_after = header(response.headers(), "retry-after")
            .and_then(|s| s.trim().parse().ok())
            .map(Duration::from_secs);
        let raw = read_capped(response).await?;

        if !(200..300).contains(&status) {
            return Err(classify_failure(status, &raw, request_id, retry_after));
        }

        let reply: WireReply =
            serde_json::from_slice(&raw).map_err(|e| ProviderError::Malformed(e.to_string()))?;
        if let Some(error) = reply.error {
            let (message, provider_code) = error.into_parts();
            if looks_like_refusal(&message) {
                return Err(ProviderError::Refused(message));
            }
            return Err(ProviderError::Unavailable {
                status,
                message,
                context: ErrorContext {
                    provider_code,
                    request_id,
                },
            });
        }

        let choice = reply
            .choices
            .unwrap_or_default()
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Malformed("reply has no choices".into()))?;
        let finish_reason = FinishReason::from_wire(choice.finish_reason.as_deref());
        if finish_reason == FinishReason::ContentFilter {
            return Err(ProviderError::Refused(
                "reply withheld by content filter".into(),
            ));
        }
        let content = choice.message.map(WireMessage::into_text).unwrap_or_default();
        if looks_like_refusal(&content) {
            return Err(ProviderError::Refused(content));
        }

        let (input_tokens, output_tokens) = reply.usage.map_or((0, 0), |u| {
            (
                u.prompt_tokens.unwrap_or(0),
                u.completion_tokens.unwrap_or(0),
            )
        });

        Ok(ChatResponse {
            content,
            input_tokens,
            output_tokens,
            latency: started.elapsed(),
            finish_reason,
            request_id,
        })
    }
}

/// Map a non-success exchange onto a transport failure.
fn classify_failure(
    status: u16,
    body: &[u8],
    request_id: Option<String>,
    retry_after: Option<Duration>,
) -> ProviderError {
    let (message, provider_code) = match serde_json::from_slice::<WireReply>(body)
        .ok()
        .and_then(|r| r.error)
    {
        Some(error) => error.into_parts(),
        None => (
            String::from_utf8_lossy(body).chars().take(200).collect(),
            None,
        ),
    };
    let context = ErrorContext {
        provider_code,
        request_id,
    };
    match status {
        429 => ProviderError::RateLimited {
            retry_after: retry_after.unwrap_or(DEFAULT_RETRY_AFTER),
            context,
        },
        500..=599 => ProviderError::Unavailable {
            status,
            message,
            context,
        },
        _ => ProviderError::Rejected {
            status,
            message,
            context,
        },
    }
}

const REFUSAL_OPENERS: &[&str] = &[
    "i cannot",
    "i can't",
    "i won't",
    "i will not",
    "i am unable",
    "i'm unable",
    "unable to comply",
    "unable to assist",
    "sorry, i can",
    "refus",
];

/// A scoring reply opens with JSON or a fence; prose that opens by declining
/// is a refusal. Only the first line is inspected so rationales that happen
/// to say "I cannot find..." are not misread.
fn looks_like_refusal(text: &str) -> bool {
    let opener = text
        .trim_start()
        .lines()
        .next()
        .unwrap_or_default()
        .to_lowercase();
    REFUSAL_OPENERS.iter().any(|p| opener.starts_with(p))
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn read_capped(mut response: reqwest::Response) -> Result<Vec<u8>, ProviderError> {
    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await? {
        if body.len() + chunk.len() > MAX_REPLY_BYTES {
            return Err(ProviderError::Malformed(format!(
                "reply exceeds {MAX_REPLY_BYTES} bytes"
            )));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

// =============================================================================
// Wire format
// =============================================================================

#[derive(Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Deserialize)]
struct WireReply {
    choices: Option<Vec<WireChoice>>,
    usage: Option<WireUsage>,
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct WireChoice {
    message: Option<WireMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct WireMessage {
    content: Option<String>,
    tool_calls: Option<Vec<WireToolCall>>,
}

impl WireMessage {
    /// Some models answer a JSON-mode request through a tool call with empty
    /// content; the arguments then carry the score object.
    fn into_text(self) -> String {
        match self.content {
            Some(text) if !text.trim().is_empty() => text,
            _ => self
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .filter_map(|call| call.function?.arguments)
                .find(|args| !args.trim().is_empty())
                .unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct WireToolCall {
    function: Option<WireFunction>,
}

#[derive(Deserialize)]
struct WireFunction {
    arguments: Option<String>,
}

#[derive(Deserialize)]
struct WireUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct WireError {
    message: Option<String>,
    /// OpenRouter sends numeric codes, some compatible servers send strings.
    code: Option<Value>,
}

impl WireError {
    fn into_parts(self) -> (String, Option<String>) {
        let code = self.code.map(|c| match c {
            Value::String(s) => s,
            other => other.to_string(),
        });
        (self.message.unwrap_or_default(), code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusal_detection_reads_the_opening_line_only() {
        assert!(looks_like_refusal("I cannot grade this list."));
        assert!(looks_like_refusal("  Refusing: policy"));
        assert!(!looks_like_refusal(
            "{\"score\": 2, \"rationale\": \"I cannot find any recent papers\"}"
        ));
        assert!(!looks_like_refusal("I would say it is quite good overall."));
    }

    #[test]
    fn failures_are_classified_by_status() {
        let body = br#"{"error": {"message": "slow down", "code": 429}}"#;
        match classify_failure(429, body, Some("r1".into()), Some(Duration::from_secs(3))) {
            ProviderError::RateLimited {
                retry_after,
                context,
            } => {
                assert_eq!(retry_after, Duration::from_secs(3));
                assert_eq!(context.provider_code.as_deref(), Some("429"));
                assert_eq!(context.request_id.as_deref(), Some("r1"));
            }
            other => panic!("expected rate limit, got {other:?}"),
        }

        let err = classify_failure(502, b"bad gateway", None, None);
        assert!(err.is_retryable());
        assert!(err.to_string().contains("bad gateway"));

        let err = classify_failure(404, br#"{"error": {"message": "no such model"}}"#, None, None);
        assert!(matches!(err, ProviderError::Rejected { status: 404, .. }));
        assert!(!err.is_retryable());
    }

    #[test]
    fn tool_call_arguments_stand_in_for_empty_content() {
        let message: WireMessage = serde_json::from_value(serde_json::json!({
            "content": "  ",
            "tool_calls": [
                {"function": {"arguments": ""}},
                {"function": {"arguments": "{\"score\": 4}"}}
            ]
        }))
        .unwrap();
        assert_eq!(message.into_text(), "{\"score\": 4}");
    }
}
