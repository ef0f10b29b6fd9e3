//! Provider gateway for scoring backends.
//!
//! The gateway makes exactly one provider call per `chat` and records it in the
//! usage sink. Retry policy lives with the sampling orchestrator, which knows
//! how many attempts a sample has left.

pub mod error;
pub mod openrouter;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use openrouter::{ChatProvider, OpenRouterAdapter};

pub use error::{ErrorContext, ProviderError};
pub use types::{Attribution, ChatRequest, ChatResponse, FinishReason, Message, Role};
pub use usage::{NoopUsageSink, RunUsage, UsageLedger, UsageRecord, UsageSink};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

pub struct ProviderGateway<U: UsageSink> {
    provider: Box<dyn ChatProvider>,
    usage: Arc<U>,
}

impl<U: UsageSink> ProviderGateway<U> {
    pub fn new(provider: impl ChatProvider + 'static, usage: Arc<U>) -> Self {
        Self {
            provider: Box::new(provider),
            usage,
        }
    }

    /// OpenRouter configured from `OPENROUTER_*` environment variables.
    pub fn from_env(usage: Arc<U>) -> Result<Self, ProviderError> {
        Ok(Self::new(OpenRouterAdapter::from_env()?, usage))
    }
}

#[async_trait::async_trait]
impl<U: UsageSink> ChatGateway for ProviderGateway<U> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let started = Instant::now();
        let result = self.provider.chat(&req).await;
        let record = match &result {
            Ok(resp) => UsageRecord::success(self.provider.name(), &req, resp),
            Err(err) => {
                debug!(
                    model = %req.model,
                    backend_id = req.attribution.backend_id.as_deref().unwrap_or("-"),
                    code = err.code(),
                    error = %err,
                    "provider call failed"
                );
                UsageRecord::failure(self.provider.name(), &req, err, started.elapsed())
            }
        };
        self.usage.record(record).await;
        result
    }
}
