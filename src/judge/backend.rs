//! Scoring backends: anything that turns a rendered request into reply text.

use std::sync::Arc;

use async_trait::async_trait;

use super::prompts::JudgeRequest;
use crate::config::BackendConfig;
use crate::gateway::{Attribution, ChatGateway, ChatRequest, ProviderError};

/// Hard cap on generation for a single score.
///
/// The reply contract is a tiny JSON object; the cap keeps cost and latency bounded.
pub const SCORE_MAX_OUTPUT_TOKENS_DEFAULT: u32 = 256;
pub const SCORE_MAX_OUTPUT_TOKENS_GPT5: u32 = 768;

pub fn score_max_output_tokens(model: &str) -> u32 {
    // GPT-5 family spends part of the budget on hidden reasoning before any
    // visible output.
    if model.starts_with("openai/gpt-5") {
        SCORE_MAX_OUTPUT_TOKENS_GPT5
    } else {
        SCORE_MAX_OUTPUT_TOKENS_DEFAULT
    }
}

/// One member of the judge panel. Returns raw reply text; parsing is the
/// client's job so every backend shares the same three-stage pipeline.
#[async_trait]
pub trait ScoringBackend: Send + Sync {
    async fn complete(
        &self,
        request: &JudgeRequest,
        temperature: f32,
    ) -> Result<String, ProviderError>;
}

/// A backend served through the chat gateway, model named by the backend identity.
pub struct GatewayBackend {
    gateway: Arc<dyn ChatGateway>,
    backend_id: String,
    model: String,
}

impl GatewayBackend {
    pub fn new(gateway: Arc<dyn ChatGateway>, config: &BackendConfig) -> Self {
        Self {
            gateway,
            backend_id: config.backend_id.clone(),
            model: config.identity.clone(),
        }
    }
}

#[async_trait]
impl ScoringBackend for GatewayBackend {
    async fn complete(
        &self,
        request: &JudgeRequest,
        temperature: f32,
    ) -> Result<String, ProviderError> {
        let attribution = Attribution::new("judge::gateway_backend")
            .with_run(request.run_id)
            .with_backend(&self.backend_id);
        let mut chat = ChatRequest::new(&self.model, request.to_messages(), attribution)
            .temperature(temperature)
            .max_tokens(score_max_output_tokens(&self.model));
        // Only OpenAI models reliably support response_format=json_object via OpenRouter.
        if self.model.starts_with("openai/") {
            chat = chat.json();
        }
        let response = self.gateway.chat(chat).await?;
        Ok(response.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::Scale;
    use crate::gateway::{ChatResponse, FinishReason};
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Default)]
    struct Recording(Mutex<Vec<ChatRequest>>);

    #[async_trait]
    impl ChatGateway for Recording {
        async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.0.lock().unwrap().push(req);
            Ok(ChatResponse {
                content: r#"{"score": 5}"#.into(),
                input_tokens: 1,
                output_tokens: 1,
                latency: Duration::ZERO,
                finish_reason: FinishReason::Stop,
                request_id: None,
            })
        }
    }

    #[tokio::test]
    async fn requests_carry_run_and_backend_attribution() {
        let gateway = Arc::new(Recording::default());
        let backend = GatewayBackend::new(
            gateway.clone(),
            &BackendConfig::new("gpt", "openai/gpt-5-mini", 1),
        );
        let run_id = Uuid::new_v4();
        let request = JudgeRequest {
            criterion_id: "relevance".into(),
            scale: Scale::new(0.0, 10.0),
            system: "judge".into(),
            user: "rate".into(),
            run_id: None,
        }
        .for_run(run_id);

        let reply = backend.complete(&request, 0.3).await.unwrap();
        assert_eq!(reply, r#"{"score": 5}"#);

        let sent = gateway.0.lock().unwrap();
        let chat = &sent[0];
        assert_eq!(chat.model, "openai/gpt-5-mini");
        assert_eq!(chat.attribution.run_id, Some(run_id));
        assert_eq!(chat.attribution.backend_id.as_deref(), Some("gpt"));
        assert_eq!(chat.max_tokens, Some(SCORE_MAX_OUTPUT_TOKENS_GPT5));
        assert!(chat.json_mode);
        assert_eq!(chat.messages.len(), 2);
    }
}
