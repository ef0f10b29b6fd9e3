//! Backend client adapter: one bounded request/response cycle into a sample outcome.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::backend::ScoringBackend;
use super::parse::{parse_score_reply, ParseError, ParseStage};
use super::prompts::JudgeRequest;
use crate::config::BackendConfig;
use crate::gateway::ProviderError;

/// Why a sample produced no score.
///
/// Transport and parse failures are kept apart because the orchestrator
/// retries the former and never the latter. A refusal is the backend
/// declining the scoring contract outright, so it is neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SampleFailure {
    Transport {
        code: String,
        message: String,
        retryable: bool,
    },
    Parse {
        error: ParseError,
    },
    Refused {
        message: String,
    },
    Cancelled {
        reason: String,
    },
}

impl SampleFailure {
    pub fn transport(err: &ProviderError) -> Self {
        if let ProviderError::Refused(message) = err {
            return SampleFailure::Refused {
                message: message.clone(),
            };
        }
        SampleFailure::Transport {
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.is_retryable(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SampleFailure::Transport { retryable: true, .. })
    }

    pub fn code(&self) -> &str {
        match self {
            SampleFailure::Transport { code, .. } => code,
            SampleFailure::Parse { .. } => "parse_error",
            SampleFailure::Refused { .. } => "refused",
            SampleFailure::Cancelled { .. } => "cancelled",
        }
    }
}

impl std::fmt::Display for SampleFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleFailure::Transport { code, message, .. } => write!(f, "{code}: {message}"),
            SampleFailure::Parse { error } => write!(f, "{error}"),
            SampleFailure::Refused { message } => write!(f, "refused: {message}"),
            SampleFailure::Cancelled { reason } => write!(f, "cancelled: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SampleOutcome {
    Scored {
        score: f64,
        rationale: String,
        stage: ParseStage,
    },
    Failed(SampleFailure),
}

/// One backend invocation, after retries.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub backend_id: String,
    pub index: u32,
    pub attempts: u32,
    pub latency_ms: u64,
    pub outcome: SampleOutcome,
}

impl Sample {
    pub fn score(&self) -> Option<f64> {
        match self.outcome {
            SampleOutcome::Scored { score, .. } => Some(score),
            SampleOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&SampleFailure> {
        match &self.outcome {
            SampleOutcome::Failed(f) => Some(f),
            SampleOutcome::Scored { .. } => None,
        }
    }
}

/// A configured panel member: backend config plus the transport behind it.
#[derive(Clone)]
pub struct BackendClient {
    config: BackendConfig,
    backend: Arc<dyn ScoringBackend>,
}

impl BackendClient {
    pub fn new(config: BackendConfig, backend: Arc<dyn ScoringBackend>) -> Self {
        Self { config, backend }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn backend_id(&self) -> &str {
        &self.config.backend_id
    }

    /// Send one request under `deadline` and parse the reply.
    pub async fn call(&self, request: &JudgeRequest, deadline: Duration) -> SampleOutcome {
        let reply = tokio::time::timeout(
            deadline,
            self.backend.complete(request, self.config.temperature),
        )
        .await;
        let raw = match reply {
            Err(_) => {
                let err = ProviderError::Timeout(deadline);
                return SampleOutcome::Failed(SampleFailure::transport(&err));
            }
            Ok(Err(err)) => return SampleOutcome::Failed(SampleFailure::transport(&err)),
            Ok(Ok(raw)) => raw,
        };
        match parse_score_reply(&raw, request.scale) {
            Ok(parsed) => SampleOutcome::Scored {
                score: parsed.score,
                rationale: parsed.rationale,
                stage: parsed.stage,
            },
            Err(error) => {
                debug!(
                    backend_id = %self.config.backend_id,
                    criterion_id = %request.criterion_id,
                    error = %error,
                    "unparseable backend reply"
                );
                SampleOutcome::Failed(SampleFailure::Parse { error })
            }
        }
    }
}

impl std::fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
