//! Per-call usage accounting.
//!
//! The gateway hands one [`UsageRecord`] to its [`UsageSink`] for every
//! provider call, successful or not. [`UsageLedger`] keeps per-run totals so
//! spend can be read back next to a report.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::ProviderError;
use super::types::{ChatRequest, ChatResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failed { code: &'static str },
}

#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub provider: &'static str,
    pub model: String,
    pub caller: &'static str,
    pub run_id: Option<Uuid>,
    pub backend_id: Option<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
    pub outcome: CallOutcome,
    pub request_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    fn for_request(provider: &'static str, req: &ChatRequest, latency: Duration) -> Self {
        Self {
            provider,
            model: req.model.clone(),
            caller: req.attribution.caller,
            run_id: req.attribution.run_id,
            backend_id: req.attribution.backend_id.clone(),
            input_tokens: 0,
            output_tokens: 0,
            latency_ms: latency.as_millis() as u64,
            outcome: CallOutcome::Success,
            request_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn success(provider: &'static str, req: &ChatRequest, resp: &ChatResponse) -> Self {
        Self {
            input_tokens: resp.input_tokens,
            output_tokens: resp.output_tokens,
            request_id: resp.request_id.clone(),
            ..Self::for_request(provider, req, resp.latency)
        }
    }

    pub fn failure(
        provider: &'static str,
        req: &ChatRequest,
        err: &ProviderError,
        latency: Duration,
    ) -> Self {
        Self {
            outcome: CallOutcome::Failed { code: err.code() },
            request_id: err.request_id().map(str::to_string),
            ..Self::for_request(provider, req, latency)
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == CallOutcome::Success
    }
}

#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Fire-and-forget; a sink never fails the call it is recording.
    async fn record(&self, record: UsageRecord);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: UsageRecord) {}
}

/// Totals for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunUsage {
    pub calls: u32,
    pub failed_calls: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// In-memory usage totals keyed by run id. Calls made outside a run are
/// tallied separately.
#[derive(Debug, Default)]
pub struct UsageLedger {
    totals: Mutex<HashMap<Option<Uuid>, RunUsage>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run(&self, run_id: Uuid) -> RunUsage {
        self.get(Some(run_id))
    }

    pub fn unattributed(&self) -> RunUsage {
        self.get(None)
    }

    fn get(&self, key: Option<Uuid>) -> RunUsage {
        let totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        totals.get(&key).copied().unwrap_or_default()
    }
}

#[async_trait]
impl UsageSink for UsageLedger {
    async fn record(&self, record: UsageRecord) {
        let mut totals = self.totals.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = totals.entry(record.run_id).or_default();
        entry.calls += 1;
        if !record.is_success() {
            entry.failed_calls += 1;
        }
        entry.input_tokens += u64::from(record.input_tokens);
        entry.output_tokens += u64::from(record.output_tokens);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Attribution, FinishReason, Message};

    fn request(run_id: Option<Uuid>) -> ChatRequest {
        ChatRequest::new(
            "x/model",
            vec![Message::user("rate")],
            Attribution::new("test").with_run(run_id).with_backend("b"),
        )
    }

    fn response(input: u32, output: u32) -> ChatResponse {
        ChatResponse {
            content: "{}".into(),
            input_tokens: input,
            output_tokens: output,
            latency: Duration::from_millis(40),
            finish_reason: FinishReason::Stop,
            request_id: Some("req-ok".into()),
        }
    }

    #[tokio::test]
    async fn ledger_totals_are_kept_per_run() {
        let ledger = UsageLedger::new();
        let run = Uuid::new_v4();
        let req = request(Some(run));
        ledger
            .record(UsageRecord::success("openrouter", &req, &response(100, 20)))
            .await;
        ledger
            .record(UsageRecord::success("openrouter", &req, &response(50, 5)))
            .await;
        ledger
            .record(UsageRecord::failure(
                "openrouter",
                &req,
                &ProviderError::Timeout(Duration::from_secs(1)),
                Duration::from_secs(1),
            ))
            .await;
        ledger
            .record(UsageRecord::success("openrouter", &request(None), &response(7, 1)))
            .await;

        assert_eq!(
            ledger.run(run),
            RunUsage {
                calls: 3,
                failed_calls: 1,
                input_tokens: 150,
                output_tokens: 25,
            }
        );
        assert_eq!(ledger.unattributed().calls, 1);
        assert_eq!(ledger.run(Uuid::new_v4()), RunUsage::default());
    }

    #[test]
    fn failure_record_carries_code_and_attribution() {
        let run = Uuid::new_v4();
        let record = UsageRecord::failure(
            "openrouter",
            &request(Some(run)),
            &ProviderError::Refused("no".into()),
            Duration::from_millis(12),
        );
        assert_eq!(record.outcome, CallOutcome::Failed { code: "refused" });
        assert_eq!(record.run_id, Some(run));
        assert_eq!(record.backend_id.as_deref(), Some("b"));
        assert_eq!(record.latency_ms, 12);
        assert!(!record.is_success());
    }
}
