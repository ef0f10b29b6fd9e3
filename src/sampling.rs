//! Sampling orchestrator.
//!
//! For one backend-judged criterion, every enabled backend runs concurrently
//! under its own child cancellation scope, and each backend's N samples run
//! concurrently inside it. All fan-out is structured (`join_all` inside the
//! calling task), so cancelling or dropping a scope leaves nothing running.
//! A global [`ConcurrencyLimiter`] bounds in-flight backend calls across
//! criteria and runs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::aggregate::{within_backend, BackendOutcome, SkippedBackend};
use crate::cancel::CancelScope;
use crate::config::{BackendConfig, RunConfig, SamplingSettings};
use crate::error::ConfigurationError;
use crate::gateway::ChatGateway;
use crate::judge::{
    BackendClient, GatewayBackend, JudgeRequest, Sample, SampleFailure, SampleOutcome,
    ScoringBackend,
};
use crate::trace::{SampleTrace, TraceSink};

// =============================================================================
// Concurrency limiter
// =============================================================================

/// Bounded, shareable cap on in-flight backend calls.
///
/// Clone it into every orchestrator that talks to the same external backends.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a permit, or `None` if `scope` is cancelled first.
    pub async fn acquire(&self, scope: &CancelScope) -> Option<OwnedSemaphorePermit> {
        tokio::select! {
            biased;
            _ = scope.cancelled() => None,
            permit = self.semaphore.clone().acquire_owned() => permit.ok(),
        }
    }
}

/// `base * 2^attempt`, never longer than `ceiling`.
fn backoff_delay(base: Duration, attempt: u32, ceiling: Duration) -> Duration {
    base.checked_mul(1 << attempt.min(5))
        .map_or(ceiling, |delay| delay.min(ceiling))
}

// =============================================================================
// Orchestrator
// =============================================================================

/// The judge panel for a run, plus the sampling policy applied to it.
pub struct SamplingOrchestrator {
    clients: Vec<BackendClient>,
    disabled: Vec<BackendConfig>,
    settings: SamplingSettings,
    limiter: ConcurrencyLimiter,
    trace: Option<Arc<dyn TraceSink>>,
}

impl SamplingOrchestrator {
    /// Build the panel from `config`. Every enabled backend needs an entry in
    /// `backends`, keyed by backend id.
    pub fn new(
        config: &RunConfig,
        backends: &HashMap<String, Arc<dyn ScoringBackend>>,
        limiter: ConcurrencyLimiter,
    ) -> Result<Self, ConfigurationError> {
        config.validate()?;
        let mut settings = config.sampling;
        settings.max_concurrency = limiter.capacity();
        let mut clients = Vec::new();
        let mut disabled = Vec::new();
        for backend in &config.backends {
            if !backend.enabled {
                disabled.push(backend.clone());
                continue;
            }
            let scorer = backends.get(&backend.backend_id).ok_or_else(|| {
                ConfigurationError::InvalidBackend {
                    backend_id: backend.backend_id.clone(),
                    reason: "no scoring backend registered".into(),
                }
            })?;
            clients.push(BackendClient::new(backend.clone(), scorer.clone()));
        }
        Ok(Self {
            clients,
            disabled,
            settings,
            limiter,
            trace: None,
        })
    }

    /// Every enabled backend is an OpenRouter model named by its identity.
    pub fn from_gateway(
        config: &RunConfig,
        gateway: Arc<dyn ChatGateway>,
        limiter: ConcurrencyLimiter,
    ) -> Result<Self, ConfigurationError> {
        let backends: HashMap<String, Arc<dyn ScoringBackend>> = config
            .enabled_backends()
            .map(|b| {
                let scorer: Arc<dyn ScoringBackend> =
                    Arc::new(GatewayBackend::new(gateway.clone(), b));
                (b.backend_id.clone(), scorer)
            })
            .collect();
        Self::new(config, &backends, limiter)
    }

    pub fn with_trace(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(trace);
        self
    }

    pub fn enabled_backends(&self) -> usize {
        self.clients.len()
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Settings in force. `max_concurrency` is the capacity of the shared
    /// limiter, which may differ from the configured value.
    pub fn settings(&self) -> &SamplingSettings {
        &self.settings
    }

    /// Sample every backend for one criterion and reduce each to stage 1.
    ///
    /// Disabled backends come back as skipped so the report records them.
    pub async fn judge_criterion(
        &self,
        test_id: &str,
        request: &JudgeRequest,
        scope: &CancelScope,
    ) -> Vec<BackendOutcome> {
        let digest = request.digest();
        let runs = self.clients.iter().map(|client| {
            let backend_scope = scope.child();
            let digest = digest.as_str();
            async move {
                let samples = self
                    .sample_backend(test_id, request, digest, client, &backend_scope)
                    .await;
                within_backend(client.config(), &samples)
            }
        });
        let mut outcomes = join_all(runs).await;
        outcomes.extend(
            self.disabled
                .iter()
                .map(|b| BackendOutcome::Skipped(SkippedBackend::disabled(b))),
        );
        outcomes
    }

    async fn sample_backend(
        &self,
        test_id: &str,
        request: &JudgeRequest,
        digest: &str,
        client: &BackendClient,
        scope: &CancelScope,
    ) -> Vec<Sample> {
        let n = client.config().n_samples;
        let samples =
            join_all((0..n).map(|index| self.sample_once(client, request, index, scope))).await;

        if let Some(trace) = &self.trace {
            for sample in &samples {
                let event = SampleTrace::from_sample(
                    test_id,
                    &request.criterion_id,
                    digest,
                    &client.config().identity,
                    sample,
                );
                if let Err(err) = trace.record(event) {
                    warn!(error = %err, "Failed to record sample trace");
                }
            }
        }
        samples
    }

    /// One sample with bounded transport retries. Parse failures are final.
    async fn sample_once(
        &self,
        client: &BackendClient,
        request: &JudgeRequest,
        index: u32,
        scope: &CancelScope,
    ) -> Sample {
        let started = Instant::now();
        let mut attempts = 0u32;
        let finish = |attempts: u32, outcome: SampleOutcome| Sample {
            backend_id: client.backend_id().to_string(),
            index,
            attempts,
            latency_ms: started.elapsed().as_millis() as u64,
            outcome,
        };
        let cancelled = |scope: &CancelScope| {
            SampleOutcome::Failed(SampleFailure::Cancelled {
                reason: scope.reason().unwrap_or_else(|| "cancelled".into()),
            })
        };

        loop {
            let Some(permit) = self.limiter.acquire(scope).await else {
                return finish(attempts, cancelled(scope));
            };
            attempts += 1;
            let outcome = tokio::select! {
                biased;
                _ = scope.cancelled() => cancelled(scope),
                out = client.call(request, self.settings.sample_timeout()) => out,
            };
            drop(permit);

            match outcome {
                SampleOutcome::Failed(failure)
                    if failure.is_retryable() && attempts <= self.settings.transport_retries =>
                {
                    let delay = backoff_delay(
                        self.settings.retry_base_delay(),
                        attempts - 1,
                        self.settings.sample_timeout(),
                    );
                    debug!(
                        backend_id = %client.backend_id(),
                        criterion_id = %request.criterion_id,
                        sample_index = index,
                        error = %failure,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying sample after transport failure"
                    );
                    tokio::select! {
                        biased;
                        _ = scope.cancelled() => return finish(attempts, cancelled(scope)),
                        _ = sleep(delay) => {}
                    }
                }
                SampleOutcome::Failed(failure) => {
                    warn!(
                        backend_id = %client.backend_id(),
                        criterion_id = %request.criterion_id,
                        sample_index = index,
                        attempts,
                        error = %failure,
                        "Sample failed"
                    );
                    return finish(attempts, SampleOutcome::Failed(failure));
                }
                scored => return finish(attempts, scored),
            }
        }
    }
}

impl std::fmt::Debug for SamplingOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplingOrchestrator")
            .field(
                "clients",
                &self.clients.iter().map(BackendClient::backend_id).collect::<Vec<_>>(),
            )
            .field("disabled", &self.disabled)
            .field("settings", &self.settings)
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}
