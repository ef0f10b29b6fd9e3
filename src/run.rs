//! Run coordinator.
//!
//! One run judges one test case:
//! `PENDING -> FETCHING_CANDIDATE -> DISPATCHING -> AGGREGATING -> COMPLETE`,
//! with cancellation at any point going straight to `ERRORED`. Every criterion
//! is resolved before anything external is touched, so a configuration error
//! never partially executes. The candidate is fetched exactly once and shared
//! by every criterion.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::aggregate::{cross_backend, BackendOutcome};
use crate::cancel::CancelScope;
use crate::candidate::{CandidateResult, CandidateSource};
use crate::config::RunConfig;
use crate::criteria::{CriterionDefinition, CriterionKind, CriterionRegistry};
use crate::error::ConfigurationError;
use crate::judge::render_request;
use crate::report::{CriterionReport, ReportStore, Status, StoreError, TestReport};
use crate::sampling::SamplingOrchestrator;
use crate::testcase::TestCase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    FetchingCandidate,
    Dispatching,
    Aggregating,
    Complete,
    Errored,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Pending => "PENDING",
            RunState::FetchingCandidate => "FETCHING_CANDIDATE",
            RunState::Dispatching => "DISPATCHING",
            RunState::Aggregating => "AGGREGATING",
            RunState::Complete => "COMPLETE",
            RunState::Errored => "ERRORED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Complete | RunState::Errored)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives every state transition of every run.
pub trait RunObserver: Send + Sync {
    fn on_transition(&self, test_id: &str, from: RunState, to: RunState);
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("failed to persist report: {0}")]
    Store(#[from] StoreError),
}

/// A criterion reference resolved against the registry.
#[derive(Debug, Clone)]
pub struct ResolvedCriterion {
    pub definition: Arc<CriterionDefinition>,
    pub threshold: f64,
    pub params: Map<String, Value>,
}

struct StateTracker<'a> {
    test_id: &'a str,
    state: RunState,
    observer: Option<&'a dyn RunObserver>,
}

impl<'a> StateTracker<'a> {
    fn new(test_id: &'a str, observer: Option<&'a dyn RunObserver>) -> Self {
        Self {
            test_id,
            state: RunState::Pending,
            observer,
        }
    }

    fn advance(&mut self, to: RunState) {
        let from = self.state;
        self.state = to;
        info!(test_id = %self.test_id, from = %from, to = %to, "run state");
        if let Some(observer) = self.observer {
            observer.on_transition(self.test_id, from, to);
        }
    }
}

pub struct RunCoordinator {
    registry: Arc<CriterionRegistry>,
    config: Arc<RunConfig>,
    orchestrator: Arc<SamplingOrchestrator>,
    source: Arc<dyn CandidateSource>,
    observer: Option<Arc<dyn RunObserver>>,
    store: Option<Arc<dyn ReportStore>>,
}

impl RunCoordinator {
    /// `orchestrator` must be built from the same `config`.
    pub fn new(
        registry: Arc<CriterionRegistry>,
        config: Arc<RunConfig>,
        orchestrator: Arc<SamplingOrchestrator>,
        source: Arc<dyn CandidateSource>,
    ) -> Self {
        Self {
            registry,
            config,
            orchestrator,
            source,
            observer: None,
            store: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Persist every finished report, including errored ones.
    pub fn with_store(mut self, store: Arc<dyn ReportStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Resolve every criterion reference, or fail before any external call.
    pub fn resolve(&self, case: &TestCase) -> Result<Vec<ResolvedCriterion>, ConfigurationError> {
        let mut seen = HashSet::new();
        let mut resolved = Vec::with_capacity(case.criteria.len());
        for reference in &case.criteria {
            if !seen.insert(reference.id.as_str()) {
                return Err(ConfigurationError::DuplicateReference {
                    test_id: case.test_id.clone(),
                    criterion_id: reference.id.clone(),
                });
            }
            let definition = self.registry.lookup(&reference.id)?;
            let threshold = definition.effective_threshold(reference.threshold)?;
            let params = definition.resolve_params(reference.params.as_ref())?;
            if definition.is_backend_judged() && self.orchestrator.enabled_backends() == 0 {
                return Err(ConfigurationError::NoEnabledBackends(definition.id.clone()));
            }
            resolved.push(ResolvedCriterion {
                definition,
                threshold,
                params,
            });
        }
        Ok(resolved)
    }

    pub async fn run(&self, case: &TestCase, scope: &CancelScope) -> Result<TestReport, RunError> {
        let mut tracker = StateTracker::new(&case.test_id, self.observer.as_deref());
        let resolved = match self.resolve(case) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(test_id = %case.test_id, error = %err, "test case rejected");
                tracker.advance(RunState::Errored);
                return Err(err.into());
            }
        };
        let draft = Draft {
            run_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            case,
            resolved: &resolved,
        };

        tracker.advance(RunState::FetchingCandidate);
        let fetched = tokio::select! {
            biased;
            _ = scope.cancelled() => Err(cancel_reason(scope)),
            result = self.source.fetch(&case.setup) => {
                result.map_err(|e| format!("candidate fetch failed: {e}"))
            }
        };
        let candidate = match fetched {
            Ok(candidate) => candidate,
            Err(reason) => {
                let snapshot = self.config_snapshot(&draft, None);
                let report = draft.errored(snapshot, reason);
                return self.finish(&mut tracker, report).await;
            }
        };
        let snapshot = self.config_snapshot(&draft, Some(&candidate));

        tracker.advance(RunState::Dispatching);
        let mut reports: Vec<Option<CriterionReport>> = vec![None; resolved.len()];
        for (idx, criterion) in resolved.iter().enumerate() {
            if let CriterionKind::Deterministic { function } = &criterion.definition.kind {
                let id = &criterion.definition.id;
                reports[idx] = Some(match function.evaluate(&candidate, &criterion.params) {
                    Ok(outcome) => CriterionReport::deterministic(id, criterion.threshold, outcome),
                    Err(err) => {
                        warn!(
                            test_id = %case.test_id,
                            criterion_id = %id,
                            error = %err,
                            "deterministic criterion errored"
                        );
                        CriterionReport::errored(
                            id,
                            criterion.definition.kind.tag(),
                            criterion.threshold,
                            err.to_string(),
                            Vec::new(),
                        )
                    }
                });
            }
        }

        let judged = join_all(resolved.iter().enumerate().filter_map(|(idx, criterion)| {
            let CriterionKind::BackendJudged { template } = &criterion.definition.kind else {
                return None;
            };
            let request = render_request(
                &criterion.definition.id,
                criterion.definition.scale,
                template,
                &criterion.params,
                &candidate,
                case.guidance.as_deref(),
            )
            .for_run(draft.run_id);
            let criterion_scope = scope.child();
            Some(async move {
                let outcomes = self
                    .orchestrator
                    .judge_criterion(&case.test_id, &request, &criterion_scope)
                    .await;
                (idx, outcomes)
            })
        }))
        .await;

        if scope.is_cancelled() {
            let reason = cancel_reason(scope);
            for (idx, _) in &judged {
                let criterion = &resolved[*idx];
                reports[*idx] = Some(CriterionReport::errored(
                    &criterion.definition.id,
                    criterion.definition.kind.tag(),
                    criterion.threshold,
                    reason.clone(),
                    Vec::new(),
                ));
            }
            let report = draft.finish(snapshot, reports, Some(reason));
            return self.finish(&mut tracker, report).await;
        }

        tracker.advance(RunState::Aggregating);
        for (idx, outcomes) in judged {
            let criterion = &resolved[idx];
            reports[idx] = Some(self.aggregate(&case.test_id, criterion, outcomes));
        }

        let report = draft.finish(snapshot, reports, None);
        self.finish(&mut tracker, report).await
    }

    fn aggregate(
        &self,
        test_id: &str,
        criterion: &ResolvedCriterion,
        outcomes: Vec<BackendOutcome>,
    ) -> CriterionReport {
        let id = &criterion.definition.id;
        let mut aggregates = Vec::new();
        let mut skipped = Vec::new();
        for outcome in outcomes {
            match outcome {
                BackendOutcome::Aggregated(agg) => aggregates.push(agg),
                BackendOutcome::Skipped(skip) => skipped.push(skip),
            }
        }
        skipped.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));

        match cross_backend(aggregates, criterion.threshold, &self.config.consensus) {
            Some(result) => {
                if result.flagged_for_review {
                    warn!(
                        test_id = %test_id,
                        criterion_id = %id,
                        cross_backend_std = result.cross_backend_std,
                        "backends disagree; flagged for review"
                    );
                }
                CriterionReport::consensus(id, result, skipped)
            }
            None => {
                warn!(
                    test_id = %test_id,
                    criterion_id = %id,
                    "no backend produced a valid judgement"
                );
                CriterionReport::errored(
                    id,
                    criterion.definition.kind.tag(),
                    criterion.threshold,
                    "all backends failed",
                    skipped,
                )
            }
        }
    }

    async fn finish(
        &self,
        tracker: &mut StateTracker<'_>,
        report: TestReport,
    ) -> Result<TestReport, RunError> {
        tracker.advance(match report.error {
            Some(_) => RunState::Errored,
            None => RunState::Complete,
        });
        info!(
            test_id = %report.test_id,
            run_id = %report.run_id,
            status = report.status.as_str(),
            "run finished"
        );
        if let Some(store) = &self.store {
            store.save(&report).await?;
        }
        Ok(report)
    }

    fn config_snapshot(&self, draft: &Draft<'_>, candidate: Option<&CandidateResult>) -> Value {
        let criteria: Vec<Value> = draft
            .resolved
            .iter()
            .map(|c| {
                json!({
                    "id": c.definition.id,
                    "kind": c.definition.kind.tag(),
                    "threshold": c.threshold,
                    "params": c.params,
                })
            })
            .collect();
        let candidate_digest = candidate.map(|c| {
            let items = serde_json::to_string(&c.items).unwrap_or_default();
            blake3::hash(items.as_bytes()).to_hex().to_string()
        });
        json!({
            "profile_ref": draft.case.setup.profile_ref,
            "candidate_request": draft.case.setup.candidate_request,
            "subject": candidate.map(|c| c.config_snapshot.clone()).unwrap_or(Value::Null),
            "candidate_items": candidate.map(|c| c.items.len()),
            "candidate_digest": candidate_digest,
            "harness": {
                "backends": self.config.backends,
                "consensus": self.config.consensus,
                "sampling": self.orchestrator.settings(),
            },
            "criteria": criteria,
        })
    }
}

impl fmt::Debug for RunCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunCoordinator")
            .field("criteria", &self.registry.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn cancel_reason(scope: &CancelScope) -> String {
    format!(
        "cancelled: {}",
        scope.reason().unwrap_or_else(|| "no reason given".into())
    )
}

/// Per-run fields shared by every way a run can end.
struct Draft<'a> {
    run_id: Uuid,
    timestamp: DateTime<Utc>,
    case: &'a TestCase,
    resolved: &'a [ResolvedCriterion],
}

impl Draft<'_> {
    fn finish(
        &self,
        config_snapshot: Value,
        reports: Vec<Option<CriterionReport>>,
        error: Option<String>,
    ) -> TestReport {
        let criteria: Vec<CriterionReport> = reports
            .into_iter()
            .zip(self.resolved)
            .map(|(report, criterion)| {
                report.unwrap_or_else(|| {
                    CriterionReport::errored(
                        &criterion.definition.id,
                        criterion.definition.kind.tag(),
                        criterion.threshold,
                        "not evaluated",
                        Vec::new(),
                    )
                })
            })
            .collect();
        let status = match error {
            Some(_) => Status::Errored,
            None => Status::overall(criteria.iter().map(|c| &c.status)),
        };
        TestReport {
            run_id: self.run_id,
            test_id: self.case.test_id.clone(),
            name: self.case.name.clone(),
            timestamp: self.timestamp,
            config_snapshot,
            status,
            error,
            criteria,
        }
    }

    /// Every criterion errored with the run-level reason.
    fn errored(&self, config_snapshot: Value, reason: String) -> TestReport {
        let reports = self
            .resolved
            .iter()
            .map(|c| {
                Some(CriterionReport::errored(
                    &c.definition.id,
                    c.definition.kind.tag(),
                    c.threshold,
                    reason.clone(),
                    Vec::new(),
                ))
            })
            .collect();
        self.finish(config_snapshot, reports, Some(reason))
    }
}
