//! Test reports: the persisted audit artifact of a run.
//!
//! A report carries enough per-backend detail (stage-1 aggregates, sample
//! counts, skipped backends and their reasons) to answer "why did this fail"
//! without re-running anything.

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::aggregate::{ConsensusLevel, ConsensusResult, SkippedBackend, WithinBackendAggregate};
use crate::criteria::{CriterionKindTag, DeterministicScore};

pub use store::{InMemoryReportStore, ReportStore, SqliteReportStore, StoreError};

/// Outcome of a criterion or of a whole test case.
///
/// `Failed` means the subject was scored below threshold. `Errored` means no
/// valid judgement could be obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Passed,
    Failed,
    Errored,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Passed => "passed",
            Status::Failed => "failed",
            Status::Errored => "errored",
        }
    }

    /// `failed` if any failed, else `errored` if any errored, else `passed`.
    pub fn overall<'a>(statuses: impl IntoIterator<Item = &'a Status>) -> Status {
        let mut errored = false;
        for status in statuses {
            match status {
                Status::Failed => return Status::Failed,
                Status::Errored => errored = true,
                Status::Passed => {}
            }
        }
        if errored {
            Status::Errored
        } else {
            Status::Passed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CriterionReport {
    pub id: String,
    pub kind: CriterionKindTag,
    pub status: Status,
    #[serde(default)]
    pub final_score: Option<f64>,
    pub threshold: f64,
    pub passed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_level: Option<ConsensusLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cross_backend_std: Option<f64>,
    #[serde(default)]
    pub flagged_for_review: bool,
    /// Machine-readable explanation from a deterministic function.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backend_results: Vec<WithinBackendAggregate>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped_backends: Vec<SkippedBackend>,
}

impl CriterionReport {
    pub fn deterministic(
        id: impl Into<String>,
        threshold: f64,
        outcome: DeterministicScore,
    ) -> Self {
        let passed = outcome.score >= threshold;
        Self {
            id: id.into(),
            kind: CriterionKindTag::Deterministic,
            status: if passed { Status::Passed } else { Status::Failed },
            final_score: Some(outcome.score),
            threshold,
            passed,
            consensus_level: None,
            cross_backend_std: None,
            flagged_for_review: false,
            explanation: Some(outcome.explanation),
            error: None,
            backend_results: Vec::new(),
            skipped_backends: Vec::new(),
        }
    }

    pub fn consensus(
        id: impl Into<String>,
        result: ConsensusResult,
        skipped_backends: Vec<SkippedBackend>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: CriterionKindTag::Backend,
            status: if result.passed {
                Status::Passed
            } else {
                Status::Failed
            },
            final_score: Some(result.final_score),
            threshold: result.threshold,
            passed: result.passed,
            consensus_level: Some(result.consensus_level),
            cross_backend_std: Some(result.cross_backend_std),
            flagged_for_review: result.flagged_for_review,
            explanation: None,
            error: None,
            backend_results: result.backends,
            skipped_backends,
        }
    }

    pub fn errored(
        id: impl Into<String>,
        kind: CriterionKindTag,
        threshold: f64,
        error: impl Into<String>,
        skipped_backends: Vec<SkippedBackend>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            status: Status::Errored,
            final_score: None,
            threshold,
            passed: false,
            consensus_level: None,
            cross_backend_std: None,
            flagged_for_review: false,
            explanation: None,
            error: Some(error.into()),
            backend_results: Vec::new(),
            skipped_backends,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub run_id: Uuid,
    pub test_id: String,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    /// Subject configuration plus the harness settings in effect.
    pub config_snapshot: Value,
    pub status: Status,
    /// Run-level failure, e.g. cancellation or a failed candidate fetch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub criteria: Vec<CriterionReport>,
}

impl TestReport {
    pub fn criterion(&self, id: &str) -> Option<&CriterionReport> {
        self.criteria.iter().find(|c| c.id == id)
    }

    pub fn flagged(&self) -> impl Iterator<Item = &CriterionReport> {
        self.criteria.iter().filter(|c| c.flagged_for_review)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{SampleCounts, SampleRecord, SkipReason};
    use crate::judge::ParseStage;
    use serde_json::json;

    fn judged() -> CriterionReport {
        CriterionReport::consensus(
            "relevance",
            ConsensusResult {
                final_score: 5.915,
                cross_backend_std: 0.41500000000000004,
                consensus_level: ConsensusLevel::Good,
                threshold: 6.0,
                passed: false,
                flagged_for_review: false,
                backends: vec![WithinBackendAggregate {
                    backend_id: "a".into(),
                    identity: "openai/gpt-5-mini".into(),
                    mean: 6.333333333333333,
                    std_dev: 0.4714045207910317,
                    counts: SampleCounts {
                        attempted: 3,
                        valid: 3,
                        ..Default::default()
                    },
                    samples: vec![SampleRecord {
                        index: 0,
                        attempts: 1,
                        score: Some(6.0),
                        rationale: Some("mostly on topic".into()),
                        parse_stage: Some(ParseStage::FencedBlock),
                        failure: None,
                    }],
                }],
            },
            vec![SkippedBackend {
                backend_id: "slow".into(),
                identity: "x/slow".into(),
                reason: SkipReason::AllSamplesFailed {
                    counts: SampleCounts {
                        attempted: 3,
                        transport_failures: 3,
                        ..Default::default()
                    },
                    last_error: Some("timeout: timeout after 30s".into()),
                    samples: Vec::new(),
                },
            }],
        )
    }

    #[test]
    fn overall_status_precedence() {
        use Status::*;
        assert_eq!(Status::overall(&[Passed, Passed]), Passed);
        assert_eq!(Status::overall(&[Passed, Errored]), Errored);
        assert_eq!(Status::overall(&[Errored, Failed, Passed]), Failed);
        assert_eq!(Status::overall(&[]), Passed);
    }

    #[test]
    fn report_round_trips_exactly() {
        let report = TestReport {
            run_id: Uuid::new_v4(),
            test_id: "tc-001".into(),
            name: "climate papers".into(),
            timestamp: Utc::now(),
            config_snapshot: json!({"subject": {"top_k": 20}}),
            status: Status::Failed,
            error: None,
            criteria: vec![
                judged(),
                CriterionReport::deterministic(
                    "avg_credibility",
                    3.0,
                    DeterministicScore {
                        score: 3.6,
                        explanation: "avg(credibility) over 5/5 items = 3.600".into(),
                    },
                ),
            ],
        };
        let back = TestReport::from_json(&report.to_json().unwrap()).unwrap();
        assert_eq!(back, report);
        let c = back.criterion("relevance").unwrap();
        assert_eq!(c.final_score, Some(5.915));
        assert!(!c.passed);
        assert_eq!(c.consensus_level, Some(ConsensusLevel::Good));
        assert!(back.criterion("avg_credibility").unwrap().passed);
    }

    #[test]
    fn external_shape_uses_lowercase_status_and_uppercase_levels() {
        let value = serde_json::to_value(judged()).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["kind"], "backend");
        assert_eq!(value["consensus_level"], "GOOD");
        assert_eq!(value["skipped_backends"][0]["reason"]["kind"], "all_samples_failed");
        let sample = &value["backend_results"][0]["samples"][0];
        assert_eq!(sample["rationale"], "mostly on topic");
        assert_eq!(sample["parse_stage"], "fenced_block");

        let det = serde_json::to_value(CriterionReport::deterministic(
            "x",
            1.0,
            DeterministicScore {
                score: 1.0,
                explanation: String::new(),
            },
        ))
        .unwrap();
        assert!(det.get("consensus_level").is_none());
        assert!(det.get("backend_results").is_none());
    }
}
