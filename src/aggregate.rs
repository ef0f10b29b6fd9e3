//! Two-stage aggregation.
//!
//! Stage 1 reduces one backend's valid samples to a mean and population
//! standard deviation. Stage 2 reduces the stage-1 means of every contributing
//! backend to the final score and the cross-backend deviation, then classifies
//! agreement. Inputs are sorted before reduction so results do not depend on
//! arrival order.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::config::{BackendConfig, ConsensusPolicy};
use crate::judge::{ParseStage, Sample, SampleFailure, SampleOutcome};

/// Mean and population standard deviation, or `None` for an empty set.
pub fn population_stats(values: &[f64]) -> Option<(f64, f64)> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let (first, last) = (*sorted.first()?, *sorted.last()?);
    if first == last {
        return Some((first, 0.0));
    }
    let mean = sorted.iter().mean();
    let std_dev = sorted.iter().population_std_dev();
    Some((mean, std_dev))
}

// =============================================================================
// Stage 1
// =============================================================================

/// Per-backend sample accounting. Every attempted sample lands in exactly
/// one of `valid`, `transport_failures`, `parse_failures`, `refusals` or
/// `cancelled`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleCounts {
    pub attempted: u32,
    pub valid: u32,
    pub transport_failures: u32,
    pub parse_failures: u32,
    /// Backend declined to score.
    #[serde(default)]
    pub refusals: u32,
    pub cancelled: u32,
}

/// One sample as kept in the report: the score and rationale behind it, or
/// why it was excluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub index: u32,
    pub attempts: u32,
    pub score: Option<f64>,
    pub rationale: Option<String>,
    pub parse_stage: Option<ParseStage>,
    pub failure: Option<String>,
}

impl From<&Sample> for SampleRecord {
    fn from(sample: &Sample) -> Self {
        let (score, rationale, parse_stage, failure) = match &sample.outcome {
            SampleOutcome::Scored {
                score,
                rationale,
                stage,
            } => (Some(*score), Some(rationale.clone()), Some(*stage), None),
            SampleOutcome::Failed(f) => (None, None, None, Some(f.to_string())),
        };
        Self {
            index: sample.index,
            attempts: sample.attempts,
            score,
            rationale,
            parse_stage,
            failure,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithinBackendAggregate {
    pub backend_id: String,
    pub identity: String,
    pub mean: f64,
    pub std_dev: f64,
    pub counts: SampleCounts,
    /// Every sample, valid or not, by index.
    pub samples: Vec<SampleRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    AllSamplesFailed {
        counts: SampleCounts,
        last_error: Option<String>,
        /// Each excluded sample with its failure.
        samples: Vec<SampleRecord>,
    },
}

/// A backend excluded from cross-backend aggregation, with why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedBackend {
    pub backend_id: String,
    pub identity: String,
    pub reason: SkipReason,
}

impl SkippedBackend {
    pub fn disabled(config: &BackendConfig) -> Self {
        Self {
            backend_id: config.backend_id.clone(),
            identity: config.identity.clone(),
            reason: SkipReason::Disabled,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BackendOutcome {
    Aggregated(WithinBackendAggregate),
    Skipped(SkippedBackend),
}

/// Stage 1 over one backend's samples. Zero valid samples means skipped,
/// never a zero score.
pub fn within_backend(config: &BackendConfig, samples: &[Sample]) -> BackendOutcome {
    let mut counts = SampleCounts {
        attempted: samples.len() as u32,
        ..Default::default()
    };
    let mut scores = Vec::with_capacity(samples.len());
    let mut records: Vec<SampleRecord> = samples.iter().map(SampleRecord::from).collect();
    records.sort_by_key(|r| r.index);
    for sample in samples {
        match &sample.outcome {
            SampleOutcome::Scored { score, .. } => scores.push(*score),
            SampleOutcome::Failed(failure) => match failure {
                SampleFailure::Transport { .. } => counts.transport_failures += 1,
                SampleFailure::Parse { .. } => counts.parse_failures += 1,
                SampleFailure::Refused { .. } => counts.refusals += 1,
                SampleFailure::Cancelled { .. } => counts.cancelled += 1,
            },
        }
    }
    counts.valid = scores.len() as u32;

    match population_stats(&scores) {
        Some((mean, std_dev)) => BackendOutcome::Aggregated(WithinBackendAggregate {
            backend_id: config.backend_id.clone(),
            identity: config.identity.clone(),
            mean,
            std_dev,
            counts,
            samples: records,
        }),
        None => BackendOutcome::Skipped(SkippedBackend {
            backend_id: config.backend_id.clone(),
            identity: config.identity.clone(),
            reason: SkipReason::AllSamplesFailed {
                counts,
                last_error: records.iter().rev().find_map(|r| r.failure.clone()),
                samples: records,
            },
        }),
    }
}

// =============================================================================
// Stage 2
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConsensusLevel {
    Strong,
    Good,
    Partial,
    Low,
}

impl ConsensusLevel {
    pub fn classify(std_dev: f64, policy: &ConsensusPolicy) -> Self {
        if std_dev < policy.strong_below {
            ConsensusLevel::Strong
        } else if std_dev < policy.good_below {
            ConsensusLevel::Good
        } else if std_dev < policy.partial_below {
            ConsensusLevel::Partial
        } else {
            ConsensusLevel::Low
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsensusLevel::Strong => "STRONG",
            ConsensusLevel::Good => "GOOD",
            ConsensusLevel::Partial => "PARTIAL",
            ConsensusLevel::Low => "LOW",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusResult {
    pub final_score: f64,
    pub cross_backend_std: f64,
    pub consensus_level: ConsensusLevel,
    pub threshold: f64,
    pub passed: bool,
    pub flagged_for_review: bool,
    /// Contributing backends, ordered by backend id. Never empty.
    pub backends: Vec<WithinBackendAggregate>,
}

/// Stage 2. Returns `None` when no backend contributed a valid aggregate.
pub fn cross_backend(
    mut backends: Vec<WithinBackendAggregate>,
    threshold: f64,
    policy: &ConsensusPolicy,
) -> Option<ConsensusResult> {
    backends.retain(|b| b.counts.valid > 0);
    backends.sort_by(|a, b| a.backend_id.cmp(&b.backend_id));
    let means: Vec<f64> = backends.iter().map(|b| b.mean).collect();
    let (final_score, cross_backend_std) = population_stats(&means)?;
    Some(ConsensusResult {
        final_score,
        cross_backend_std,
        consensus_level: ConsensusLevel::classify(cross_backend_std, policy),
        threshold,
        passed: final_score >= threshold,
        flagged_for_review: cross_backend_std > policy.flag_threshold,
        backends,
    })
}
