//! Candidate results produced by the subject under test.
//!
//! The harness consumes the ranked list read-only. Its exact shape belongs to
//! the subject; all the harness needs is an ordered list of items with ids,
//! optional scores and free-form metadata, stable for the duration of a run.

use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::testcase::CaseSetup;

/// One entry in the ranked list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateItem {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl CandidateItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            score: None,
            metadata: Map::new(),
        }
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Look up a field by name: `id`, `title`, `score`, else metadata.
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "id" => Some(Value::String(self.id.clone())),
            "title" => self.title.clone().map(Value::String),
            "score" => self.score.map(Value::from),
            _ => self.metadata.get(name).cloned(),
        }
    }

    /// Numeric view of a field. Numeric strings are accepted.
    pub fn numeric_field(&self, name: &str) -> Option<f64> {
        let value = self.field(name)?;
        let number = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }?;
        number.is_finite().then_some(number)
    }
}

/// The ranked list plus whatever tunable configuration produced it.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CandidateResult {
    pub items: Vec<CandidateItem>,
    /// Snapshot of the subject's active configuration, copied into the report.
    #[serde(default)]
    pub config_snapshot: Value,
}

impl CandidateResult {
    pub fn new(items: Vec<CandidateItem>) -> Self {
        Self {
            items,
            config_snapshot: Value::Null,
        }
    }

    pub fn with_config_snapshot(mut self, snapshot: Value) -> Self {
        self.config_snapshot = snapshot;
        self
    }

    /// The first `top_n` items (all of them when `top_n` is `None`).
    pub fn top(&self, top_n: Option<usize>) -> &[CandidateItem] {
        let n = top_n.unwrap_or(self.items.len()).min(self.items.len());
        &self.items[..n]
    }
}

// =============================================================================
// Source
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum CandidateError {
    #[error("unknown profile: {0}")]
    UnknownProfile(String),
    #[error("subject under test failed: {0}")]
    Subject(String),
}

/// The subject under test, seen from the harness.
#[async_trait::async_trait]
pub trait CandidateSource: Send + Sync {
    async fn fetch(&self, setup: &CaseSetup) -> Result<CandidateResult, CandidateError>;
}

/// Serves a fixed candidate result, e.g. a recorded response being re-judged.
#[derive(Debug, Default)]
pub struct StaticCandidateSource {
    result: CandidateResult,
    fetches: AtomicUsize,
}

impl StaticCandidateSource {
    pub fn new(result: CandidateResult) -> Self {
        Self {
            result,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CandidateSource for StaticCandidateSource {
    async fn fetch(&self, _setup: &CaseSetup) -> Result<CandidateResult, CandidateError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.result.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_field_reads_metadata_and_builtin_score() {
        let item = CandidateItem::new("doc-1")
            .score(0.82)
            .with("credibility", 4)
            .with("year", "2021")
            .with("source", "nature");

        assert_eq!(item.numeric_field("score"), Some(0.82));
        assert_eq!(item.numeric_field("credibility"), Some(4.0));
        assert_eq!(item.numeric_field("year"), Some(2021.0));
        assert_eq!(item.numeric_field("source"), None);
        assert_eq!(item.numeric_field("missing"), None);
    }

    #[test]
    fn top_clamps_to_available_items() {
        let result = CandidateResult::new(vec![CandidateItem::new("a"), CandidateItem::new("b")]);
        assert_eq!(result.top(Some(5)).len(), 2);
        assert_eq!(result.top(Some(1)).len(), 1);
        assert_eq!(result.top(None).len(), 2);
    }

    #[test]
    fn candidate_result_decodes_from_subject_payload() {
        let raw = json!({
            "items": [
                {"id": "p1", "title": "Paper one", "score": 0.9, "metadata": {"credibility": 5}},
                {"id": "p2"}
            ],
            "config_snapshot": {"embedding": "e5-large", "top_k": 20}
        });
        let result: CandidateResult = serde_json::from_value(raw).unwrap();
        assert_eq!(result.items.len(), 2);
        assert_eq!(result.items[1].score, None);
        assert_eq!(result.config_snapshot["top_k"], 20);
    }
}
