//! Deterministic criterion functions.
//!
//! Pure functions over the candidate result: no network I/O, no randomness.
//! Each function is resolved once by `function_ref` into a static table entry
//! carrying a function pointer and its parameter schema.

use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde_json::{Map, Value};

use crate::candidate::{CandidateItem, CandidateResult};

pub type Params = Map<String, Value>;
pub type EvalFn = fn(&CandidateResult, &Params) -> Result<DeterministicScore, EvaluationError>;

/// Score plus a short machine-readable explanation.
#[derive(Debug, Clone, PartialEq)]
pub struct DeterministicScore {
    pub score: f64,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EvaluationError {
    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },
    #[error("no data: {0}")]
    NoData(String),
    #[error("function produced a non-finite score")]
    NonFinite,
    #[error("function panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    PositiveInt,
    Text,
}

#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub kind: ParamKind,
    pub required: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct DeterministicFunction {
    pub name: &'static str,
    pub params: &'static [ParamSpec],
    eval: EvalFn,
}

// =============================================================================
// Function table
// =============================================================================

const TOP_N: ParamSpec = ParamSpec {
    name: "top_n",
    kind: ParamKind::PositiveInt,
    required: false,
};

const FIELD: ParamSpec = ParamSpec {
    name: "field",
    kind: ParamKind::Text,
    required: true,
};

pub const BUILTIN_FUNCTIONS: &[DeterministicFunction] = &[
    DeterministicFunction {
        name: "avg_credibility",
        params: &[TOP_N],
        eval: avg_credibility,
    },
    DeterministicFunction {
        name: "avg_field",
        params: &[FIELD, TOP_N],
        eval: avg_field,
    },
    DeterministicFunction {
        name: "min_items",
        params: &[ParamSpec {
            name: "min",
            kind: ParamKind::PositiveInt,
            required: true,
        }],
        eval: min_items,
    },
    DeterministicFunction {
        name: "distinct_values",
        params: &[FIELD, TOP_N],
        eval: distinct_values,
    },
    DeterministicFunction {
        name: "field_coverage",
        params: &[FIELD, TOP_N],
        eval: field_coverage,
    },
    DeterministicFunction {
        name: "score_monotonic",
        params: &[],
        eval: score_monotonic,
    },
];

pub fn function_by_ref(name: &str) -> Option<&'static DeterministicFunction> {
    BUILTIN_FUNCTIONS.iter().find(|f| f.name == name)
}

impl DeterministicFunction {
    /// Check a merged parameter map against this function's schema.
    pub fn validate_params(&self, params: &Params) -> Result<(), String> {
        for key in params.keys() {
            if !self.params.iter().any(|p| p.name == key) {
                return Err(format!("unknown parameter '{key}' for {}", self.name));
            }
        }
        for spec in self.params {
            match params.get(spec.name) {
                None if spec.required => {
                    return Err(format!("missing required parameter '{}'", spec.name))
                }
                None => {}
                Some(value) => match spec.kind {
                    ParamKind::PositiveInt => {
                        if !value.as_u64().is_some_and(|n| n >= 1) {
                            return Err(format!("'{}' must be a positive integer", spec.name));
                        }
                    }
                    ParamKind::Text => {
                        if !value.as_str().is_some_and(|s| !s.trim().is_empty()) {
                            return Err(format!("'{}' must be a non-empty string", spec.name));
                        }
                    }
                },
            }
        }
        Ok(())
    }

    /// Run the function. Panics are contained and reported as errors.
    pub fn evaluate(
        &self,
        candidate: &CandidateResult,
        params: &Params,
    ) -> Result<DeterministicScore, EvaluationError> {
        let outcome = catch_unwind(AssertUnwindSafe(|| (self.eval)(candidate, params)))
            .map_err(|payload| EvaluationError::Panicked(panic_message(payload.as_ref())))??;
        if !outcome.score.is_finite() {
            return Err(EvaluationError::NonFinite);
        }
        Ok(outcome)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// =============================================================================
// Parameter helpers
// =============================================================================

fn top_n(params: &Params) -> Result<Option<usize>, EvaluationError> {
    match params.get("top_n") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .filter(|n| *n >= 1)
            .map(|n| Some(n as usize))
            .ok_or_else(|| EvaluationError::InvalidParameter {
                name: "top_n".into(),
                reason: "must be a positive integer".into(),
            }),
    }
}

fn text_param<'a>(params: &'a Params, name: &'static str) -> Result<&'a str, EvaluationError> {
    params
        .get(name)
        .and_then(Value::as_str)
        .ok_or(EvaluationError::MissingParameter(name))
}

fn mean_of_field(
    items: &[CandidateItem],
    field: &str,
) -> Result<DeterministicScore, EvaluationError> {
    let values: Vec<f64> = items.iter().filter_map(|i| i.numeric_field(field)).collect();
    if values.is_empty() {
        return Err(EvaluationError::NoData(format!(
            "no numeric '{field}' among {} items",
            items.len()
        )));
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    Ok(DeterministicScore {
        score: mean,
        explanation: format!(
            "avg({field}) over {}/{} items = {mean:.3}",
            values.len(),
            items.len()
        ),
    })
}

// =============================================================================
// Functions
// =============================================================================

fn avg_credibility(
    candidate: &CandidateResult,
    params: &Params,
) -> Result<DeterministicScore, EvaluationError> {
    mean_of_field(candidate.top(top_n(params)?), "credibility")
}

fn avg_field(
    candidate: &CandidateResult,
    params: &Params,
) -> Result<DeterministicScore, EvaluationError> {
    let field = text_param(params, "field")?;
    mean_of_field(candidate.top(top_n(params)?), field)
}

fn min_items(
    candidate: &CandidateResult,
    params: &Params,
) -> Result<DeterministicScore, EvaluationError> {
    let min = params
        .get("min")
        .and_then(Value::as_u64)
        .ok_or(EvaluationError::MissingParameter("min"))? as usize;
    let n = candidate.items.len();
    Ok(DeterministicScore {
        score: if n >= min { 1.0 } else { 0.0 },
        explanation: format!("items={n} min={min}"),
    })
}

fn distinct_values(
    candidate: &CandidateResult,
    params: &Params,
) -> Result<DeterministicScore, EvaluationError> {
    let field = text_param(params, "field")?;
    let items = candidate.top(top_n(params)?);
    let distinct: BTreeSet<String> = items
        .iter()
        .filter_map(|i| i.field(field))
        .filter(|v| !v.is_null())
        .map(|v| match v {
            Value::String(s) => s,
            other => other.to_string(),
        })
        .collect();
    Ok(DeterministicScore {
        score: distinct.len() as f64,
        explanation: format!("distinct({field}) over {} items = {}", items.len(), distinct.len()),
    })
}

fn field_coverage(
    candidate: &CandidateResult,
    params: &Params,
) -> Result<DeterministicScore, EvaluationError> {
    let field = text_param(params, "field")?;
    let items = candidate.top(top_n(params)?);
    if items.is_empty() {
        return Err(EvaluationError::NoData("candidate list is empty".into()));
    }
    let present = items
        .iter()
        .filter(|i| i.field(field).is_some_and(|v| !v.is_null()))
        .count();
    let coverage = present as f64 / items.len() as f64;
    Ok(DeterministicScore {
        score: coverage,
        explanation: format!("coverage({field}) = {present}/{}", items.len()),
    })
}

fn score_monotonic(
    candidate: &CandidateResult,
    _params: &Params,
) -> Result<DeterministicScore, EvaluationError> {
    let scores: Vec<f64> = candidate.items.iter().filter_map(|i| i.score).collect();
    if scores.len() != candidate.items.len() {
        return Err(EvaluationError::NoData(format!(
            "{} of {} items carry a score",
            scores.len(),
            candidate.items.len()
        )));
    }
    let violation = scores.windows(2).position(|w| w[1] > w[0]);
    Ok(match violation {
        None => DeterministicScore {
            score: 1.0,
            explanation: format!("non-increasing over {} items", scores.len()),
        },
        Some(idx) => DeterministicScore {
            score: 0.0,
            explanation: format!("rank {} scores above rank {}", idx + 2, idx + 1),
        },
    })
}
