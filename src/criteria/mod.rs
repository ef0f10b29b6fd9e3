//! Criterion definitions.
//!
//! A criterion is either deterministic (a pure function over the candidate
//! result) or backend-judged (a request template sent to the judge panel).
//! External records are decoded into [`CriterionRecord`] and resolved once into
//! an immutable [`CriterionDefinition`] carrying a closed [`CriterionKind`].

pub mod deterministic;
pub mod registry;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigurationError;
use crate::judge::prompts::RequestTemplate;

pub use deterministic::{
    function_by_ref, DeterministicFunction, DeterministicScore, EvaluationError, Params,
    BUILTIN_FUNCTIONS,
};
pub use registry::CriterionRegistry;

/// Closed scoring interval `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Scale {
    pub min: f64,
    pub max: f64,
}

impl Scale {
    pub fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min < self.max
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CriterionKindTag {
    Deterministic,
    #[serde(alias = "backend_judged")]
    Backend,
}

impl CriterionKindTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CriterionKindTag::Deterministic => "deterministic",
            CriterionKindTag::Backend => "backend",
        }
    }
}

// =============================================================================
// External record
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TemplateRecord {
    #[serde(default)]
    pub system: Option<String>,
    pub user: String,
}

/// One criterion as it appears in a definitions file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CriterionRecord {
    pub id: String,
    pub kind: CriterionKindTag,
    pub scale: Scale,
    pub default_threshold: f64,
    #[serde(default)]
    pub request_template: Option<TemplateRecord>,
    #[serde(default)]
    pub function_ref: Option<String>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl CriterionRecord {
    pub fn deterministic(
        id: impl Into<String>,
        scale: Scale,
        default_threshold: f64,
        function_ref: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: CriterionKindTag::Deterministic,
            scale,
            default_threshold,
            request_template: None,
            function_ref: Some(function_ref.into()),
            parameters: Map::new(),
        }
    }

    pub fn backend(
        id: impl Into<String>,
        scale: Scale,
        default_threshold: f64,
        user_template: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: CriterionKindTag::Backend,
            scale,
            default_threshold,
            request_template: Some(TemplateRecord {
                system: None,
                user: user_template.into(),
            }),
            function_ref: None,
            parameters: Map::new(),
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// Resolved definition
// =============================================================================

#[derive(Debug, Clone)]
pub enum CriterionKind {
    Deterministic {
        function: &'static DeterministicFunction,
    },
    BackendJudged {
        template: RequestTemplate,
    },
}

impl CriterionKind {
    pub fn tag(&self) -> CriterionKindTag {
        match self {
            CriterionKind::Deterministic { .. } => CriterionKindTag::Deterministic,
            CriterionKind::BackendJudged { .. } => CriterionKindTag::Backend,
        }
    }
}

/// An immutable, validated criterion.
#[derive(Debug, Clone)]
pub struct CriterionDefinition {
    pub id: String,
    pub kind: CriterionKind,
    pub scale: Scale,
    pub default_threshold: f64,
    pub parameters: Map<String, Value>,
}

impl CriterionDefinition {
    pub fn from_record(record: CriterionRecord) -> Result<Self, ConfigurationError> {
        let id = record.id.trim().to_string();
        if id.is_empty() {
            return Err(ConfigurationError::malformed("<empty>", "id must not be empty"));
        }
        if !record.scale.is_valid() {
            return Err(ConfigurationError::malformed(
                &id,
                format!(
                    "scale [{}, {}] must be finite with min < max",
                    record.scale.min, record.scale.max
                ),
            ));
        }
        if !record.default_threshold.is_finite() || !record.scale.contains(record.default_threshold)
        {
            return Err(ConfigurationError::InvalidThreshold {
                id,
                reason: format!(
                    "default threshold {} is outside the scale",
                    record.default_threshold
                ),
            });
        }

        let kind = match record.kind {
            CriterionKindTag::Deterministic => {
                if record.request_template.is_some() {
                    return Err(ConfigurationError::malformed(
                        &id,
                        "deterministic criteria take no request_template",
                    ));
                }
                let name = record
                    .function_ref
                    .as_deref()
                    .ok_or_else(|| ConfigurationError::malformed(&id, "missing function_ref"))?;
                let function = function_by_ref(name).ok_or_else(|| {
                    let reason = format!("unresolvable function_ref '{name}'");
                    ConfigurationError::malformed(&id, reason)
                })?;
                function
                    .validate_params(&record.parameters)
                    .map_err(|reason| ConfigurationError::invalid_params(&id, reason))?;
                CriterionKind::Deterministic { function }
            }
            CriterionKindTag::Backend => {
                if record.function_ref.is_some() {
                    return Err(ConfigurationError::malformed(
                        &id,
                        "backend criteria take no function_ref",
                    ));
                }
                let raw = record
                    .request_template
                    .as_ref()
                    .ok_or_else(|| ConfigurationError::malformed(&id, "missing request_template"))?;
                let template = RequestTemplate::parse(raw.system.as_deref(), &raw.user)
                    .map_err(|reason| ConfigurationError::malformed(&id, reason))?;
                if let Some(missing) = template
                    .declared_placeholders()
                    .find(|p| !record.parameters.contains_key(*p))
                {
                    return Err(ConfigurationError::malformed(
                        &id,
                        format!("placeholder '{{{missing}}}' is not declared in parameters"),
                    ));
                }
                CriterionKind::BackendJudged { template }
            }
        };

        Ok(Self {
            id,
            kind,
            scale: record.scale,
            default_threshold: record.default_threshold,
            parameters: record.parameters,
        })
    }

    pub fn is_backend_judged(&self) -> bool {
        matches!(self.kind, CriterionKind::BackendJudged { .. })
    }

    /// Merge test-case overrides into the declared parameters.
    ///
    /// Overrides may only touch parameters the criterion knows about: the
    /// function schema for deterministic criteria, the declared parameter set
    /// for backend-judged ones.
    pub fn resolve_params(
        &self,
        overrides: Option<&Map<String, Value>>,
    ) -> Result<Map<String, Value>, ConfigurationError> {
        let mut merged = self.parameters.clone();
        let Some(overrides) = overrides else {
            return Ok(merged);
        };
        match &self.kind {
            CriterionKind::Deterministic { function } => {
                merged.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
                function
                    .validate_params(&merged)
                    .map_err(|reason| ConfigurationError::invalid_params(&self.id, reason))?;
            }
            CriterionKind::BackendJudged { .. } => {
                for (key, value) in overrides {
                    if !self.parameters.contains_key(key) {
                        return Err(ConfigurationError::invalid_params(
                            &self.id,
                            format!("unknown parameter '{key}'"),
                        ));
                    }
                    merged.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(merged)
    }

    /// Threshold actually applied: the override when present, else the default.
    pub fn effective_threshold(&self, override_: Option<f64>) -> Result<f64, ConfigurationError> {
        match override_ {
            None => Ok(self.default_threshold),
            Some(t) if t.is_finite() && self.scale.contains(t) => Ok(t),
            Some(t) => Err(ConfigurationError::InvalidThreshold {
                id: self.id.clone(),
                reason: format!(
                    "override {t} is outside the scale [{}, {}]",
                    self.scale.min, self.scale.max
                ),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_decodes_both_kind_spellings() {
        let a: CriterionRecord = serde_json::from_value(json!({
            "id": "relevance",
            "kind": "backend",
            "scale": {"min": 0, "max": 10},
            "default_threshold": 6,
            "request_template": {"user": "Grade relevance."}
        }))
        .unwrap();
        assert_eq!(a.kind, CriterionKindTag::Backend);

        let b: CriterionRecord = serde_json::from_value(json!({
            "id": "relevance",
            "kind": "backend_judged",
            "scale": {"min": 0, "max": 10},
            "default_threshold": 6
        }))
        .unwrap();
        assert_eq!(b.kind, CriterionKindTag::Backend);
    }

    #[test]
    fn rejects_inverted_scale_and_out_of_scale_default() {
        let inverted =
            CriterionRecord::deterministic("c", Scale::new(5.0, 1.0), 3.0, "avg_credibility");
        assert!(matches!(
            CriterionDefinition::from_record(inverted),
            Err(ConfigurationError::MalformedCriterion { .. })
        ));

        let outside =
            CriterionRecord::deterministic("c", Scale::new(1.0, 5.0), 7.0, "avg_credibility");
        assert!(matches!(
            CriterionDefinition::from_record(outside),
            Err(ConfigurationError::InvalidThreshold { .. })
        ));
    }

    #[test]
    fn backend_template_placeholders_must_be_declared() {
        let record =
            CriterionRecord::backend("tone", Scale::new(0.0, 10.0), 5.0, "Judge {aspect}.");
        assert!(CriterionDefinition::from_record(record.clone()).is_err());
        let def = CriterionDefinition::from_record(record.param("aspect", "tone")).unwrap();
        assert!(def.is_backend_judged());
    }

    #[test]
    fn overrides_are_validated_against_the_kind() {
        let det = CriterionDefinition::from_record(
            CriterionRecord::deterministic("cred", Scale::new(1.0, 5.0), 3.0, "avg_credibility")
                .param("top_n", 10),
        )
        .unwrap();
        let merged = det
            .resolve_params(json!({"top_n": 5}).as_object())
            .unwrap();
        assert_eq!(merged["top_n"], 5);
        assert!(det.resolve_params(json!({"top_n": -1}).as_object()).is_err());
        assert!(det.resolve_params(json!({"depth": 2}).as_object()).is_err());

        let judged = CriterionDefinition::from_record(
            CriterionRecord::backend("tone", Scale::new(0.0, 10.0), 5.0, "Judge {aspect}.")
                .param("aspect", "tone"),
        )
        .unwrap();
        assert!(judged
            .resolve_params(json!({"aspect": "clarity"}).as_object())
            .is_ok());
        assert!(matches!(
            judged.resolve_params(json!({"audience": "kids"}).as_object()),
            Err(ConfigurationError::InvalidParameters { .. })
        ));
    }

    #[test]
    fn threshold_override_must_lie_in_scale() {
        let def = CriterionDefinition::from_record(CriterionRecord::deterministic(
            "cred",
            Scale::new(1.0, 5.0),
            3.0,
            "avg_credibility",
        ))
        .unwrap();
        assert_eq!(def.effective_threshold(None).unwrap(), 3.0);
        assert_eq!(def.effective_threshold(Some(4.5)).unwrap(), 4.5);
        assert!(def.effective_threshold(Some(9.0)).is_err());
        assert!(def.effective_threshold(Some(f64::NAN)).is_err());
    }
}
