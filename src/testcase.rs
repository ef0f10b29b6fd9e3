//! Declarative test cases.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ConfigurationError;

/// A criterion referenced by a test case, with optional overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CriterionRef {
    pub id: String,
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub params: Option<Map<String, Value>>,
}

impl CriterionRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            threshold: None,
            params: None,
        }
    }

    pub fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }
}

/// How to obtain the candidate result from the subject under test.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CaseSetup {
    pub profile_ref: String,
    #[serde(default)]
    pub candidate_request: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestCase {
    pub test_id: String,
    pub name: String,
    pub criteria: Vec<CriterionRef>,
    pub setup: CaseSetup,
    /// Free-text guidance merged into backend-judged requests.
    #[serde(default)]
    pub guidance: Option<String>,
}

impl TestCase {
    pub fn from_json(raw: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(raw).map_err(|e| ConfigurationError::Decode(e.to_string()))
    }
}
