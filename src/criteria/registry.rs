//! Immutable criterion registry, loaded once at startup.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::{CriterionDefinition, CriterionRecord};
use crate::error::ConfigurationError;

/// Read-only map of validated criteria, safe to share across concurrent runs.
#[derive(Debug, Clone, Default)]
pub struct CriterionRegistry {
    by_id: HashMap<String, Arc<CriterionDefinition>>,
    order: Vec<String>,
}

impl CriterionRegistry {
    /// Validate every record; any malformed or duplicated definition fails the load.
    pub fn load(records: Vec<CriterionRecord>) -> Result<Self, ConfigurationError> {
        let mut by_id = HashMap::with_capacity(records.len());
        let mut order = Vec::with_capacity(records.len());
        for record in records {
            let definition = CriterionDefinition::from_record(record)?;
            if by_id.contains_key(&definition.id) {
                return Err(ConfigurationError::DuplicateCriterion(definition.id));
            }
            order.push(definition.id.clone());
            by_id.insert(definition.id.clone(), Arc::new(definition));
        }
        info!(criteria = order.len(), "criterion registry loaded");
        Ok(Self { by_id, order })
    }

    /// Load from a JSON array of criterion records.
    pub fn from_json(raw: &str) -> Result<Self, ConfigurationError> {
        let records: Vec<CriterionRecord> =
            serde_json::from_str(raw).map_err(|e| ConfigurationError::Decode(e.to_string()))?;
        Self::load(records)
    }

    pub fn lookup(&self, id: &str) -> Result<Arc<CriterionDefinition>, ConfigurationError> {
        self.by_id
            .get(id)
            .cloned()
            .ok_or_else(|| ConfigurationError::UnknownCriterion(id.to_string()))
    }

    /// Criterion ids in load order.
    pub fn ids(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::{CriterionKindTag, Scale};

    const DEFINITIONS: &str = r#"[
        {
            "id": "relevance",
            "kind": "backend",
            "scale": {"min": 0, "max": 10},
            "default_threshold": 6.0,
            "request_template": {"user": "How relevant is the list to {topic}?"},
            "parameters": {"topic": "the query"}
        },
        {
            "id": "avg_credibility",
            "kind": "deterministic",
            "scale": {"min": 1, "max": 5},
            "default_threshold": 3.0,
            "function_ref": "avg_credibility",
            "parameters": {"top_n": 5}
        }
    ]"#;

    #[test]
    fn loads_and_looks_up_definitions() {
        let registry = CriterionRegistry::from_json(DEFINITIONS).unwrap();
        assert_eq!(registry.ids(), ["relevance", "avg_credibility"]);
        let cred = registry.lookup("avg_credibility").unwrap();
        assert_eq!(cred.kind.tag(), CriterionKindTag::Deterministic);
        assert_eq!(cred.scale, Scale::new(1.0, 5.0));
        assert!(matches!(
            registry.lookup("freshness"),
            Err(ConfigurationError::UnknownCriterion(id)) if id == "freshness"
        ));
    }

    #[test]
    fn duplicate_ids_fail_the_load() {
        let record =
            CriterionRecord::deterministic("cred", Scale::new(1.0, 5.0), 3.0, "avg_credibility");
        let err = CriterionRegistry::load(vec![record.clone(), record]).unwrap_err();
        assert_eq!(err, ConfigurationError::DuplicateCriterion("cred".into()));
    }

    #[test]
    fn unresolvable_function_fails_the_load() {
        let record =
            CriterionRecord::deterministic("x", Scale::new(0.0, 1.0), 0.5, "no_such_function");
        assert!(matches!(
            CriterionRegistry::load(vec![record]),
            Err(ConfigurationError::MalformedCriterion { .. })
        ));
    }

    #[test]
    fn malformed_template_fails_the_load() {
        let record = CriterionRecord::backend("x", Scale::new(0.0, 10.0), 5.0, "Judge {unclosed");
        assert!(CriterionRegistry::load(vec![record]).is_err());
    }
}
