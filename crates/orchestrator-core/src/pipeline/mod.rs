//! Declarative pipeline document and its executor (SPEC_FULL.md §4.4).
//!
//! A [`Pipeline`] is the free-form JSON document stored as a `Task`'s
//! `payload`; [`executor::PipelineExecutor`] runs one attempt of it
//! against a [`tool_registry::ToolRegistry`] collaborator, applying
//! template resolution, schema validation, and conditional skipping
//! step by step.

pub mod executor;
pub mod schema;
pub mod template;
pub mod tool_registry;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use executor::{ExecutionOutcome, ExecutorError, PipelineExecutor};
pub use template::Context;
pub use tool_registry::{InMemoryToolRegistry, ToolContextHints, ToolDescriptor, ToolError, ToolRegistry};

/// The full pipeline document, matching `Task.payload`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Pipeline {
    #[serde(default)]
    pub params: Value,
    pub pipeline: Vec<Step>,
}

impl Pipeline {
    /// Validates the document shape the executor relies on: non-empty
    /// step ids and no duplicate `save_as` names across the whole
    /// pipeline (duplicates are also caught per-attempt by the
    /// executor, but surfacing it at task-creation time lets the API
    /// collaborator reject a malformed pipeline before it is ever run).
    pub fn validate_shape(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        for step in &self.pipeline {
            if step.id.trim().is_empty() {
                return Err("every step must have a non-empty id".to_string());
            }
            if let Some(save_as) = &step.save_as {
                if !seen.insert(save_as.clone()) {
                    return Err(format!("duplicate save_as '{save_as}' in pipeline"));
                }
            }
        }
        Ok(())
    }
}

/// One invocation of one tool inside a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: String,
    pub uses: String,
    #[serde(default)]
    pub with: Value,
    pub save_as: Option<String>,
    #[serde(rename = "if")]
    pub if_expr: Option<String>,
    pub timeout_seconds: Option<u64>,
}

impl Step {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_seconds.unwrap_or(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_the_documented_shape() {
        let doc = serde_json::json!({
            "params": {"name": "nightly"},
            "pipeline": [
                {"id": "s1", "uses": "echo", "with": {"msg": "hi"}, "save_as": "r"}
            ]
        });
        let pipeline: Pipeline = serde_json::from_value(doc).unwrap();
        assert_eq!(pipeline.pipeline.len(), 1);
        assert_eq!(pipeline.pipeline[0].uses, "echo");
        assert_eq!(pipeline.pipeline[0].timeout(), std::time::Duration::from_secs(30));
    }

    #[test]
    fn duplicate_save_as_fails_shape_validation() {
        let pipeline = Pipeline {
            params: Value::Null,
            pipeline: vec![
                Step {
                    id: "a".into(),
                    uses: "echo".into(),
                    with: Value::Null,
                    save_as: Some("r".into()),
                    if_expr: None,
                    timeout_seconds: None,
                },
                Step {
                    id: "b".into(),
                    uses: "echo".into(),
                    with: Value::Null,
                    save_as: Some("r".into()),
                    if_expr: None,
                    timeout_seconds: None,
                },
            ],
        };
        assert!(pipeline.validate_shape().is_err());
    }
}
