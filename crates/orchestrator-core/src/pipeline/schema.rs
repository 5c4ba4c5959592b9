//! JSON Schema (draft 2020-12 subset) validation of step input/output
//! documents, per SPEC_FULL.md §4.4 ("not hand-rolled shape checks").

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("invalid json schema document: {0}")]
    InvalidSchema(String),

    #[error("document failed schema validation: {0}")]
    ValidationFailed(String),
}

/// A schema compiled once and reused for every step invocation that
/// references the same tool.
pub struct CompiledSchema {
    validator: jsonschema::Validator,
}

impl CompiledSchema {
    pub fn compile(schema: &Value) -> Result<Self, SchemaError> {
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| SchemaError::InvalidSchema(e.to_string()))?;
        Ok(Self { validator })
    }

    pub fn validate(&self, instance: &Value) -> Result<(), SchemaError> {
        let errors: Vec<String> = self
            .validator
            .iter_errors(instance)
            .map(|e| e.to_string())
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SchemaError::ValidationFailed(errors.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_document_passes() {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {"msg": {"type": "string"}},
            "required": ["msg"]
        });
        let compiled = CompiledSchema::compile(&schema).unwrap();
        assert!(compiled.validate(&serde_json::json!({"msg": "hi"})).is_ok());
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let schema = serde_json::json!({
            "type": "object",
            "required": ["msg"]
        });
        let compiled = CompiledSchema::compile(&schema).unwrap();
        assert!(compiled.validate(&serde_json::json!({})).is_err());
    }

    #[test]
    fn malformed_schema_document_is_rejected_at_compile_time() {
        let schema = serde_json::json!({"type": "not-a-real-type"});
        assert!(CompiledSchema::compile(&schema).is_err());
    }
}
