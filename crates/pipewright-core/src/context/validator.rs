//! JSON-Schema registry and validation for context values.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use jsonschema::Validator;
use pipewright_types::binary::{BinaryCategory, BINARY_TYPE_MARKER};
use pipewright_types::error::{ContextValidationError, SchemaViolation};
use serde_json::{json, Value};

/// Schema id under which the binary schema for `format` is registered.
pub fn binary_schema_id(format: &str) -> String {
    format!("binary:{}", format.to_ascii_lowercase())
}

/// Collect every violation of `instance` against a compiled schema.
pub fn collect_violations(validator: &Validator, instance: &Value) -> Vec<SchemaViolation> {
    validator
        .iter_errors(instance)
        .map(|error| SchemaViolation {
            path: error.instance_path.to_string(),
            message: error.to_string(),
        })
        .collect()
}

/// Build the descriptor schema for a binary format.
///
/// Format-specific metadata (dimensions, duration, sample rate and channels,
/// page count) becomes required according to the format's category.
pub fn binary_data_schema(format: &str) -> Value {
    let mut required = vec!["__type__", "format", "data_location"];
    required.extend(BinaryCategory::from_format(format).required_fields());

    json!({
        "type": "object",
        "required": required,
        "properties": {
            "__type__": { "const": BINARY_TYPE_MARKER },
            "format": { "type": "string", "minLength": 1 },
            "data_location": { "enum": ["inline", "referenced"] },
            "encoding": { "type": "string" },
            "data": { "type": "string" },
            "storage_reference": {
                "type": "object",
                "required": ["namespace", "key"],
                "properties": {
                    "namespace": { "type": "string" },
                    "key": { "type": "string" }
                }
            },
            "duration": { "type": "number", "minimum": 0 },
            "sample_rate": { "type": "integer", "minimum": 1 },
            "channels": { "type": "integer", "minimum": 1 },
            "dimensions": {
                "type": "object",
                "required": ["width", "height"],
                "properties": {
                    "width": { "type": "integer", "minimum": 0 },
                    "height": { "type": "integer", "minimum": 0 }
                }
            },
            "pages": { "type": "integer", "minimum": 1 }
        },
        "oneOf": [
            {
                "properties": { "data_location": { "const": "inline" } },
                "required": ["data", "encoding"],
                "not": { "required": ["storage_reference"] }
            },
            {
                "properties": { "data_location": { "const": "referenced" } },
                "required": ["storage_reference"],
                "not": { "required": ["data"] }
            }
        ]
    })
}

struct RegisteredSchema {
    raw: Value,
    compiled: Arc<Validator>,
}

/// Schema-id to JSON-Schema registry.
#[derive(Default)]
pub struct ContextValidator {
    schemas: RwLock<HashMap<String, RegisteredSchema>>,
}

impl ContextValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile and register `schema` under `id`, replacing any previous one.
    pub fn register_schema(&self, id: &str, schema: Value) -> Result<(), ContextValidationError> {
        let compiled =
            jsonschema::validator_for(&schema).map_err(|e| ContextValidationError::InvalidSchema {
                id: id.to_string(),
                message: e.to_string(),
            })?;
        self.schemas.write().expect("schema lock poisoned").insert(
            id.to_string(),
            RegisteredSchema {
                raw: schema,
                compiled: Arc::new(compiled),
            },
        );
        tracing::debug!(schema_id = id, "registered schema");
        Ok(())
    }

    /// Register the descriptor schema for `format` (idempotent). Returns its id.
    pub fn register_binary_data_schema(&self, format: &str) -> Result<String, ContextValidationError> {
        let id = binary_schema_id(format);
        if !self.has_schema(&id) {
            self.register_schema(&id, binary_data_schema(format))?;
        }
        Ok(id)
    }

    pub fn has_schema(&self, id: &str) -> bool {
        self.schemas
            .read()
            .expect("schema lock poisoned")
            .contains_key(id)
    }

    /// The registered schema document for `id`.
    pub fn schema(&self, id: &str) -> Option<Value> {
        self.schemas
            .read()
            .expect("schema lock poisoned")
            .get(id)
            .map(|s| s.raw.clone())
    }

    pub fn schema_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .schemas
            .read()
            .expect("schema lock poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Validate `data` against the schema registered as `schema_id`.
    pub fn validate_context(&self, data: &Value, schema_id: &str) -> Result<(), ContextValidationError> {
        let compiled = self
            .schemas
            .read()
            .expect("schema lock poisoned")
            .get(schema_id)
            .map(|s| Arc::clone(&s.compiled))
            .ok_or_else(|| ContextValidationError::UnknownSchema(schema_id.to_string()))?;

        let violations = collect_violations(&compiled, data);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(ContextValidationError::Invalid {
                schema_id: schema_id.to_string(),
                violations,
            })
        }
    }
}

impl std::fmt::Debug for ContextValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextValidator")
            .field("schemas", &self.schema_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipewright_types::binary::{BinaryDescriptor, BinaryMetadata, Dimensions, StorageReference};

    fn job_schema() -> Value {
        json!({
            "type": "object",
            "required": ["state"],
            "properties": { "state": { "type": "string" } }
        })
    }

    #[test]
    fn test_validate_against_registered_schema() {
        let validator = ContextValidator::new();
        validator.register_schema("job", job_schema()).unwrap();
        assert!(validator.validate_context(&json!({ "state": "queued" }), "job").is_ok());

        let err = validator
            .validate_context(&json!({ "state": 5 }), "job")
            .unwrap_err();
        match err {
            ContextValidationError::Invalid { schema_id, violations } => {
                assert_eq!(schema_id, "job");
                assert_eq!(violations.len(), 1);
                assert_eq!(violations[0].path, "/state");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_schema() {
        let validator = ContextValidator::new();
        let err = validator.validate_context(&json!({}), "nope").unwrap_err();
        assert!(matches!(err, ContextValidationError::UnknownSchema(id) if id == "nope"));
    }

    #[test]
    fn test_invalid_schema_rejected() {
        let validator = ContextValidator::new();
        let err = validator
            .register_schema("bad", json!({ "type": "not-a-type" }))
            .unwrap_err();
        assert!(matches!(err, ContextValidationError::InvalidSchema { .. }));
        assert!(!validator.has_schema("bad"));
    }

    #[test]
    fn test_binary_schema_requires_image_dimensions() {
        let validator = ContextValidator::new();
        let id = validator.register_binary_data_schema("png").unwrap();
        assert_eq!(id, "binary:png");

        let bare = BinaryDescriptor::inline("aGk=".to_string(), BinaryMetadata::new("png"));
        let bare = serde_json::to_value(bare).unwrap();
        assert!(validator.validate_context(&bare, &id).is_err());

        let mut metadata = BinaryMetadata::new("png");
        metadata.dimensions = Some(Dimensions { width: 4, height: 4 });
        let full = serde_json::to_value(BinaryDescriptor::inline("aGk=".to_string(), metadata)).unwrap();
        assert!(validator.validate_context(&full, &id).is_ok());
    }

    #[test]
    fn test_binary_schema_audio_fields() {
        let schema = binary_data_schema("wav");
        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&json!("sample_rate")));
        assert!(required.contains(&json!("channels")));
        assert!(!required.contains(&json!("dimensions")));
    }

    #[test]
    fn test_binary_schema_rejects_both_locations() {
        let validator = ContextValidator::new();
        let id = validator.register_binary_data_schema("bin").unwrap();
        let mut descriptor = serde_json::to_value(BinaryDescriptor::referenced(
            StorageReference {
                namespace: "media".to_string(),
                key: "clip".to_string(),
            },
            BinaryMetadata::new("bin"),
        ))
        .unwrap();
        assert!(validator.validate_context(&descriptor, &id).is_ok());

        descriptor["data"] = json!("aGk=");
        assert!(validator.validate_context(&descriptor, &id).is_err());
    }
}
