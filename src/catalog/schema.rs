//! Declared input/output schemas for actions and triggers.
//!
//! Schemas are deliberately shallow: a list of top-level fields with a
//! kind and a required flag. Payloads stay schema-less JSON everywhere else.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// JSON kind a field is expected to hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    #[default]
    Any,
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
}

impl FieldKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,

    #[serde(default)]
    pub kind: FieldKind,

    #[serde(default)]
    pub required: bool,
}

impl FieldSchema {
    pub fn required(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
        }
    }
}

/// Top-level field list for a payload
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    pub fields: Vec<FieldSchema>,
}

impl Schema {
    pub fn new(fields: Vec<FieldSchema>) -> Self {
        Self { fields }
    }

    /// A schema with no declared fields accepts anything
    pub fn is_open(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    /// Check a payload against the declared fields.
    ///
    /// A null or absent required field is a violation; an absent optional
    /// field is fine; a present field of the wrong kind is a violation.
    pub fn check(&self, payload: &Value) -> Result<(), SchemaViolation> {
        for field in &self.fields {
            let value = payload.get(&field.name).filter(|v| !v.is_null());
            match value {
                None if field.required => {
                    return Err(SchemaViolation::MissingRequired {
                        field: field.name.clone(),
                    });
                }
                Some(v) if !field.kind.accepts(v) => {
                    return Err(SchemaViolation::WrongKind {
                        field: field.name.clone(),
                        expected: field.kind,
                    });
                }
                _ => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaViolation {
    #[error("required field '{field}' is missing")]
    MissingRequired { field: String },

    #[error("field '{field}' is not of kind {expected:?}")]
    WrongKind { field: String, expected: FieldKind },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn calendar_schema() -> Schema {
        Schema::new(vec![
            FieldSchema::required("family_id", FieldKind::String),
            FieldSchema::optional("color", FieldKind::String),
        ])
    }

    #[test]
    fn test_required_field_missing_or_null() {
        let schema = calendar_schema();
        assert!(matches!(
            schema.check(&json!({})),
            Err(SchemaViolation::MissingRequired { .. })
        ));
        assert!(matches!(
            schema.check(&json!({"family_id": null})),
            Err(SchemaViolation::MissingRequired { .. })
        ));
    }

    #[test]
    fn test_optional_null_is_accepted() {
        let schema = calendar_schema();
        assert!(schema.check(&json!({"family_id": "f1", "color": null})).is_ok());
    }

    #[test]
    fn test_wrong_kind() {
        let schema = calendar_schema();
        let result = schema.check(&json!({"family_id": 42}));
        assert_eq!(
            result,
            Err(SchemaViolation::WrongKind {
                field: "family_id".to_string(),
                expected: FieldKind::String,
            })
        );
    }

    #[test]
    fn test_integer_kind_rejects_floats() {
        let schema = Schema::new(vec![FieldSchema::required("count", FieldKind::Integer)]);
        assert!(schema.check(&json!({"count": 3})).is_ok());
        assert!(schema.check(&json!({"count": 3.5})).is_err());
    }
}
