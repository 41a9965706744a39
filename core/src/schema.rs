//! Declarative message schemas.
//!
//! Consumers describe the payload they require as data: a list of fields
//! with a kind and a required flag. The pipeline validates the `data` object
//! of every delivery against the consumer's schema before the handler runs;
//! a violation is deterministic and routes the message to the dead-letter
//! queue without requeue.
//!
//! # Example
//!
//! ```
//! use souk_core::schema::{FieldKind, MessageSchema};
//! use serde_json::json;
//!
//! let schema = MessageSchema::new("order.created")
//!     .field("orderId", FieldKind::String)
//!     .field("products", FieldKind::Array)
//!     .optional_field("metadata", FieldKind::Object);
//!
//! assert!(schema
//!     .validate(&json!({"orderId": "o-1", "products": []}))
//!     .is_empty());
//! ```

use serde_json::Value;
use std::fmt;

/// JSON kinds a field may require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// JSON string.
    String,
    /// JSON number (integer or float).
    Number,
    /// JSON boolean.
    Bool,
    /// JSON array.
    Array,
    /// JSON object.
    Object,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::Array => value.is_array(),
            Self::Object => value.is_object(),
        }
    }

    const fn name(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

/// One field requirement.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    /// Field name within the payload object.
    pub name: &'static str,
    /// Required JSON kind.
    pub kind: FieldKind,
    /// Whether absence is a violation.
    pub required: bool,
}

/// A diagnostic produced by validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaViolation {
    /// The payload is not a JSON object at all.
    NotAnObject,
    /// A required field is absent.
    MissingField {
        /// Name of the absent field.
        field: &'static str,
    },
    /// A present field has the wrong kind.
    WrongKind {
        /// Name of the offending field.
        field: &'static str,
        /// The kind the schema requires.
        expected: FieldKind,
    },
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAnObject => write!(f, "payload is not an object"),
            Self::MissingField { field } => write!(f, "missing required field `{field}`"),
            Self::WrongKind { field, expected } => {
                write!(f, "field `{field}` is not a {}", expected.name())
            }
        }
    }
}

/// The payload contract of one event type.
#[derive(Debug, Clone)]
pub struct MessageSchema {
    /// The event type this schema describes (for diagnostics).
    pub event_type: &'static str,
    fields: Vec<FieldSpec>,
}

impl MessageSchema {
    /// Empty schema for an event type.
    #[must_use]
    pub const fn new(event_type: &'static str) -> Self {
        Self {
            event_type,
            fields: Vec::new(),
        }
    }

    /// Add a required field.
    #[must_use]
    pub fn field(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name,
            kind,
            required: true,
        });
        self
    }

    /// Add an optional field (kind is still checked when present).
    #[must_use]
    pub fn optional_field(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name,
            kind,
            required: false,
        });
        self
    }

    /// Validate a payload, returning every violation found.
    ///
    /// An empty vector means the payload satisfies the schema.
    #[must_use]
    pub fn validate(&self, payload: &Value) -> Vec<SchemaViolation> {
        let Some(object) = payload.as_object() else {
            return vec![SchemaViolation::NotAnObject];
        };

        let mut violations = Vec::new();
        for spec in &self.fields {
            match object.get(spec.name) {
                None | Some(Value::Null) => {
                    if spec.required {
                        violations.push(SchemaViolation::MissingField { field: spec.name });
                    }
                }
                Some(value) => {
                    if !spec.kind.matches(value) {
                        violations.push(SchemaViolation::WrongKind {
                            field: spec.name,
                            expected: spec.kind,
                        });
                    }
                }
            }
        }
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_created() -> MessageSchema {
        MessageSchema::new("order.created")
            .field("orderId", FieldKind::String)
            .field("products", FieldKind::Array)
            .optional_field("metadata", FieldKind::Object)
    }

    #[test]
    fn valid_payload_has_no_violations() {
        let violations = order_created().validate(&json!({
            "orderId": "o-1",
            "products": [{"productId": "p-1", "quantity": 1}],
        }));
        assert!(violations.is_empty());
    }

    #[test]
    fn missing_required_field_is_reported() {
        let violations = order_created().validate(&json!({"products": []}));
        assert_eq!(
            violations,
            vec![SchemaViolation::MissingField { field: "orderId" }]
        );
    }

    #[test]
    fn wrong_kind_is_reported_per_field() {
        let violations = order_created().validate(&json!({
            "orderId": 42,
            "products": "not-an-array",
        }));
        assert_eq!(violations.len(), 2);
        assert!(violations.iter().all(|v| matches!(v, SchemaViolation::WrongKind { .. })));
    }

    #[test]
    fn optional_field_absent_is_fine_but_wrong_kind_is_not() {
        let schema = order_created();
        assert!(schema.validate(&json!({"orderId": "o", "products": []})).is_empty());

        let violations = schema.validate(&json!({
            "orderId": "o",
            "products": [],
            "metadata": "seckill",
        }));
        assert_eq!(
            violations,
            vec![SchemaViolation::WrongKind {
                field: "metadata",
                expected: FieldKind::Object,
            }]
        );
    }

    #[test]
    fn null_counts_as_absent() {
        let violations = order_created().validate(&json!({
            "orderId": null,
            "products": [],
        }));
        assert_eq!(
            violations,
            vec![SchemaViolation::MissingField { field: "orderId" }]
        );
    }

    #[test]
    fn non_object_payload() {
        assert_eq!(
            order_created().validate(&json!([1, 2, 3])),
            vec![SchemaViolation::NotAnObject]
        );
    }

    #[test]
    fn violations_render_for_dlq_diagnostics() {
        let text = SchemaViolation::WrongKind {
            field: "quantity",
            expected: FieldKind::Number,
        }
        .to_string();
        assert_eq!(text, "field `quantity` is not a number");
    }
}
