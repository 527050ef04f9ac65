//! Payload schemas.
//!
//! The bus only depends on [`SchemaValidator`]; [`SchemaRegistry`] is the
//! in-process implementation used by default. A validator must be pure: the
//! same `(event_type, data)` always yields the same verdict, which is what
//! makes dead-lettering a validation failure (instead of retrying it) safe.

use std::collections::BTreeMap;

use serde_json::Value as JsonValue;

/// Reasons a payload was rejected. Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(Vec<String>);

impl ValidationErrors {
    pub fn new(messages: Vec<String>) -> Self {
        debug_assert!(!messages.is_empty());
        Self(messages)
    }

    pub fn single(message: impl Into<String>) -> Self {
        Self(vec![message.into()])
    }

    pub fn messages(&self) -> &[String] {
        &self.0
    }
}

impl core::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0.join(", "))
    }
}

impl std::error::Error for ValidationErrors {}

/// Schema lookup + payload check, keyed by event type.
pub trait SchemaValidator: Send + Sync {
    /// Validate `data` against the schema registered for `event_type`.
    ///
    /// Unknown event types are invalid.
    fn validate_event(&self, event_type: &str, data: &JsonValue) -> Result<(), ValidationErrors>;
}

impl<V> SchemaValidator for std::sync::Arc<V>
where
    V: SchemaValidator + ?Sized,
{
    fn validate_event(&self, event_type: &str, data: &JsonValue) -> Result<(), ValidationErrors> {
        (**self).validate_event(event_type, data)
    }
}

/// JSON kind expected for a payload field.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Any,
}

impl FieldKind {
    fn matches(&self, value: &JsonValue) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Object => value.is_object(),
            FieldKind::Array => value.is_array(),
            FieldKind::Any => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldKind::String => "string",
            FieldKind::Number => "number",
            FieldKind::Integer => "integer",
            FieldKind::Boolean => "boolean",
            FieldKind::Object => "object",
            FieldKind::Array => "array",
            FieldKind::Any => "any",
        }
    }
}

fn kind_of(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[derive(Debug, Clone)]
struct FieldRule {
    name: String,
    kind: FieldKind,
    required: bool,
    allowed: Option<Vec<String>>,
}

/// Shape of one event type's payload: a JSON object with typed fields.
#[derive(Debug, Clone, Default)]
pub struct EventSchema {
    fields: Vec<FieldRule>,
}

impl EventSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn required(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldRule {
            name: name.into(),
            kind,
            required: true,
            allowed: None,
        });
        self
    }

    pub fn optional(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldRule {
            name: name.into(),
            kind,
            required: false,
            allowed: None,
        });
        self
    }

    /// Required string field restricted to a fixed set of values.
    pub fn one_of(mut self, name: impl Into<String>, values: &[&str]) -> Self {
        self.fields.push(FieldRule {
            name: name.into(),
            kind: FieldKind::String,
            required: true,
            allowed: Some(values.iter().map(|v| v.to_string()).collect()),
        });
        self
    }

    /// Check a payload; returns every violation, not just the first.
    pub fn check(&self, data: &JsonValue) -> Vec<String> {
        let Some(object) = data.as_object() else {
            return vec![format!("payload must be an object, got {}", kind_of(data))];
        };

        let mut errors = Vec::new();
        for rule in &self.fields {
            match object.get(&rule.name) {
                None | Some(JsonValue::Null) if rule.required => {
                    errors.push(format!("data.{} is required (schema validation)", rule.name));
                }
                None | Some(JsonValue::Null) => {}
                Some(value) if !rule.kind.matches(value) => {
                    errors.push(format!(
                        "data.{} must be {}, got {}",
                        rule.name,
                        rule.kind.name(),
                        kind_of(value)
                    ));
                }
                Some(value) => {
                    if let (Some(allowed), Some(s)) = (&rule.allowed, value.as_str()) {
                        if !allowed.iter().any(|a| a == s) {
                            errors.push(format!(
                                "data.{} must be one of [{}], got \"{}\"",
                                rule.name,
                                allowed.join(", "),
                                s
                            ));
                        }
                    }
                }
            }
        }
        errors
    }
}

/// In-process schema registry.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<String, EventSchema>,
}

impl SchemaRegistry {
    /// Empty registry: every event type is unknown.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the work-order, work-item, attempt and system
    /// event types.
    pub fn with_builtin_schemas() -> Self {
        let mut registry = Self::new();
        for (event_type, schema) in builtin_schemas() {
            registry.register(event_type, schema);
        }
        registry
    }

    /// Register (or replace) the schema for an event type.
    pub fn register(&mut self, event_type: impl Into<String>, schema: EventSchema) -> &mut Self {
        self.schemas.insert(event_type.into(), schema);
        self
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.schemas.contains_key(event_type)
    }

    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }
}

impl SchemaValidator for SchemaRegistry {
    fn validate_event(&self, event_type: &str, data: &JsonValue) -> Result<(), ValidationErrors> {
        let Some(schema) = self.schemas.get(event_type) else {
            return Err(ValidationErrors::single(format!(
                "no schema registered for event type \"{event_type}\" (schema validation)"
            )));
        };

        let errors = schema.check(data);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationErrors::new(errors))
        }
    }
}

pub mod event_types {
    pub const WORK_ORDER_CREATED: &str = "work_order.created";
    pub const WORK_ITEM_CREATED: &str = "work_item.created";
    pub const ATTEMPT_FAILED: &str = "attempt.failed";
    pub const SYSTEM_HEALTH_CHECK: &str = "system.health_check";
    pub const SYSTEM_SHUTDOWN: &str = "system.shutdown";
}

fn builtin_schemas() -> Vec<(&'static str, EventSchema)> {
    use event_types::*;
    use FieldKind::*;

    vec![
        (
            WORK_ORDER_CREATED,
            EventSchema::new()
                .required("workOrderId", String)
                .required("title", String)
                .optional("metadata", Object),
        ),
        (
            WORK_ITEM_CREATED,
            EventSchema::new()
                .required("workItemId", String)
                .required("workOrderId", String),
        ),
        (
            ATTEMPT_FAILED,
            EventSchema::new()
                .required("attemptId", String)
                .required("workItemId", String)
                .required("error", String)
                .optional("retryable", Boolean),
        ),
        (
            SYSTEM_HEALTH_CHECK,
            EventSchema::new()
                .required("service", String)
                .one_of("status", &["healthy", "degraded", "unhealthy"])
                .required("checks", Object),
        ),
        (
            SYSTEM_SHUTDOWN,
            EventSchema::new()
                .required("service", String)
                .optional("reason", String),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn health_check_with_checks_is_valid() {
        let registry = SchemaRegistry::with_builtin_schemas();
        let data = json!({"service": "bus", "status": "healthy", "checks": {}});
        assert!(registry.validate_event(event_types::SYSTEM_HEALTH_CHECK, &data).is_ok());
    }

    #[test]
    fn health_check_without_checks_is_rejected() {
        let registry = SchemaRegistry::with_builtin_schemas();
        let data = json!({"service": "bus", "status": "healthy"});
        let err = registry
            .validate_event(event_types::SYSTEM_HEALTH_CHECK, &data)
            .unwrap_err();
        assert_eq!(err.messages(), ["data.checks is required (schema validation)"]);
    }

    #[test]
    fn unknown_type_is_rejected() {
        let registry = SchemaRegistry::with_builtin_schemas();
        let err = registry.validate_event("nope.nothing", &json!({})).unwrap_err();
        assert!(err.to_string().contains("no schema registered"));
    }

    #[test]
    fn reports_every_violation() {
        let registry = SchemaRegistry::with_builtin_schemas();
        let data = json!({"service": 7, "status": "on fire"});
        let err = registry
            .validate_event(event_types::SYSTEM_HEALTH_CHECK, &data)
            .unwrap_err();

        assert_eq!(err.messages().len(), 3);
        assert!(err.messages()[0].contains("must be string, got number"));
        assert!(err.messages()[1].contains("must be one of"));
    }

    #[test]
    fn non_object_payload_is_rejected() {
        let schema = EventSchema::new().optional("x", FieldKind::Any);
        assert_eq!(schema.check(&json!([1, 2])), ["payload must be an object, got array"]);
    }

    proptest! {
        /// Property: repeated checks of the same payload agree.
        #[test]
        fn validation_is_deterministic(service in "[a-z]{0,8}", with_checks in any::<bool>()) {
            let registry = SchemaRegistry::with_builtin_schemas();
            let mut data = json!({"service": service, "status": "healthy"});
            if with_checks {
                data["checks"] = json!({});
            }
            let first = registry.validate_event(event_types::SYSTEM_HEALTH_CHECK, &data);
            let second = registry.validate_event(event_types::SYSTEM_HEALTH_CHECK, &data);
            prop_assert_eq!(first.is_ok(), with_checks);
            prop_assert_eq!(first, second);
        }
    }
}
