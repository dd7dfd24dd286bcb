use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Keyspace and table names accepted by the node.
static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]{1,48}$").expect("static regex"));

/// Shape of a single payload field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldKind {
    /// Any JSON string.
    String,
    /// Keyspace or table name.
    Identifier,
    /// JSON boolean.
    Bool,
    /// Non-negative JSON integer.
    UnsignedInt,
    /// Array of keyspace or table names.
    IdentifierList,
    /// Array of strings.
    StringList,
    /// Array of `{ "start": string, "end": string }` objects.
    TokenRangeList,
}

impl FieldKind {
    fn check(self, value: &Value) -> Result<(), String> {
        match self {
            FieldKind::String => value
                .as_str()
                .map(|_| ())
                .ok_or_else(|| "expected a string".to_string()),
            FieldKind::Identifier => check_identifier(value),
            FieldKind::Bool => value
                .as_bool()
                .map(|_| ())
                .ok_or_else(|| "expected a boolean".to_string()),
            FieldKind::UnsignedInt => value
                .as_u64()
                .map(|_| ())
                .ok_or_else(|| "expected a non-negative integer".to_string()),
            FieldKind::IdentifierList => each_item(value, check_identifier),
            FieldKind::StringList => each_item(value, |item| {
                item.as_str()
                    .map(|_| ())
                    .ok_or_else(|| "expected a string".to_string())
            }),
            FieldKind::TokenRangeList => each_item(value, |item| {
                let has = |key: &str| item.get(key).and_then(Value::as_str).is_some();
                if has("start") && has("end") {
                    Ok(())
                } else {
                    Err("expected an object with string fields start and end".to_string())
                }
            }),
        }
    }
}

fn check_identifier(value: &Value) -> Result<(), String> {
    match value.as_str() {
        Some(name) if IDENTIFIER.is_match(name) => Ok(()),
        Some(name) => Err(format!(
            "'{name}' is not a valid name (1-48 characters of [A-Za-z0-9_])"
        )),
        None => Err("expected a string".to_string()),
    }
}

fn each_item(value: &Value, check: impl Fn(&Value) -> Result<(), String>) -> Result<(), String> {
    let items = value
        .as_array()
        .ok_or_else(|| "expected an array".to_string())?;
    for (index, item) in items.iter().enumerate() {
        check(item).map_err(|e| format!("item {index}: {e}"))?;
    }
    Ok(())
}

/// Single field definition within a request schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldDef {
    /// Wire name of the field.
    pub name: &'static str,
    pub kind: FieldKind,
    /// Whether the field must be present and non-null.
    pub required: bool,
}

/// Field-level validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Offending field, empty when the error concerns the whole payload.
    pub field: String,
    pub message: String,
}

impl FieldError {
    #[must_use]
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Result of validating a payload against a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    /// The payload conforms to the schema.
    Valid,
    /// The payload violates one or more schema constraints.
    Invalid { errors: Vec<FieldError> },
}

impl ValidationResult {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationResult::Valid)
    }
}

/// Declarative description of an operation type's payload.
///
/// Payloads must be JSON objects; unknown fields are rejected so that typos
/// never silently fall back to defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestSchema {
    fields: Vec<FieldDef>,
}

impl RequestSchema {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn required(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.fields.push(FieldDef {
            name,
            kind,
            required: true,
        });
        self
    }

    #[must_use]
    pub fn optional(mut self, name: &'static str, kind: FieldKind) -> Self {
        self.fields.push(FieldDef {
            name,
            kind,
            required: false,
        });
        self
    }

    #[must_use]
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Checks `raw` field by field, collecting every violation.
    #[must_use]
    pub fn validate(&self, raw: &Value) -> ValidationResult {
        let Some(object) = raw.as_object() else {
            return ValidationResult::Invalid {
                errors: vec![FieldError::new("", "payload must be a JSON object")],
            };
        };

        let mut errors = Vec::new();
        for def in &self.fields {
            match object.get(def.name) {
                None | Some(Value::Null) => {
                    if def.required {
                        errors.push(FieldError::new(def.name, "required field is missing"));
                    }
                }
                Some(value) => {
                    if let Err(message) = def.kind.check(value) {
                        errors.push(FieldError::new(def.name, message));
                    }
                }
            }
        }
        for key in object.keys() {
            if !self.fields.iter().any(|def| def.name == key) {
                errors.push(FieldError::new(key.as_str(), "unknown field"));
            }
        }

        if errors.is_empty() {
            ValidationResult::Valid
        } else {
            ValidationResult::Invalid { errors }
        }
    }
}

/// Whether `name` is an acceptable keyspace or table name.
#[must_use]
pub fn is_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}
