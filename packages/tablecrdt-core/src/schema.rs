use std::collections::BTreeMap;

use serde_json::Value;

/// A reconstructed row: field name to cell value, `id` included.
pub type RowData = serde_json::Map<String, Value>;

/// Why a reconstructed row failed validation. Carried in `Invalid` results and
/// surfaced to diagnostics; never thrown.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("{}", .messages.join("; "))]
pub struct ValidationError {
    pub messages: Vec<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
        }
    }
}

/// External schema collaborator. Called on every row reconstruction; assumed
/// immutable for the duration of one call. Validation never mutates stored
/// data; defaults are applied to the reconstructed copy only.
pub trait Schema: Send {
    fn validate(&self, row: &RowData) -> Result<(), ValidationError>;

    /// Fill externally-defined defaults into a reconstructed row before
    /// validation. The default implementation applies none.
    fn with_defaults(&self, row: RowData) -> RowData {
        row
    }
}

/// Cell types the basic field-map schema understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Integer,
    Real,
    Bool,
    Json,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::Text => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Real => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Json => true,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FieldType::Text => "text",
            FieldType::Integer => "integer",
            FieldType::Real => "real",
            FieldType::Bool => "bool",
            FieldType::Json => "json",
        }
    }
}

#[derive(Clone, Debug)]
pub struct FieldSpec {
    pub field_type: FieldType,
    pub required: bool,
    pub default: Option<Value>,
}

/// Straightforward per-table field-type map. `id` is always a required text
/// field and does not need declaring. Fields not declared here are a
/// validation error rather than being silently dropped.
#[derive(Clone, Debug, Default)]
pub struct TableSchema {
    fields: BTreeMap<String, FieldSpec>,
}

impl TableSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                field_type,
                required: false,
                default: None,
            },
        );
        self
    }

    pub fn required(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                field_type,
                required: true,
                default: None,
            },
        );
        self
    }

    pub fn with_default(
        mut self,
        name: impl Into<String>,
        field_type: FieldType,
        default: Value,
    ) -> Self {
        self.fields.insert(
            name.into(),
            FieldSpec {
                field_type,
                required: false,
                default: Some(default),
            },
        );
        self
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(name, spec)| (name.as_str(), spec))
    }
}

impl Schema for TableSchema {
    fn validate(&self, row: &RowData) -> Result<(), ValidationError> {
        let mut messages = Vec::new();

        match row.get("id") {
            None => messages.push("missing required field `id`".to_string()),
            Some(Value::String(_)) => {}
            Some(_) => messages.push("field `id` must be text".to_string()),
        }

        for (name, spec) in &self.fields {
            match row.get(name) {
                None => {
                    if spec.required {
                        messages.push(format!("missing required field `{name}`"));
                    }
                }
                Some(value) => {
                    if !spec.field_type.matches(value) {
                        messages.push(format!(
                            "field `{name}` must be {}",
                            spec.field_type.name()
                        ));
                    }
                }
            }
        }

        for name in row.keys() {
            if name != "id" && !self.fields.contains_key(name) {
                messages.push(format!("unknown field `{name}`"));
            }
        }

        if messages.is_empty() {
            Ok(())
        } else {
            Err(ValidationError { messages })
        }
    }

    fn with_defaults(&self, mut row: RowData) -> RowData {
        for (name, spec) in &self.fields {
            if let Some(default) = &spec.default {
                row.entry(name.clone()).or_insert_with(|| default.clone());
            }
        }
        row
    }
}
