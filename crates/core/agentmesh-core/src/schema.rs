//! Declarative input/output schemas and their validator.
//!
//! Schemas cover the subset of JSON schema that tool descriptors use:
//! a primitive `type`, the `required` keys of an object and typed
//! `properties`. Rules are plain data so they travel with tool discovery.

use crate::error::{CoreError, CoreResult};
use crate::message::json_kind;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Primitive JSON types a schema can require
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    /// JSON object
    #[default]
    Object,
    /// JSON string
    String,
    /// Any JSON number
    Number,
    /// Whole JSON number
    Integer,
    /// JSON boolean
    Boolean,
    /// JSON array
    Array,
    /// JSON null
    Null,
}

impl SchemaType {
    /// Check whether a value has this type
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            SchemaType::Object => value.is_object(),
            SchemaType::String => value.is_string(),
            SchemaType::Number => value.is_number(),
            SchemaType::Integer => value.is_i64() || value.is_u64(),
            SchemaType::Boolean => value.is_boolean(),
            SchemaType::Array => value.is_array(),
            SchemaType::Null => value.is_null(),
        }
    }
}

impl fmt::Display for SchemaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchemaType::Object => "object",
            SchemaType::String => "string",
            SchemaType::Number => "number",
            SchemaType::Integer => "integer",
            SchemaType::Boolean => "boolean",
            SchemaType::Array => "array",
            SchemaType::Null => "null",
        };
        f.write_str(name)
    }
}

/// Schema describing tool input or output
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Schema {
    /// Expected type of the value
    #[serde(rename = "type", default)]
    pub schema_type: SchemaType,
    /// Keys that must be present when the value is an object
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<String>,
    /// Per-key schemas applied to present keys
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Schema>,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Schema {
    /// Object schema with no constraints
    pub fn object() -> Self {
        Self::default()
    }

    /// Schema for a single primitive type
    pub fn of(schema_type: SchemaType) -> Self {
        Self {
            schema_type,
            ..Self::default()
        }
    }

    /// Declare an optional property
    pub fn property(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    /// Declare a required property
    pub fn required_property(mut self, name: impl Into<String>, schema: Schema) -> Self {
        let name = name.into();
        if !self.required.contains(&name) {
            self.required.push(name.clone());
        }
        self.properties.insert(name, schema);
        self
    }

    /// Attach a description
    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Validate a value against this schema
    pub fn validate(&self, value: &Value) -> CoreResult<()> {
        SchemaValidator::default().validate(self, value)
    }
}

/// Walks a [`Schema`] against a value
#[derive(Debug, Clone, Copy)]
pub struct SchemaValidator {
    max_depth: usize,
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self { max_depth: 32 }
    }
}

impl SchemaValidator {
    /// Validator that refuses schemas nested deeper than `max_depth`
    pub fn with_max_depth(max_depth: usize) -> Self {
        Self { max_depth }
    }

    /// Validate `value` against `schema`, naming the offending field on failure
    pub fn validate(&self, schema: &Schema, value: &Value) -> CoreResult<()> {
        self.check(schema, value, "$", 0)
    }

    fn check(&self, schema: &Schema, value: &Value, path: &str, depth: usize) -> CoreResult<()> {
        if depth > self.max_depth {
            return Err(CoreError::validation(format!(
                "schema nesting at '{path}' exceeds depth {}",
                self.max_depth
            )));
        }

        if !schema.schema_type.matches(value) {
            return Err(CoreError::validation(format!(
                "'{path}' must be of type {}, got {}",
                schema.schema_type,
                json_kind(value)
            )));
        }

        let Value::Object(map) = value else {
            return Ok(());
        };

        for field in &schema.required {
            if !map.contains_key(field) {
                return Err(CoreError::validation(format!(
                    "missing required field '{field}' at '{path}'"
                )));
            }
        }

        for (name, property) in &schema.properties {
            if let Some(child) = map.get(name) {
                self.check(property, child, &format!("{path}.{name}"), depth + 1)?;
            }
        }
        Ok(())
    }
}
