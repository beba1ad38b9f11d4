//! Statically declared input schemas.
//!
//! A route may declare the shape of its input. The dispatcher decodes the
//! envelope body through the schema before the handler runs, rejecting
//! unknown fields, missing required fields and type mismatches.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Type accepted for a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    /// Accepts integers as well.
    Float,
    Bool,
    Bytes,
    Map,
    List,
    /// Any value, including null.
    Any,
}

impl FieldType {
    fn accepts(self, value: &Value) -> bool {
        matches!(
            (self, value),
            (FieldType::Any, _)
                | (FieldType::String, Value::String(_))
                | (FieldType::Int, Value::Int(_))
                | (FieldType::Float, Value::Float(_) | Value::Int(_))
                | (FieldType::Bool, Value::Bool(_))
                | (FieldType::Bytes, Value::Bytes(_))
                | (FieldType::Map, Value::Map(_))
                | (FieldType::List, Value::Array(_))
        )
    }
}

/// Single field definition within a schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Name of the field.
    pub name: String,
    pub field_type: FieldType,
    /// Whether the field must be present in every record.
    pub required: bool,
}

impl FieldDef {
    #[must_use]
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    #[must_use]
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }
}

/// Why a body could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("{schema} expects a map, got {found}")]
    NotAMap { schema: String, found: &'static str },
    #[error("Missing {0}")]
    MissingField(String),
    #[error("Unknown field {0}")]
    UnknownField(String),
    #[error("Field {field} must be {expected:?}, got {found}")]
    WrongType {
        field: String,
        expected: FieldType,
        found: &'static str,
    },
}

/// Declared input shape of a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSchema {
    /// Display name used in error messages.
    pub name: String,
    pub fields: Vec<FieldDef>,
}

impl InputSchema {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Adds a field definition.
    #[must_use]
    pub fn field(mut self, def: FieldDef) -> Self {
        self.fields.push(def);
        self
    }

    fn lookup(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Decodes a body into a validated record.
    ///
    /// Optional fields that are present with a null value are treated as
    /// absent.
    ///
    /// # Errors
    ///
    /// Returns the first violation found: a non-map body, an unknown field,
    /// a missing required field or a type mismatch.
    pub fn decode(&self, body: &Value) -> Result<Record, SchemaError> {
        let Value::Map(map) = body else {
            return Err(SchemaError::NotAMap {
                schema: self.name.clone(),
                found: body.type_name(),
            });
        };

        if let Some(unknown) = map.keys().find(|k| self.lookup(k).is_none()) {
            return Err(SchemaError::UnknownField(unknown.clone()));
        }

        let mut fields = BTreeMap::new();
        for def in &self.fields {
            match map.get(&def.name) {
                None | Some(Value::Null) if def.required && def.field_type != FieldType::Any => {
                    return Err(SchemaError::MissingField(def.name.clone()));
                }
                None => {
                    if def.required {
                        return Err(SchemaError::MissingField(def.name.clone()));
                    }
                }
                Some(Value::Null) if def.field_type != FieldType::Any => {}
                Some(value) => {
                    if !def.field_type.accepts(value) {
                        return Err(SchemaError::WrongType {
                            field: def.name.clone(),
                            expected: def.field_type,
                            found: value.type_name(),
                        });
                    }
                    fields.insert(def.name.clone(), value.clone());
                }
            }
        }
        Ok(Record { fields })
    }

    /// Decodes every element of a list of maps.
    ///
    /// # Errors
    ///
    /// Returns the first element's decode error.
    pub fn decode_all(&self, items: &[Value]) -> Result<Vec<Record>, SchemaError> {
        items.iter().map(|item| self.decode(item)).collect()
    }

    /// Encodes a record back to a map value, keeping only declared fields.
    #[must_use]
    pub fn encode(&self, record: &Record) -> Value {
        Value::Map(
            record
                .fields
                .iter()
                .filter(|(k, _)| self.lookup(k).is_some())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        )
    }
}

/// A body that passed schema validation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: BTreeMap<String, Value>,
}

impl Record {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    #[must_use]
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(Value::as_int)
    }

    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(Value::as_bool)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Converts the record into a `Value::Map`.
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Map(self.fields)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn profile_schema() -> InputSchema {
        InputSchema::new("Profile")
            .field(FieldDef::required("id", FieldType::Int))
            .field(FieldDef::required("name", FieldType::String))
            .field(FieldDef::optional("score", FieldType::Float))
    }

    #[test]
    fn decodes_valid_body() {
        let body = Value::map([
            ("id", Value::from(100)),
            ("name", Value::from("Peter")),
            ("score", Value::from(3)),
        ]);
        let record = profile_schema().decode(&body).unwrap();
        assert_eq!(record.get_int("id"), Some(100));
        assert_eq!(record.get_str("name"), Some("Peter"));
        assert_eq!(record.get("score"), Some(&Value::Int(3)));
    }

    #[test]
    fn missing_required_field_is_reported_by_name() {
        let body = Value::map([("name", Value::from("Peter"))]);
        let err = profile_schema().decode(&body).unwrap_err();
        assert_eq!(err, SchemaError::MissingField("id".into()));
        assert_eq!(err.to_string(), "Missing id");
    }

    #[test]
    fn null_required_field_counts_as_missing() {
        let body = Value::map([("id", Value::Null), ("name", Value::from("x"))]);
        let err = profile_schema().decode(&body).unwrap_err();
        assert_eq!(err, SchemaError::MissingField("id".into()));
    }

    #[test]
    fn null_optional_field_is_dropped() {
        let body = Value::map([
            ("id", Value::from(1)),
            ("name", Value::from("x")),
            ("score", Value::Null),
        ]);
        let record = profile_schema().decode(&body).unwrap();
        assert!(!record.contains("score"));
    }

    #[test]
    fn unknown_field_is_rejected() {
        let body = Value::map([
            ("id", Value::from(1)),
            ("name", Value::from("x")),
            ("extra", Value::Bool(true)),
        ]);
        let err = profile_schema().decode(&body).unwrap_err();
        assert_eq!(err, SchemaError::UnknownField("extra".into()));
    }

    #[test]
    fn wrong_type_is_rejected() {
        let body = Value::map([("id", Value::from("one")), ("name", Value::from("x"))]);
        let err = profile_schema().decode(&body).unwrap_err();
        assert!(matches!(err, SchemaError::WrongType { ref field, .. } if field == "id"));
    }

    #[test]
    fn non_map_body_is_rejected() {
        let err = profile_schema().decode(&Value::from("text")).unwrap_err();
        assert!(matches!(err, SchemaError::NotAMap { found: "string", .. }));
    }

    #[test]
    fn decode_all_stops_at_first_bad_element() {
        let good = Value::map([("id", Value::from(1)), ("name", Value::from("a"))]);
        let bad = Value::map([("name", Value::from("b"))]);
        let schema = profile_schema();

        assert_eq!(schema.decode_all(&[good.clone(), good.clone()]).unwrap().len(), 2);
        assert!(schema.decode_all(&[good, bad]).is_err());
    }

    #[test]
    fn encode_returns_declared_fields() {
        let body = Value::map([("id", Value::from(7)), ("name", Value::from("z"))]);
        let schema = profile_schema();
        let record = schema.decode(&body).unwrap();
        assert_eq!(schema.encode(&record), body);
    }

    proptest! {
        #[test]
        fn any_valid_profile_decodes(id in any::<i64>(), name in "[a-zA-Z]{1,16}") {
            let body = Value::map([("id", Value::Int(id)), ("name", Value::String(name.clone()))]);
            let record = profile_schema().decode(&body).unwrap();
            prop_assert_eq!(record.get_int("id"), Some(id));
            prop_assert_eq!(record.get_str("name"), Some(name.as_str()));
        }

        #[test]
        fn undeclared_keys_never_decode(key in "[a-z]{1,8}") {
            prop_assume!(key != "id" && key != "name" && key != "score");
            let body = Value::map([
                ("id", Value::Int(1)),
                ("name", Value::from("n")),
                (key.as_str(), Value::Bool(false)),
            ]);
            prop_assert!(profile_schema().decode(&body).is_err());
        }
    }
}
