//! Dynamic result rows
//!
//! Rows are decoded from the driver using the registry's field types, so
//! a single `Row` type serves every entity. Relations attached by the
//! resolver live alongside the scalar fields and serialize inline.

use crate::errors::{DalError, Result};
use crate::query::Value;
use crate::schema::ScalarType;
use chrono::{DateTime, Utc};
use serde::ser::{Serialize, SerializeMap, Serializer};
use sqlx::sqlite::SqliteRow;
use sqlx::Row as _;
use std::collections::BTreeMap;
use uuid::Uuid;

/// A relation attached to a row
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    /// To-one edge; None when the foreign key is null
    One(Option<Box<Row>>),
    /// To-many edge
    Many(Vec<Row>),
}

/// One materialized entity row: scalar fields plus attached relations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    fields: BTreeMap<String, Value>,
    relations: BTreeMap<String, Related>,
}

impl Row {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    pub fn str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn int(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_int)
    }

    pub fn float(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(Value::as_float)
    }

    pub fn bool(&self, field: &str) -> Option<bool> {
        self.get(field).and_then(Value::as_bool)
    }

    pub fn uuid(&self, field: &str) -> Option<Uuid> {
        self.get(field).and_then(Value::as_uuid)
    }

    pub fn datetime(&self, field: &str) -> Option<DateTime<Utc>> {
        self.get(field).and_then(Value::as_datetime)
    }

    /// An attached relation, if it was included
    pub fn related(&self, name: &str) -> Option<&Related> {
        self.relations.get(name)
    }

    /// Attached to-many relation rows; empty when absent
    pub fn related_many(&self, name: &str) -> &[Row] {
        match self.relations.get(name) {
            Some(Related::Many(rows)) => rows,
            _ => &[],
        }
    }

    /// Attached to-one relation row
    pub fn related_one(&self, name: &str) -> Option<&Row> {
        match self.relations.get(name) {
            Some(Related::One(Some(row))) => Some(row),
            _ => None,
        }
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(|k| k.as_str())
    }

    pub(crate) fn insert_field(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    pub(crate) fn remove_field(&mut self, name: &str) -> Option<Value> {
        self.fields.remove(name)
    }

    pub(crate) fn set_relation(&mut self, name: impl Into<String>, related: Related) {
        self.relations.insert(name.into(), related);
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len() + self.relations.len()))?;
        for (k, v) in &self.fields {
            map.serialize_entry(k, v)?;
        }
        for (k, rel) in &self.relations {
            match rel {
                Related::One(None) => map.serialize_entry(k, &Value::Null)?,
                Related::One(Some(row)) => map.serialize_entry(k, row.as_ref())?,
                Related::Many(rows) => map.serialize_entry(k, rows)?,
            }
        }
        map.end()
    }
}

/// Decode one column using the schema's scalar type
pub(crate) fn decode_scalar(row: &SqliteRow, name: &str, ty: ScalarType) -> Result<Value> {
    let value = match ty {
        ScalarType::Text => row
            .try_get::<Option<String>, _>(name)?
            .map_or(Value::Null, Value::Text),
        ScalarType::Int => row
            .try_get::<Option<i64>, _>(name)?
            .map_or(Value::Null, Value::Int),
        ScalarType::Float => row
            .try_get::<Option<f64>, _>(name)?
            .map_or(Value::Null, Value::Float),
        ScalarType::Bool => row
            .try_get::<Option<bool>, _>(name)?
            .map_or(Value::Null, Value::Bool),
        ScalarType::Uuid => match row.try_get::<Option<String>, _>(name)? {
            None => Value::Null,
            Some(s) => Value::Uuid(Uuid::parse_str(&s).map_err(|e| {
                DalError::validation(format!("stored value in {} is not a uuid: {}", name, e))
            })?),
        },
        ScalarType::DateTime => row
            .try_get::<Option<DateTime<Utc>>, _>(name)?
            .map_or(Value::Null, Value::DateTime),
    };
    Ok(value)
}

/// Decode the named columns of a driver row into a `Row`
pub(crate) fn decode_row(
    row: &SqliteRow,
    columns: &[(&str, ScalarType)],
) -> Result<Row> {
    let mut out = Row::default();
    for (name, ty) in columns {
        out.insert_field(*name, decode_scalar(row, name, *ty)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_accessors() {
        let mut row = Row::default();
        row.insert_field("amount", Value::Float(120.5));
        row.insert_field("phone", Value::Null);
        assert_eq!(row.float("amount"), Some(120.5));
        assert_eq!(row.str("phone"), None);
        assert!(row.get("phone").unwrap().is_null());
        assert!(row.related("services").is_none());
        assert!(row.related_many("services").is_empty());
    }

    #[test]
    fn test_row_serializes_relations_inline() {
        let mut child = Row::default();
        child.insert_field("city", Value::Text("Rome".into()));

        let mut row = Row::default();
        row.insert_field("first_name", Value::Text("Ada".into()));
        row.set_relation("properties", Related::Many(vec![child]));
        row.set_relation("user", Related::One(None));

        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["first_name"], "Ada");
        assert_eq!(json["properties"][0]["city"], "Rome");
        assert!(json["user"].is_null());
    }
}
