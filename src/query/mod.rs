//! Query Builder for praxisdb
//!
//! Translates structured filter/sort/pagination/mutation requests into
//! parameterized SQL against the storage engine. The builder only produces
//! `SqlQuery { sql, params }`; it never executes anything, and every
//! malformed request shape (unknown field, having outside the group-by
//! key, cursor not leading the ordering) is rejected here, before any
//! query is issued.

mod aggregate;
mod filter;
mod mutation;
mod select;

pub use aggregate::{AggregateResult, AggregateSpec, GroupBySpec};
pub use filter::{Cond, Filter, Op};
pub use mutation::ConflictAction;
pub use select::{Cursor, FindArgs, NullsOrder, OrderSpec, Projection, SortDir};

use crate::errors::{DalError, Result};
use crate::schema::{EntityDef, ScalarType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A scalar value flowing through filters, records and rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Uuid(Uuid),
    DateTime(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value can be stored in a column of the given type.
    /// Ints are accepted where floats are expected.
    pub fn fits(&self, ty: ScalarType) -> bool {
        match (self, ty) {
            (Value::Null, _) => true,
            (Value::Bool(_), ScalarType::Bool) => true,
            (Value::Int(_), ScalarType::Int) => true,
            (Value::Int(_), ScalarType::Float) => true,
            (Value::Float(_), ScalarType::Float) => true,
            (Value::Text(_), ScalarType::Text) => true,
            (Value::Uuid(_), ScalarType::Uuid) => true,
            (Value::DateTime(_), ScalarType::DateTime) => true,
            _ => false,
        }
    }

    /// Stable string form usable as a grouping key
    pub(crate) fn as_key(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Text(s) => Some(s.clone()),
            Value::Uuid(u) => Some(u.to_string()),
            Value::DateTime(dt) => Some(dt.to_rfc3339()),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Value::Uuid(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Value::Null,
        }
    }
}

/// Field-to-value map used as mutation data and as unique-key filters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    values: BTreeMap<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter
    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(field.into(), value.into());
        self
    }

    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(field.into(), value.into());
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.values.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.values.contains_key(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// A fully parameterized query plan: SQL text plus positional parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<Value>,
}

impl SqlQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }
}

/// Builder producing parameterized SQL for one entity
#[derive(Debug, Clone, Copy)]
pub struct QueryBuilder<'a> {
    entity: &'a EntityDef,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(entity: &'a EntityDef) -> Self {
        Self { entity }
    }

    pub fn entity(&self) -> &'a EntityDef {
        self.entity
    }

    pub(crate) fn quoted(&self, field: &str) -> String {
        format!("\"{}\"", field)
    }

    /// Validate a mutation value against the field it targets
    pub(crate) fn check_value(&self, field: &str, value: &Value) -> Result<()> {
        let def = self.entity.require_field(field)?;
        if value.is_null() && !def.nullable {
            return Err(DalError::validation_field(
                format!("field {} on {} is not nullable", field, self.entity.name),
                field,
            ));
        }
        if !value.fits(def.ty) {
            return Err(DalError::validation_field(
                format!(
                    "value {:?} does not fit {} field {}.{}",
                    value,
                    format!("{:?}", def.ty).to_lowercase(),
                    self.entity.name,
                    field
                ),
                field,
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::registry;

    #[test]
    fn test_value_fits() {
        assert!(Value::Int(3).fits(ScalarType::Float));
        assert!(!Value::Float(3.5).fits(ScalarType::Int));
        assert!(Value::Null.fits(ScalarType::Text));
        assert!(Value::Uuid(Uuid::nil()).fits(ScalarType::Uuid));
    }

    #[test]
    fn test_record_builder() {
        let rec = Record::new()
            .set("first_name", "Ada")
            .set("phone", Option::<String>::None);
        assert_eq!(rec.get("first_name"), Some(&Value::Text("Ada".into())));
        assert_eq!(rec.get("phone"), Some(&Value::Null));
        assert_eq!(rec.len(), 2);
    }

    #[test]
    fn test_check_value_rejects_null_in_required_field() {
        let entity = registry().entity("client").unwrap();
        let qb = QueryBuilder::new(entity);
        assert!(qb.check_value("tax_id", &Value::Null).is_err());
        assert!(qb.check_value("vat_number", &Value::Null).is_ok());
        assert!(qb.check_value("tax_id", &Value::Int(1)).is_err());
        assert!(qb.check_value("no_such_field", &Value::Null).is_err());
    }
}
