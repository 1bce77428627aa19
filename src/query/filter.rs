//! Filter expressions
//!
//! A filter is a tree of AND/OR/NOT groups over field conditions. Rendering
//! validates every referenced field against the schema registry and produces
//! a parameterized predicate.

use super::{QueryBuilder, Value};
use crate::errors::{DalError, Result};
use crate::schema::ScalarType;
use serde::{Deserialize, Serialize};

/// Comparison operator applied to one field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Eq(Value),
    Ne(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Lt(Value),
    Lte(Value),
    Gt(Value),
    Gte(Value),
    Contains(String),
    StartsWith(String),
    EndsWith(String),
    IsNull(bool),
}

/// One field condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cond {
    pub field: String,
    pub op: Op,
    /// Case-insensitive comparison (text fields only)
    #[serde(default)]
    pub insensitive: bool,
}

/// A filter expression over an entity's scalar fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Cond(Cond),
}

impl Filter {
    fn cond(field: impl Into<String>, op: Op) -> Self {
        Filter::Cond(Cond {
            field: field.into(),
            op,
            insensitive: false,
        })
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cond(field, Op::Eq(value.into()))
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cond(field, Op::Ne(value.into()))
    }

    pub fn in_(field: impl Into<String>, values: impl IntoIterator<Item = impl Into<Value>>) -> Self {
        Self::cond(field, Op::In(values.into_iter().map(Into::into).collect()))
    }

    pub fn not_in(
        field: impl Into<String>,
        values: impl IntoIterator<Item = impl Into<Value>>,
    ) -> Self {
        Self::cond(
            field,
            Op::NotIn(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cond(field, Op::Lt(value.into()))
    }

    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cond(field, Op::Lte(value.into()))
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cond(field, Op::Gt(value.into()))
    }

    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::cond(field, Op::Gte(value.into()))
    }

    pub fn contains(field: impl Into<String>, needle: impl Into<String>) -> Self {
        Self::cond(field, Op::Contains(needle.into()))
    }

    pub fn starts_with(field: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self::cond(field, Op::StartsWith(prefix.into()))
    }

    pub fn ends_with(field: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self::cond(field, Op::EndsWith(suffix.into()))
    }

    pub fn is_null(field: impl Into<String>) -> Self {
        Self::cond(field, Op::IsNull(true))
    }

    pub fn is_not_null(field: impl Into<String>) -> Self {
        Self::cond(field, Op::IsNull(false))
    }

    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::And(filters.into_iter().collect())
    }

    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Filter::Or(filters.into_iter().collect())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    /// Mark a condition as case-insensitive. No effect on groups.
    pub fn case_insensitive(mut self) -> Self {
        if let Filter::Cond(cond) = &mut self {
            cond.insensitive = true;
        }
        self
    }

    /// Collect every field name referenced by this filter
    pub fn referenced_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Filter::And(fs) | Filter::Or(fs) => {
                for f in fs {
                    f.referenced_fields(out);
                }
            }
            Filter::Not(f) => f.referenced_fields(out),
            Filter::Cond(c) => out.push(&c.field),
        }
    }
}

/// Escape LIKE wildcards so user input matches literally
fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

impl<'a> QueryBuilder<'a> {
    /// Render a filter into `sql`, pushing parameters in order
    pub(crate) fn render_filter(
        &self,
        filter: &Filter,
        sql: &mut String,
        params: &mut Vec<Value>,
    ) -> Result<()> {
        match filter {
            Filter::And(fs) => self.render_group(fs, " AND ", "1 = 1", sql, params),
            Filter::Or(fs) => self.render_group(fs, " OR ", "1 = 0", sql, params),
            Filter::Not(inner) => {
                sql.push_str("NOT (");
                self.render_filter(inner, sql, params)?;
                sql.push(')');
                Ok(())
            }
            Filter::Cond(cond) => self.render_cond(cond, sql, params),
        }
    }

    fn render_group(
        &self,
        filters: &[Filter],
        joiner: &str,
        empty: &str,
        sql: &mut String,
        params: &mut Vec<Value>,
    ) -> Result<()> {
        if filters.is_empty() {
            sql.push_str(empty);
            return Ok(());
        }
        sql.push('(');
        for (i, f) in filters.iter().enumerate() {
            if i > 0 {
                sql.push_str(joiner);
            }
            self.render_filter(f, sql, params)?;
        }
        sql.push(')');
        Ok(())
    }

    fn render_cond(&self, cond: &Cond, sql: &mut String, params: &mut Vec<Value>) -> Result<()> {
        let field = self.entity().require_field(&cond.field)?;
        let col = self.quoted(field.name);

        if cond.insensitive && field.ty != ScalarType::Text {
            return Err(DalError::validation_field(
                format!("case-insensitive mode requires a text field, got {}", field.name),
                field.name,
            ));
        }

        let lhs = if cond.insensitive {
            format!("LOWER({})", col)
        } else {
            col.clone()
        };
        let rhs = if cond.insensitive { "LOWER(?)" } else { "?" };

        let mut push_scalar = |v: &Value, params: &mut Vec<Value>| -> Result<()> {
            if !v.fits(field.ty) {
                return Err(DalError::validation_field(
                    format!("filter value {:?} does not fit field {}", v, field.name),
                    field.name,
                ));
            }
            params.push(v.clone());
            Ok(())
        };

        match &cond.op {
            Op::Eq(Value::Null) => sql.push_str(&format!("{} IS NULL", col)),
            Op::Ne(Value::Null) => sql.push_str(&format!("{} IS NOT NULL", col)),
            Op::Eq(v) => {
                push_scalar(v, params)?;
                sql.push_str(&format!("{} = {}", lhs, rhs));
            }
            Op::Ne(v) => {
                push_scalar(v, params)?;
                sql.push_str(&format!("{} <> {}", lhs, rhs));
            }
            Op::In(values) | Op::NotIn(values) => {
                let negated = matches!(cond.op, Op::NotIn(_));
                if values.is_empty() {
                    // IN () matches nothing, NOT IN () matches everything
                    sql.push_str(if negated { "1 = 1" } else { "1 = 0" });
                } else {
                    for v in values {
                        push_scalar(v, params)?;
                    }
                    let placeholders = vec![rhs; values.len()].join(", ");
                    sql.push_str(&format!(
                        "{} {} ({})",
                        lhs,
                        if negated { "NOT IN" } else { "IN" },
                        placeholders
                    ));
                }
            }
            Op::Lt(v) => {
                push_scalar(v, params)?;
                sql.push_str(&format!("{} < {}", lhs, rhs));
            }
            Op::Lte(v) => {
                push_scalar(v, params)?;
                sql.push_str(&format!("{} <= {}", lhs, rhs));
            }
            Op::Gt(v) => {
                push_scalar(v, params)?;
                sql.push_str(&format!("{} > {}", lhs, rhs));
            }
            Op::Gte(v) => {
                push_scalar(v, params)?;
                sql.push_str(&format!("{} >= {}", lhs, rhs));
            }
            Op::Contains(s) | Op::StartsWith(s) | Op::EndsWith(s) => {
                if field.ty != ScalarType::Text {
                    return Err(DalError::validation_field(
                        format!("string operator requires a text field, got {}", field.name),
                        field.name,
                    ));
                }
                let escaped = escape_like(s);
                let pattern = match &cond.op {
                    Op::Contains(_) => format!("%{}%", escaped),
                    Op::StartsWith(_) => format!("{}%", escaped),
                    Op::EndsWith(_) => format!("%{}", escaped),
                    _ => unreachable!(),
                };
                params.push(Value::Text(pattern));
                sql.push_str(&format!("{} LIKE {} ESCAPE '\\'", lhs, rhs));
            }
            Op::IsNull(true) => sql.push_str(&format!("{} IS NULL", col)),
            Op::IsNull(false) => sql.push_str(&format!("{} IS NOT NULL", col)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::registry;

    fn render(filter: &Filter) -> Result<(String, Vec<Value>)> {
        let entity = registry().entity("client").unwrap();
        let qb = QueryBuilder::new(entity);
        let mut sql = String::new();
        let mut params = Vec::new();
        qb.render_filter(filter, &mut sql, &mut params)?;
        Ok((sql, params))
    }

    #[test]
    fn test_and_or_nesting() {
        let filter = Filter::and([
            Filter::eq("first_name", "Ada"),
            Filter::or([
                Filter::contains("email", "example"),
                Filter::is_null("phone"),
            ]),
        ]);
        let (sql, params) = render(&filter).unwrap();
        assert_eq!(
            sql,
            "(\"first_name\" = ? AND (\"email\" LIKE ? ESCAPE '\\' OR \"phone\" IS NULL))"
        );
        assert_eq!(params.len(), 2);
        assert_eq!(params[1], Value::Text("%example%".into()));
    }

    #[test]
    fn test_empty_groups() {
        assert_eq!(render(&Filter::And(vec![])).unwrap().0, "1 = 1");
        assert_eq!(render(&Filter::Or(vec![])).unwrap().0, "1 = 0");
    }

    #[test]
    fn test_in_operators() {
        let (sql, params) = render(&Filter::in_("first_name", ["Ada", "Grace"])).unwrap();
        assert_eq!(sql, "\"first_name\" IN (?, ?)");
        assert_eq!(params.len(), 2);

        let empty: Vec<String> = vec![];
        assert_eq!(render(&Filter::in_("first_name", empty.clone())).unwrap().0, "1 = 0");
        assert_eq!(render(&Filter::not_in("first_name", empty)).unwrap().0, "1 = 1");
    }

    #[test]
    fn test_eq_null_renders_is_null() {
        let (sql, params) = render(&Filter::eq("phone", Value::Null)).unwrap();
        assert_eq!(sql, "\"phone\" IS NULL");
        assert!(params.is_empty());

        let (sql, _) = render(&Filter::ne("phone", Value::Null)).unwrap();
        assert_eq!(sql, "\"phone\" IS NOT NULL");
    }

    #[test]
    fn test_case_insensitive_mode() {
        let (sql, _) = render(&Filter::eq("email", "ADA@EXAMPLE.COM").case_insensitive()).unwrap();
        assert_eq!(sql, "LOWER(\"email\") = LOWER(?)");
    }

    #[test]
    fn test_like_wildcards_escaped() {
        let (_, params) = render(&Filter::contains("email", "100%_sure")).unwrap();
        assert_eq!(params[0], Value::Text("%100\\%\\_sure%".into()));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = render(&Filter::eq("nope", 1i64)).unwrap_err();
        assert!(matches!(err, DalError::UnknownField { .. }));
    }

    #[test]
    fn test_string_op_on_non_text_rejected() {
        let entity = registry().entity("service").unwrap();
        let qb = QueryBuilder::new(entity);
        let mut sql = String::new();
        let mut params = Vec::new();
        let err = qb
            .render_filter(&Filter::contains("amount", "1"), &mut sql, &mut params)
            .unwrap_err();
        assert!(matches!(err, DalError::Validation { .. }));
    }
}
