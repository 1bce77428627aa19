//! Aggregate and group-by builders
//!
//! `having` is restricted to fields present in the group-by key, and an
//! empty `by` list is a caller error; both are rejected here, before any
//! SQL exists to execute.

use super::{Filter, QueryBuilder, SqlQuery, Value};
use crate::errors::{DalError, Result};
use crate::schema::ScalarType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which aggregates to compute
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateSpec {
    pub count: bool,
    pub min: Vec<String>,
    pub max: Vec<String>,
    pub avg: Vec<String>,
    pub sum: Vec<String>,
}

impl AggregateSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(mut self) -> Self {
        self.count = true;
        self
    }

    pub fn min(mut self, field: impl Into<String>) -> Self {
        self.min.push(field.into());
        self
    }

    pub fn max(mut self, field: impl Into<String>) -> Self {
        self.max.push(field.into());
        self
    }

    pub fn avg(mut self, field: impl Into<String>) -> Self {
        self.avg.push(field.into());
        self
    }

    pub fn sum(mut self, field: impl Into<String>) -> Self {
        self.sum.push(field.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        !self.count
            && self.min.is_empty()
            && self.max.is_empty()
            && self.avg.is_empty()
            && self.sum.is_empty()
    }
}

/// Result of an aggregate query. min/max preserve the field's scalar
/// type; avg/sum are always floats. Values are None over an empty set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateResult {
    pub count: Option<u64>,
    pub min: BTreeMap<String, Value>,
    pub max: BTreeMap<String, Value>,
    pub avg: BTreeMap<String, Option<f64>>,
    pub sum: BTreeMap<String, Option<f64>>,
}

/// A group-by request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupBySpec {
    /// Grouping key fields; must be non-empty
    pub by: Vec<String>,
    /// Row filter applied before grouping
    pub filter: Option<Filter>,
    /// Group filter; may only reference fields in `by`
    pub having: Option<Filter>,
    /// Ordering; may only reference fields in `by`
    pub order: Vec<super::OrderSpec>,
    pub aggregate: AggregateSpec,
    pub take: Option<u32>,
    pub skip: Option<u32>,
}

impl GroupBySpec {
    pub fn by(fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            by: fields.into_iter().map(Into::into).collect(),
            aggregate: AggregateSpec::new().count(),
            ..Default::default()
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn having(mut self, having: Filter) -> Self {
        self.having = Some(having);
        self
    }

    pub fn order_by(mut self, order: super::OrderSpec) -> Self {
        self.order.push(order);
        self
    }

    pub fn aggregate(mut self, aggregate: AggregateSpec) -> Self {
        self.aggregate = aggregate;
        self
    }

    pub fn take(mut self, take: u32) -> Self {
        self.take = Some(take);
        self
    }

    pub fn skip(mut self, skip: u32) -> Self {
        self.skip = Some(skip);
        self
    }
}

/// Column alias for an aggregate term, e.g. `_sum_amount`
pub(crate) fn aggregate_alias(kind: &str, field: &str) -> String {
    format!("_{}_{}", kind, field)
}

impl<'a> QueryBuilder<'a> {
    fn aggregate_terms(&self, spec: &AggregateSpec) -> Result<Vec<String>> {
        if spec.is_empty() {
            return Err(DalError::validation(
                "aggregate requires at least one selection",
            ));
        }

        let mut terms = Vec::new();
        if spec.count {
            terms.push("COUNT(*) AS \"_count\"".to_string());
        }
        for field in &spec.min {
            self.entity().require_field(field)?;
            terms.push(format!(
                "MIN({}) AS \"{}\"",
                self.quoted(field),
                aggregate_alias("min", field)
            ));
        }
        for field in &spec.max {
            self.entity().require_field(field)?;
            terms.push(format!(
                "MAX({}) AS \"{}\"",
                self.quoted(field),
                aggregate_alias("max", field)
            ));
        }
        for (kind, fields) in [("avg", &spec.avg), ("sum", &spec.sum)] {
            for field in fields {
                let def = self.entity().require_field(field)?;
                if !matches!(def.ty, ScalarType::Int | ScalarType::Float) {
                    return Err(DalError::validation_field(
                        format!("{} requires a numeric field, got {}", kind, field),
                        field.clone(),
                    ));
                }
                let fun = if kind == "avg" { "AVG" } else { "SUM" };
                terms.push(format!(
                    "CAST({}({}) AS REAL) AS \"{}\"",
                    fun,
                    self.quoted(field),
                    aggregate_alias(kind, field)
                ));
            }
        }
        Ok(terms)
    }

    /// Build an aggregate query over the rows matching `filter`
    pub fn aggregate(&self, filter: Option<&Filter>, spec: &AggregateSpec) -> Result<SqlQuery> {
        let terms = self.aggregate_terms(spec)?;
        let mut sql = format!("SELECT {} FROM \"{}\"", terms.join(", "), self.entity().table);
        let mut params = Vec::new();
        if let Some(f) = filter {
            sql.push_str(" WHERE ");
            self.render_filter(f, &mut sql, &mut params)?;
        }
        Ok(SqlQuery { sql, params })
    }

    /// Build a group-by query
    pub fn group_by(&self, spec: &GroupBySpec) -> Result<SqlQuery> {
        if spec.by.is_empty() {
            return Err(DalError::validation("group_by requires a non-empty by list"));
        }
        for field in &spec.by {
            self.entity().require_field(field)?;
        }

        let in_by = |field: &str| spec.by.iter().any(|b| b == field);

        if let Some(having) = &spec.having {
            let mut referenced = Vec::new();
            having.referenced_fields(&mut referenced);
            for field in referenced {
                if !in_by(field) {
                    return Err(DalError::validation_field(
                        format!("having references {}, which is not in the group-by key", field),
                        field,
                    ));
                }
            }
        }
        for order in &spec.order {
            if !in_by(&order.field) {
                return Err(DalError::validation_field(
                    format!(
                        "order_by references {}, which is not in the group-by key",
                        order.field
                    ),
                    order.field.clone(),
                ));
            }
        }

        let mut cols: Vec<String> = spec.by.iter().map(|f| self.quoted(f)).collect();
        cols.extend(self.aggregate_terms(&spec.aggregate)?);

        let mut sql = format!("SELECT {} FROM \"{}\"", cols.join(", "), self.entity().table);
        let mut params = Vec::new();

        if let Some(f) = &spec.filter {
            sql.push_str(" WHERE ");
            self.render_filter(f, &mut sql, &mut params)?;
        }

        let group_cols: Vec<String> = spec.by.iter().map(|f| self.quoted(f)).collect();
        sql.push_str(&format!(" GROUP BY {}", group_cols.join(", ")));

        if let Some(having) = &spec.having {
            sql.push_str(" HAVING ");
            self.render_filter(having, &mut sql, &mut params)?;
        }

        self.render_order(&spec.order, &mut sql)?;
        super::select::render_page(spec.take, spec.skip, &mut sql, &mut params);

        Ok(SqlQuery { sql, params })
    }
}
