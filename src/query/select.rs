//! Read-query shapes: ordering, cursor/offset pagination, projections
//! and the SELECT builder.

use super::{Filter, QueryBuilder, SqlQuery, Value};
use crate::errors::{DalError, Result};
use crate::schema::EntityDef;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortDir {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullsOrder {
    /// Engine default placement
    Default,
    First,
    Last,
}

/// One ORDER BY term
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub field: String,
    pub dir: SortDir,
    pub nulls: NullsOrder,
}

impl OrderSpec {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            dir: SortDir::Asc,
            nulls: NullsOrder::Default,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            dir: SortDir::Desc,
            nulls: NullsOrder::Default,
        }
    }

    pub fn nulls_first(mut self) -> Self {
        self.nulls = NullsOrder::First;
        self
    }

    pub fn nulls_last(mut self) -> Self {
        self.nulls = NullsOrder::Last;
        self
    }
}

/// Cursor position for keyset pagination. The cursor field must lead the
/// ordering; the cursor row itself is included (combine with `skip` to
/// start after it).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub field: String,
    pub value: Value,
}

impl Cursor {
    pub fn new(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Select/omit projection over an entity's scalar fields
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Projection {
    #[default]
    All,
    Select(Vec<String>),
    Omit(Vec<String>),
}

impl Projection {
    pub fn select(fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Projection::Select(fields.into_iter().map(Into::into).collect())
    }

    pub fn omit(fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Projection::Omit(fields.into_iter().map(Into::into).collect())
    }

    /// Resolve to concrete output fields, in declaration order
    pub fn output_fields(&self, entity: &EntityDef) -> Result<Vec<&'static str>> {
        match self {
            Projection::All => Ok(entity.scalar_names()),
            Projection::Select(fields) => {
                for f in fields {
                    entity.require_field(f)?;
                }
                if fields.is_empty() {
                    return Err(DalError::validation("select projection cannot be empty"));
                }
                Ok(entity
                    .scalar_names()
                    .into_iter()
                    .filter(|n| fields.iter().any(|f| f == n))
                    .collect())
            }
            Projection::Omit(fields) => {
                for f in fields {
                    entity.require_field(f)?;
                }
                let out: Vec<&'static str> = entity
                    .scalar_names()
                    .into_iter()
                    .filter(|n| !fields.iter().any(|f| f == n))
                    .collect();
                if out.is_empty() {
                    return Err(DalError::validation(
                        "omit projection removes every field",
                    ));
                }
                Ok(out)
            }
        }
    }
}

/// Arguments for find_first/find_many
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindArgs {
    pub filter: Option<Filter>,
    pub order: Vec<OrderSpec>,
    pub cursor: Option<Cursor>,
    pub take: Option<u32>,
    pub skip: Option<u32>,
    pub distinct: Vec<String>,
}

impl FindArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn order_by(mut self, order: OrderSpec) -> Self {
        self.order.push(order);
        self
    }

    pub fn cursor(mut self, cursor: Cursor) -> Self {
        self.cursor = Some(cursor);
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

    pub fn distinct(mut self, fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.distinct = fields.into_iter().map(Into::into).collect();
        self
    }
}

impl<'a> QueryBuilder<'a> {
    /// Build a SELECT for the given output columns and find arguments
    pub fn select(&self, columns: &[&str], args: &FindArgs) -> Result<SqlQuery> {
        let entity = self.entity();

        for col in columns {
            entity.require_field(col)?;
        }
        if columns.is_empty() {
            return Err(DalError::validation("select requires at least one column"));
        }

        let distinct = !args.distinct.is_empty();
        if distinct {
            for f in &args.distinct {
                entity.require_field(f)?;
            }
            for col in columns {
                if !args.distinct.iter().any(|d| d == col) {
                    return Err(DalError::validation_field(
                        format!(
                            "distinct requires the projection to be a subset of the distinct fields; {} is not listed",
                            col
                        ),
                        *col,
                    ));
                }
            }
        }

        let col_list: Vec<String> = columns.iter().map(|c| self.quoted(c)).collect();
        let mut sql = format!(
            "SELECT {}{} FROM \"{}\"",
            if distinct { "DISTINCT " } else { "" },
            col_list.join(", "),
            entity.table
        );
        let mut params: Vec<Value> = Vec::new();

        self.render_where(args, &mut sql, &mut params)?;
        self.render_order(&args.order, &mut sql)?;
        render_page(args.take, args.skip, &mut sql, &mut params);

        Ok(SqlQuery { sql, params })
    }

    /// Build `SELECT COUNT(*)` with an optional filter
    pub fn count(&self, filter: Option<&Filter>) -> Result<SqlQuery> {
        let mut sql = format!("SELECT COUNT(*) AS \"_count\" FROM \"{}\"", self.entity().table);
        let mut params = Vec::new();
        if let Some(f) = filter {
            sql.push_str(" WHERE ");
            self.render_filter(f, &mut sql, &mut params)?;
        }
        Ok(SqlQuery { sql, params })
    }

    fn render_where(
        &self,
        args: &FindArgs,
        sql: &mut String,
        params: &mut Vec<Value>,
    ) -> Result<()> {
        let cursor_cond = match &args.cursor {
            Some(cursor) => {
                let field = self.entity().require_field(&cursor.field)?;
                let leading = args.order.first().ok_or_else(|| {
                    DalError::validation("cursor pagination requires an order_by")
                })?;
                if leading.field != cursor.field {
                    return Err(DalError::validation_field(
                        format!(
                            "cursor field {} must lead the ordering (found {})",
                            cursor.field, leading.field
                        ),
                        cursor.field.clone(),
                    ));
                }
                if !cursor.value.fits(field.ty) {
                    return Err(DalError::validation_field(
                        format!("cursor value does not fit field {}", cursor.field),
                        cursor.field.clone(),
                    ));
                }
                let op = match leading.dir {
                    SortDir::Asc => ">=",
                    SortDir::Desc => "<=",
                };
                Some((format!("{} {} ?", self.quoted(&cursor.field), op), cursor.value.clone()))
            }
            None => None,
        };

        match (&args.filter, cursor_cond) {
            (None, None) => {}
            (Some(f), None) => {
                sql.push_str(" WHERE ");
                self.render_filter(f, sql, params)?;
            }
            (None, Some((cond, value))) => {
                sql.push_str(" WHERE ");
                sql.push_str(&cond);
                params.push(value);
            }
            (Some(f), Some((cond, value))) => {
                sql.push_str(" WHERE ");
                self.render_filter(f, sql, params)?;
                sql.push_str(" AND ");
                sql.push_str(&cond);
                params.push(value);
            }
        }
        Ok(())
    }

    pub(crate) fn render_order(&self, order: &[OrderSpec], sql: &mut String) -> Result<()> {
        if order.is_empty() {
            return Ok(());
        }
        let mut terms = Vec::with_capacity(order.len());
        for spec in order {
            self.entity().require_field(&spec.field)?;
            let mut term = format!(
                "{} {}",
                self.quoted(&spec.field),
                match spec.dir {
                    SortDir::Asc => "ASC",
                    SortDir::Desc => "DESC",
                }
            );
            match spec.nulls {
                NullsOrder::Default => {}
                NullsOrder::First => term.push_str(" NULLS FIRST"),
                NullsOrder::Last => term.push_str(" NULLS LAST"),
            }
            terms.push(term);
        }
        sql.push_str(" ORDER BY ");
        sql.push_str(&terms.join(", "));
        Ok(())
    }
}

/// Append LIMIT/OFFSET. OFFSET without LIMIT uses `LIMIT -1`, which the
/// engine treats as unbounded.
pub(crate) fn render_page(
    take: Option<u32>,
    skip: Option<u32>,
    sql: &mut String,
    params: &mut Vec<Value>,
) {
    match (take, skip) {
        (None, None) => {}
        (Some(t), None) => {
            sql.push_str(" LIMIT ?");
            params.push(Value::Int(t as i64));
        }
        (take, Some(s)) => {
            sql.push_str(" LIMIT ? OFFSET ?");
            params.push(Value::Int(take.map(|t| t as i64).unwrap_or(-1)));
            params.push(Value::Int(s as i64));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::registry;

    fn builder(name: &str) -> QueryBuilder<'static> {
        QueryBuilder::new(registry().entity(name).unwrap())
    }

    #[test]
    fn test_basic_select() {
        let qb = builder("client");
        let q = qb
            .select(
                &["id", "email"],
                &FindArgs::new()
                    .filter(Filter::eq("first_name", "Ada"))
                    .order_by(OrderSpec::desc("created_at"))
                    .take(10)
                    .skip(5),
            )
            .unwrap();
        assert_eq!(
            q.sql,
            "SELECT \"id\", \"email\" FROM \"clients\" WHERE \"first_name\" = ? ORDER BY \"created_at\" DESC LIMIT ? OFFSET ?"
        );
        assert_eq!(q.params.len(), 3);
    }

    #[test]
    fn test_nulls_placement() {
        let qb = builder("client");
        let q = qb
            .select(
                &["id"],
                &FindArgs::new().order_by(OrderSpec::asc("phone").nulls_last()),
            )
            .unwrap();
        assert!(q.sql.ends_with("ORDER BY \"phone\" ASC NULLS LAST"));
    }

    #[test]
    fn test_cursor_requires_leading_order_field() {
        let qb = builder("client");
        let args = FindArgs::new()
            .order_by(OrderSpec::asc("created_at"))
            .cursor(Cursor::new("email", "a@example.com"));
        assert!(matches!(
            qb.select(&["id"], &args),
            Err(DalError::Validation { .. })
        ));

        let args = FindArgs::new()
            .order_by(OrderSpec::asc("email"))
            .cursor(Cursor::new("email", "a@example.com"));
        let q = qb.select(&["id"], &args).unwrap();
        assert!(q.sql.contains("WHERE \"email\" >= ?"));
    }

    #[test]
    fn test_cursor_without_order_rejected() {
        let qb = builder("client");
        let args = FindArgs::new().cursor(Cursor::new("email", "a@example.com"));
        assert!(qb.select(&["id"], &args).is_err());
    }

    #[test]
    fn test_distinct_projection_subset_rule() {
        let qb = builder("property");
        let args = FindArgs::new().distinct(["city"]);
        assert!(qb.select(&["city"], &args).is_ok());
        assert!(qb.select(&["id", "city"], &args).is_err());

        let q = qb.select(&["city"], &args).unwrap();
        assert!(q.sql.starts_with("SELECT DISTINCT \"city\""));
    }

    #[test]
    fn test_skip_without_take() {
        let qb = builder("client");
        let q = qb.select(&["id"], &FindArgs::new().skip(3)).unwrap();
        assert!(q.sql.ends_with("LIMIT ? OFFSET ?"));
        assert_eq!(q.params, vec![Value::Int(-1), Value::Int(3)]);
    }

    #[test]
    fn test_projection_resolution() {
        let entity = registry().entity("client").unwrap();
        let all = Projection::All.output_fields(entity).unwrap();
        assert_eq!(all.len(), entity.fields.len());

        let sel = Projection::select(["email", "id"]).output_fields(entity).unwrap();
        // declaration order, not request order
        assert_eq!(sel, vec!["id", "email"]);

        let omit = Projection::omit(["created_at", "updated_at"])
            .output_fields(entity)
            .unwrap();
        assert!(!omit.contains(&"created_at"));

        assert!(Projection::select(["bogus"]).output_fields(entity).is_err());
    }
}
