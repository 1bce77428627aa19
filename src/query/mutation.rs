//! Mutation builders: INSERT, UPDATE, DELETE, UPSERT
//!
//! Row limits on UPDATE/DELETE are compiled to
//! `rowid IN (SELECT rowid ... LIMIT ?)` since the engine's native
//! `UPDATE ... LIMIT` sits behind a non-default build flag.

use super::{Filter, QueryBuilder, Record, SqlQuery, Value};
use crate::errors::{DalError, Result};
use serde::{Deserialize, Serialize};

/// What to do when an insert hits a unique constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictAction {
    /// Surface UniqueConstraintViolation
    Abort,
    /// Skip the conflicting row silently
    Ignore,
}

impl<'a> QueryBuilder<'a> {
    /// Build a single-row INSERT, optionally tolerating unique conflicts
    /// and returning the stored columns.
    pub fn insert(
        &self,
        data: &Record,
        conflict: ConflictAction,
        returning: &[&str],
    ) -> Result<SqlQuery> {
        if data.is_empty() {
            return Err(DalError::validation("insert data cannot be empty"));
        }
        for (field, value) in data.iter() {
            self.check_value(field, value)?;
        }

        let cols: Vec<String> = data.fields().map(|f| self.quoted(f)).collect();
        let placeholders = vec!["?"; data.len()].join(", ");
        let mut sql = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            self.entity().table,
            cols.join(", "),
            placeholders
        );
        if conflict == ConflictAction::Ignore {
            sql.push_str(" ON CONFLICT DO NOTHING");
        }
        self.push_returning(&mut sql, returning)?;

        Ok(SqlQuery {
            sql,
            params: data.iter().map(|(_, v)| v.clone()).collect(),
        })
    }

    /// Build an UPDATE over the rows matching `filter`
    pub fn update(
        &self,
        filter: &Filter,
        data: &Record,
        limit: Option<u32>,
        returning: &[&str],
    ) -> Result<SqlQuery> {
        if data.is_empty() {
            return Err(DalError::validation("update data cannot be empty"));
        }
        for (field, value) in data.iter() {
            self.check_value(field, value)?;
        }

        let mut sql = format!("UPDATE \"{}\" SET ", self.entity().table);
        let mut params: Vec<Value> = Vec::new();

        let assignments: Vec<String> = data.fields().map(|f| format!("{} = ?", self.quoted(f))).collect();
        sql.push_str(&assignments.join(", "));
        params.extend(data.iter().map(|(_, v)| v.clone()));

        self.push_target(filter, limit, &mut sql, &mut params)?;
        self.push_returning(&mut sql, returning)?;

        Ok(SqlQuery { sql, params })
    }

    /// Build a DELETE over the rows matching `filter`
    pub fn delete(
        &self,
        filter: &Filter,
        limit: Option<u32>,
        returning: &[&str],
    ) -> Result<SqlQuery> {
        let mut sql = format!("DELETE FROM \"{}\"", self.entity().table);
        let mut params: Vec<Value> = Vec::new();
        self.push_target(filter, limit, &mut sql, &mut params)?;
        self.push_returning(&mut sql, returning)?;
        Ok(SqlQuery { sql, params })
    }

    /// Build an insert-or-update, atomic with respect to the unique key
    /// named by `conflict_cols`. `insert` must carry the key columns;
    /// an empty `update` degrades to a key-preserving no-op update so
    /// the existing row is still returned.
    pub fn upsert(
        &self,
        conflict_cols: &[&str],
        insert: &Record,
        update: &Record,
        returning: &[&str],
    ) -> Result<SqlQuery> {
        if insert.is_empty() {
            return Err(DalError::validation("upsert create data cannot be empty"));
        }
        for col in conflict_cols {
            self.entity().require_field(col)?;
            if !insert.contains(col) {
                return Err(DalError::validation_field(
                    format!("upsert create data must carry unique key field {}", col),
                    *col,
                ));
            }
        }
        for (field, value) in insert.iter().chain(update.iter()) {
            self.check_value(field, value)?;
        }

        let cols: Vec<String> = insert.fields().map(|f| self.quoted(f)).collect();
        let placeholders = vec!["?"; insert.len()].join(", ");
        let key_list: Vec<String> = conflict_cols.iter().map(|c| self.quoted(c)).collect();

        let mut sql = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({}) ON CONFLICT ({}) DO UPDATE SET ",
            self.entity().table,
            cols.join(", "),
            placeholders,
            key_list.join(", ")
        );
        let mut params: Vec<Value> = insert.iter().map(|(_, v)| v.clone()).collect();

        if update.is_empty() {
            let key = self.quoted(conflict_cols[0]);
            sql.push_str(&format!("{} = excluded.{}", key, key));
        } else {
            let assignments: Vec<String> =
                update.fields().map(|f| format!("{} = ?", self.quoted(f))).collect();
            sql.push_str(&assignments.join(", "));
            params.extend(update.iter().map(|(_, v)| v.clone()));
        }

        self.push_returning(&mut sql, returning)?;
        Ok(SqlQuery { sql, params })
    }

    fn push_target(
        &self,
        filter: &Filter,
        limit: Option<u32>,
        sql: &mut String,
        params: &mut Vec<Value>,
    ) -> Result<()> {
        match limit {
            None => {
                sql.push_str(" WHERE ");
                self.render_filter(filter, sql, params)?;
            }
            Some(n) => {
                sql.push_str(&format!(
                    " WHERE rowid IN (SELECT rowid FROM \"{}\" WHERE ",
                    self.entity().table
                ));
                self.render_filter(filter, sql, params)?;
                sql.push_str(" LIMIT ?)");
                params.push(Value::Int(n as i64));
            }
        }
        Ok(())
    }

    fn push_returning(&self, sql: &mut String, returning: &[&str]) -> Result<()> {
        if returning.is_empty() {
            return Ok(());
        }
        for col in returning {
            self.entity().require_field(col)?;
        }
        let cols: Vec<String> = returning.iter().map(|c| self.quoted(c)).collect();
        sql.push_str(&format!(" RETURNING {}", cols.join(", ")));
        Ok(())
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
    fn test_insert_shape() {
        let qb = builder("role");
        let data = Record::new().set("name", "ADMIN").set("description", "admins");
        let q = qb.insert(&data, ConflictAction::Abort, &["id", "name"]).unwrap();
        // Record iterates in field-name order
        assert_eq!(
            q.sql,
            "INSERT INTO \"roles\" (\"description\", \"name\") VALUES (?, ?) RETURNING \"id\", \"name\""
        );
        assert_eq!(q.params.len(), 2);
    }

    #[test]
    fn test_insert_ignore_conflicts() {
        let qb = builder("role");
        let data = Record::new().set("name", "ADMIN");
        let q = qb.insert(&data, ConflictAction::Ignore, &[]).unwrap();
        assert!(q.sql.ends_with("ON CONFLICT DO NOTHING"));
    }

    #[test]
    fn test_insert_rejects_unknown_field() {
        let qb = builder("role");
        let data = Record::new().set("nope", 1i64);
        assert!(matches!(
            qb.insert(&data, ConflictAction::Abort, &[]),
            Err(DalError::UnknownField { .. })
        ));
    }

    #[test]
    fn test_update_with_limit_uses_rowid_subquery() {
        let qb = builder("service");
        let data = Record::new().set("payment_status", "PAID");
        let q = qb
            .update(&Filter::eq("payment_status", Value::Null), &data, Some(5), &[])
            .unwrap();
        assert_eq!(
            q.sql,
            "UPDATE \"services\" SET \"payment_status\" = ? WHERE rowid IN (SELECT rowid FROM \"services\" WHERE \"payment_status\" IS NULL LIMIT ?)"
        );
        assert_eq!(q.params.last(), Some(&Value::Int(5)));
    }

    #[test]
    fn test_delete_shape() {
        let qb = builder("client");
        let q = qb
            .delete(&Filter::eq("tax_id", "ABC123"), None, &["id", "tax_id"])
            .unwrap();
        assert_eq!(
            q.sql,
            "DELETE FROM \"clients\" WHERE \"tax_id\" = ? RETURNING \"id\", \"tax_id\""
        );
    }

    #[test]
    fn test_upsert_shape() {
        let qb = builder("role");
        let insert = Record::new().set("id", uuid::Uuid::nil()).set("name", "ADMIN");
        let update = Record::new().set("description", "updated");
        let q = qb.upsert(&["name"], &insert, &update, &["id"]).unwrap();
        assert!(q.sql.contains("ON CONFLICT (\"name\") DO UPDATE SET \"description\" = ?"));
        assert!(q.sql.ends_with("RETURNING \"id\""));
        assert_eq!(q.params.len(), 3);
    }

    #[test]
    fn test_upsert_requires_key_in_create_data() {
        let qb = builder("role");
        let insert = Record::new().set("description", "no name");
        assert!(qb.upsert(&["name"], &insert, &Record::new(), &[]).is_err());
    }

    #[test]
    fn test_upsert_empty_update_is_noop_set() {
        let qb = builder("role");
        let insert = Record::new().set("name", "ADMIN");
        let q = qb.upsert(&["name"], &insert, &Record::new(), &["id"]).unwrap();
        assert!(q.sql.contains("DO UPDATE SET \"name\" = excluded.\"name\""));
    }
}
