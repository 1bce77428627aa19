//! Entity Repository
//!
//! One generic repository serves every entity, parameterized by the
//! schema registry's descriptor. All operations accept a `View`
//! (projection + include graph) controlling what comes back; mutations
//! validate their data against the registry before any SQL is built.

pub(crate) mod row;

pub use row::{Related, Row};

use crate::db::{Db, DbHandle};
use crate::errors::{DalError, Result};
use crate::query::{
    AggregateResult, AggregateSpec, ConflictAction, Filter, FindArgs, GroupBySpec, Projection,
    QueryBuilder, Record, Value,
};
use crate::relation::{fetch_columns, strip_extras, Include, Resolver};
use crate::schema::{registry, DefaultValue, EntityDef, ScalarType};
use crate::txn::{self, OpResult, Operation, TxOptions};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::Row as _;
use std::future::Future;
use uuid::Uuid;

/// What a call returns: a scalar projection plus an include graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct View {
    pub projection: Projection,
    pub include: Include,
}

impl View {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn include(mut self, include: Include) -> Self {
        self.include = include;
        self
    }
}

/// Typed CRUD and aggregate operations for one entity
#[derive(Clone)]
pub struct Repository {
    handle: DbHandle,
    entity: &'static EntityDef,
}

impl Repository {
    pub(crate) fn new(handle: DbHandle, entity: &'static EntityDef) -> Self {
        Self { handle, entity }
    }

    pub fn entity(&self) -> &'static EntityDef {
        self.entity
    }

    fn builder(&self) -> QueryBuilder<'static> {
        QueryBuilder::new(self.entity)
    }

    /// Validate that `key` addresses exactly one unique constraint and
    /// turn it into an equality filter.
    fn unique_filter(&self, key: &Record) -> Result<(Filter, Vec<&'static str>)> {
        let fields: Vec<&str> = key.fields().collect();
        let cols = self.entity.matching_unique(&fields).ok_or_else(|| {
            DalError::validation(format!(
                "fields [{}] do not form a unique key of {}",
                fields.join(", "),
                self.entity.name
            ))
        })?;
        let qb = self.builder();
        let mut eqs = Vec::with_capacity(key.len());
        for (field, value) in key.iter() {
            if value.is_null() {
                return Err(DalError::validation_field(
                    format!("unique key field {} cannot be null", field),
                    field,
                ));
            }
            qb.check_value(field, value)?;
            eqs.push(Filter::eq(field, value.clone()));
        }
        Ok((Filter::and(eqs), cols))
    }

    /// Fill schema defaults (ids, timestamps, flags) for absent fields
    fn fill_defaults(&self, data: &mut Record) {
        for field in &self.entity.fields {
            if data.contains(field.name) {
                continue;
            }
            if let Some(default) = &field.default {
                let value = match default {
                    DefaultValue::UuidV4 => Value::Uuid(Uuid::new_v4()),
                    DefaultValue::Now => Value::DateTime(Utc::now()),
                    DefaultValue::Bool(b) => Value::Bool(*b),
                    DefaultValue::Int(i) => Value::Int(*i),
                    DefaultValue::Text(s) => Value::Text(s.to_string()),
                };
                data.insert(field.name, value);
            }
        }
    }

    /// Touch updated_at on mutation unless the caller set it explicitly
    fn touch_updated_at(&self, data: &mut Record) {
        if self.entity.field("updated_at").is_some() && !data.contains("updated_at") {
            data.insert("updated_at", Value::DateTime(Utc::now()));
        }
    }

    fn all_columns(&self) -> Vec<&'static str> {
        self.entity.scalar_names()
    }

    /// Decode a RETURNING row, then hydrate and project it per `view`
    async fn finish_row(&self, raw: sqlx::sqlite::SqliteRow, view: &View) -> Result<Row> {
        let cols: Vec<(&'static str, ScalarType)> = self
            .entity
            .fields
            .iter()
            .map(|f| (f.name, f.ty))
            .collect();
        let decoded = row::decode_row(&raw, &cols)?;

        let (out, _) = fetch_columns(self.entity, &view.projection, &view.include)?;
        let mut rows = vec![decoded];
        Resolver::new(&self.handle)
            .attach(self.entity, &mut rows, &view.include)
            .await?;
        let all = self.all_columns();
        strip_extras(&mut rows, &out, &all);
        rows.pop()
            .ok_or_else(|| DalError::validation("returned row vanished during hydration"))
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Find one row by a unique key, or None
    pub async fn find_unique(&self, key: Record) -> Result<Option<Row>> {
        self.find_unique_with(key, &View::default()).await
    }

    pub async fn find_unique_with(&self, key: Record, view: &View) -> Result<Option<Row>> {
        let (filter, _) = self.unique_filter(&key)?;
        let args = FindArgs::new().filter(filter).take(1);
        let mut rows = Resolver::new(&self.handle)
            .fetch(self.entity, &args, &view.projection, &view.include)
            .await?;
        Ok(rows.pop())
    }

    /// Find one row by a unique key, failing loudly when absent
    pub async fn find_unique_required(&self, key: Record) -> Result<Row> {
        self.find_unique_required_with(key, &View::default()).await
    }

    pub async fn find_unique_required_with(&self, key: Record, view: &View) -> Result<Row> {
        self.find_unique_with(key, view)
            .await?
            .ok_or_else(|| DalError::NotFound {
                entity: self.entity.name.to_string(),
            })
    }

    /// First row matching the arguments, or None
    pub async fn find_first(&self, args: FindArgs) -> Result<Option<Row>> {
        self.find_first_with(args, &View::default()).await
    }

    pub async fn find_first_with(&self, mut args: FindArgs, view: &View) -> Result<Option<Row>> {
        args.take = Some(1);
        let mut rows = Resolver::new(&self.handle)
            .fetch(self.entity, &args, &view.projection, &view.include)
            .await?;
        Ok(rows.pop())
    }

    /// All rows matching the arguments, fully materialized
    pub async fn find_many(&self, args: FindArgs) -> Result<Vec<Row>> {
        self.find_many_with(args, &View::default()).await
    }

    pub async fn find_many_with(&self, args: FindArgs, view: &View) -> Result<Vec<Row>> {
        Resolver::new(&self.handle)
            .fetch(self.entity, &args, &view.projection, &view.include)
            .await
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Insert one row and return it
    pub async fn create(&self, data: Record) -> Result<Row> {
        self.create_with(data, &View::default()).await
    }

    pub async fn create_with(&self, mut data: Record, view: &View) -> Result<Row> {
        self.fill_defaults(&mut data);
        let plan = self
            .builder()
            .insert(&data, ConflictAction::Abort, &self.all_columns())?;
        let raw = self
            .handle
            .fetch_optional(&plan)
            .await?
            .ok_or_else(|| DalError::validation("insert returned no row"))?;
        self.finish_row(raw, view).await
    }

    /// Bulk insert; returns the number of rows stored. With
    /// `skip_duplicates`, unique conflicts are skipped silently;
    /// without it, one conflict fails the whole batch.
    pub async fn create_many(&self, data: Vec<Record>, skip_duplicates: bool) -> Result<u64> {
        let conflict = if skip_duplicates {
            ConflictAction::Ignore
        } else {
            ConflictAction::Abort
        };
        let mut plans = Vec::with_capacity(data.len());
        for mut record in data {
            self.fill_defaults(&mut record);
            plans.push(self.builder().insert(&record, conflict, &[])?);
        }
        self.handle.execute_batch(&plans).await
    }

    /// Update the row addressed by a unique key; NotFound when absent
    pub async fn update(&self, key: Record, data: Record) -> Result<Row> {
        self.update_with(key, data, &View::default()).await
    }

    pub async fn update_with(&self, key: Record, mut data: Record, view: &View) -> Result<Row> {
        let (filter, _) = self.unique_filter(&key)?;
        self.touch_updated_at(&mut data);
        let plan = self
            .builder()
            .update(&filter, &data, None, &self.all_columns())?;
        let raw = self
            .handle
            .fetch_optional(&plan)
            .await?
            .ok_or_else(|| DalError::NotFound {
                entity: self.entity.name.to_string(),
            })?;
        self.finish_row(raw, view).await
    }

    /// Update every row matching `filter` (all rows when None), up to
    /// `limit` rows; returns the affected count.
    pub async fn update_many(
        &self,
        filter: Option<Filter>,
        mut data: Record,
        limit: Option<u32>,
    ) -> Result<u64> {
        self.touch_updated_at(&mut data);
        let filter = filter.unwrap_or(Filter::And(vec![]));
        let plan = self.builder().update(&filter, &data, limit, &[])?;
        self.handle.execute(&plan).await
    }

    /// Insert-or-update, atomic with respect to the unique key
    pub async fn upsert(&self, key: Record, create: Record, update: Record) -> Result<Row> {
        self.upsert_with(key, create, update, &View::default()).await
    }

    pub async fn upsert_with(
        &self,
        key: Record,
        mut create: Record,
        mut update: Record,
        view: &View,
    ) -> Result<Row> {
        let (_, conflict_cols) = self.unique_filter(&key)?;
        // the key addresses the row; the create data must store it too
        for (field, value) in key.iter() {
            if !create.contains(field) {
                create.insert(field, value.clone());
            }
        }
        self.fill_defaults(&mut create);
        if !update.is_empty() {
            self.touch_updated_at(&mut update);
        }
        let plan = self
            .builder()
            .upsert(&conflict_cols, &create, &update, &self.all_columns())?;
        let raw = self
            .handle
            .fetch_optional(&plan)
            .await?
            .ok_or_else(|| DalError::validation("upsert returned no row"))?;
        self.finish_row(raw, view).await
    }

    /// Delete the row addressed by a unique key, returning it;
    /// NotFound when absent
    pub async fn delete(&self, key: Record) -> Result<Row> {
        self.delete_with(key, &View::default()).await
    }

    pub async fn delete_with(&self, key: Record, view: &View) -> Result<Row> {
        let (filter, _) = self.unique_filter(&key)?;

        if view.include.is_empty() {
            let plan = self.builder().delete(&filter, None, &self.all_columns())?;
            let raw = self
                .handle
                .fetch_optional(&plan)
                .await?
                .ok_or_else(|| DalError::NotFound {
                    entity: self.entity.name.to_string(),
                })?;
            return self.finish_row(raw, view).await;
        }

        // relations must be hydrated before the row disappears
        let args = FindArgs::new().filter(filter.clone()).take(1);
        let row = Resolver::new(&self.handle)
            .fetch(self.entity, &args, &view.projection, &view.include)
            .await?
            .pop()
            .ok_or_else(|| DalError::NotFound {
                entity: self.entity.name.to_string(),
            })?;

        let plan = self.builder().delete(&filter, None, &[])?;
        let affected = self.handle.execute(&plan).await?;
        if affected == 0 {
            return Err(DalError::NotFound {
                entity: self.entity.name.to_string(),
            });
        }
        Ok(row)
    }

    /// Delete every row matching `filter` (all rows when None), up to
    /// `limit` rows; returns the affected count.
    pub async fn delete_many(&self, filter: Option<Filter>, limit: Option<u32>) -> Result<u64> {
        let filter = filter.unwrap_or(Filter::And(vec![]));
        let plan = self.builder().delete(&filter, limit, &[])?;
        self.handle.execute(&plan).await
    }

    // ========================================================================
    // Analytics
    // ========================================================================

    /// Count rows matching `filter`
    pub async fn count(&self, filter: Option<Filter>) -> Result<u64> {
        let plan = self.builder().count(filter.as_ref())?;
        let raw = self
            .handle
            .fetch_optional(&plan)
            .await?
            .ok_or_else(|| DalError::validation("count returned no row"))?;
        let count: i64 = raw.try_get("_count").map_err(DalError::from)?;
        Ok(count as u64)
    }

    /// Aggregate matching rows: count, min, max, avg, sum per field
    pub async fn aggregate(
        &self,
        filter: Option<Filter>,
        spec: AggregateSpec,
    ) -> Result<AggregateResult> {
        let plan = self.builder().aggregate(filter.as_ref(), &spec)?;
        let raw = self
            .handle
            .fetch_optional(&plan)
            .await?
            .ok_or_else(|| DalError::validation("aggregate returned no row"))?;

        let mut result = AggregateResult::default();
        if spec.count {
            let count: i64 = raw.try_get("_count").map_err(DalError::from)?;
            result.count = Some(count as u64);
        }
        for field in &spec.min {
            let ty = self.entity.require_field(field)?.ty;
            let v = row::decode_scalar(&raw, &format!("_min_{}", field), ty)?;
            result.min.insert(field.clone(), v);
        }
        for field in &spec.max {
            let ty = self.entity.require_field(field)?.ty;
            let v = row::decode_scalar(&raw, &format!("_max_{}", field), ty)?;
            result.max.insert(field.clone(), v);
        }
        for field in &spec.avg {
            let v: Option<f64> = raw
                .try_get(format!("_avg_{}", field).as_str())
                .map_err(DalError::from)?;
            result.avg.insert(field.clone(), v);
        }
        for field in &spec.sum {
            let v: Option<f64> = raw
                .try_get(format!("_sum_{}", field).as_str())
                .map_err(DalError::from)?;
            result.sum.insert(field.clone(), v);
        }
        Ok(result)
    }

    /// Group rows by a field subset with post-grouping having filters.
    /// Each result row carries the grouping key fields plus aggregate
    /// columns (`_count`, `_min_<field>`, ...).
    pub async fn group_by(&self, spec: GroupBySpec) -> Result<Vec<Row>> {
        let plan = self.builder().group_by(&spec)?;
        let raw = self.handle.fetch_all(&plan).await?;

        let mut rows = Vec::with_capacity(raw.len());
        for r in &raw {
            let mut row = Row::default();
            for field in &spec.by {
                let ty = self.entity.require_field(field)?.ty;
                row.insert_field(field.clone(), row::decode_scalar(r, field, ty)?);
            }
            let agg = &spec.aggregate;
            if agg.count {
                let count: i64 = r.try_get("_count").map_err(DalError::from)?;
                row.insert_field("_count", Value::Int(count));
            }
            for field in &agg.min {
                let ty = self.entity.require_field(field)?.ty;
                let alias = format!("_min_{}", field);
                row.insert_field(alias.clone(), row::decode_scalar(r, &alias, ty)?);
            }
            for field in &agg.max {
                let ty = self.entity.require_field(field)?.ty;
                let alias = format!("_max_{}", field);
                row.insert_field(alias.clone(), row::decode_scalar(r, &alias, ty)?);
            }
            for (kind, fields) in [("avg", &agg.avg), ("sum", &agg.sum)] {
                for field in fields {
                    let alias = format!("_{}_{}", kind, field);
                    let v: Option<f64> = r.try_get(alias.as_str()).map_err(DalError::from)?;
                    row.insert_field(alias.clone(), v.map_or(Value::Null, Value::Float));
                }
            }
            rows.push(row);
        }
        Ok(rows)
    }
}

/// Entry point: a connected database plus the schema registry
#[derive(Clone)]
pub struct Dal {
    db: Db,
}

impl Dal {
    /// Connect using configuration and initialize the schema
    pub async fn connect(config: &crate::config::DatabaseConfig) -> Result<Self> {
        let db = Db::connect(config).await?;
        db.init_schema(registry()).await?;
        Ok(Self { db })
    }

    /// In-memory instance with the schema initialized
    pub async fn in_memory() -> Result<Self> {
        let db = Db::connect_in_memory().await?;
        db.init_schema(registry()).await?;
        Ok(Self { db })
    }

    /// Repository for one entity
    pub fn repo(&self, entity: &str) -> Result<Repository> {
        let def = registry().entity(entity)?;
        Ok(Repository::new(self.db.handle(), def))
    }

    /// Verify connectivity
    pub async fn ping(&self) -> Result<()> {
        self.db.ping().await
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    /// Run a callback inside a transaction (interactive form)
    pub async fn transaction<T, F, Fut>(&self, options: TxOptions, f: F) -> Result<T>
    where
        F: FnOnce(txn::TxRepos) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        txn::interactive(&self.db, options, f).await
    }

    /// Execute a pre-built operation list atomically (array form)
    pub async fn batch(&self, options: TxOptions, ops: Vec<Operation>) -> Result<Vec<OpResult>> {
        txn::batch(&self.db, options, ops).await
    }
}

// ============================================================================
// Tests
// ============================================================================
