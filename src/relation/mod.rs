//! Relation Resolver
//!
//! Given a root result set and an include graph, fetches and attaches
//! related rows in batched `IN` queries:
//!
//! - belongs-to edges resolve through the foreign key; a null FK resolves
//!   to null, never an error
//! - has-many edges are fetched once and grouped per parent, with any
//!   per-relation take/skip applied inside each parent's group
//! - many-to-many edges resolve through the join entity and surface the
//!   join rows themselves (keeping their scalar metadata, e.g.
//!   `assigned_at`), each with the far side nested under its relation
//!   name; per-relation filter/order apply to the join rows
//!
//! Projections that omit keys needed for stitching fetch them anyway and
//! strip them from the output afterwards.

use crate::db::DbHandle;
use crate::errors::{DalError, Result};
use crate::query::{Filter, FindArgs, OrderSpec, Projection, QueryBuilder, Value};
use crate::repo::row::{decode_row, Related, Row};
use crate::schema::{registry, EntityDef, RelationKind, ScalarType};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Per-relation arguments: a nested filter/order/page over the related
/// rows, a projection for the related entity's scalars, and a nested
/// include applied one level further down.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationArgs {
    pub filter: Option<Filter>,
    pub order: Vec<OrderSpec>,
    pub take: Option<u32>,
    pub skip: Option<u32>,
    pub distinct: Vec<String>,
    pub projection: Projection,
    pub include: Include,
}

impl RelationArgs {
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

    pub fn projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    pub fn include(mut self, include: Include) -> Self {
        self.include = include;
        self
    }

    fn has_page_args(&self) -> bool {
        self.filter.is_some()
            || !self.order.is_empty()
            || self.take.is_some()
            || self.skip.is_some()
            || !self.distinct.is_empty()
    }
}

/// An include graph naming relation edges to hydrate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Include {
    entries: BTreeMap<String, RelationArgs>,
}

impl Include {
    pub fn new() -> Self {
        Self::default()
    }

    /// Include a relation with default arguments
    pub fn relation(mut self, name: impl Into<String>) -> Self {
        self.entries.insert(name.into(), RelationArgs::default());
        self
    }

    /// Include a relation with explicit arguments
    pub fn relation_with(mut self, name: impl Into<String>, args: RelationArgs) -> Self {
        self.entries.insert(name.into(), args);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&str, &RelationArgs)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }
}

fn push_unique(v: &mut Vec<&'static str>, col: &'static str) {
    if !v.contains(&col) {
        v.push(col);
    }
}

/// Resolve a projection to output columns plus the superset of columns
/// that must actually be fetched (primary key, FKs feeding the include
/// graph). Also validates that every included relation exists.
pub(crate) fn fetch_columns(
    entity: &EntityDef,
    projection: &Projection,
    include: &Include,
) -> Result<(Vec<&'static str>, Vec<&'static str>)> {
    let out = projection.output_fields(entity)?;
    let mut fetch = out.clone();

    for pk in &entity.primary_key {
        push_unique(&mut fetch, pk);
    }
    for (name, _args) in include.iter() {
        let rel = entity
            .relation(name)
            .ok_or_else(|| DalError::validation_field(
                format!("unknown relation {} on entity {}", name, entity.name),
                name,
            ))?;
        if let RelationKind::BelongsTo { foreign_key, .. } = &rel.kind {
            push_unique(&mut fetch, foreign_key);
        }
    }
    Ok((out, fetch))
}

/// Drop columns that were fetched for stitching but not requested
pub(crate) fn strip_extras(rows: &mut [Row], out: &[&'static str], fetch: &[&'static str]) {
    for col in fetch {
        if !out.contains(col) {
            for row in rows.iter_mut() {
                row.remove_field(col);
            }
        }
    }
}

fn typed_columns(entity: &EntityDef, cols: &[&'static str]) -> Vec<(&'static str, ScalarType)> {
    cols.iter()
        .map(|c| {
            let ty = entity.field(c).map(|f| f.ty).unwrap_or(ScalarType::Text);
            (*c, ty)
        })
        .collect()
}

/// Batched relation hydration over one executor handle
pub(crate) struct Resolver<'a> {
    handle: &'a DbHandle,
}

impl<'a> Resolver<'a> {
    pub fn new(handle: &'a DbHandle) -> Self {
        Self { handle }
    }

    /// Fetch rows of `entity` matching `args`, hydrate `include`, and
    /// strip stitching columns. The entry point for every read path.
    pub async fn fetch(
        &self,
        entity: &'static EntityDef,
        args: &FindArgs,
        projection: &Projection,
        include: &Include,
    ) -> Result<Vec<Row>> {
        let (out, mut fetch) = fetch_columns(entity, projection, include)?;
        if !args.distinct.is_empty() {
            if !include.is_empty() {
                return Err(DalError::validation(
                    "distinct cannot be combined with include",
                ));
            }
            // no include graph means no stitching keys; fetch exactly
            // the projected columns so the distinct subset rule holds
            fetch = out.clone();
        }

        let qb = QueryBuilder::new(entity);
        let plan = qb.select(&fetch, args)?;
        let raw = self.handle.fetch_all(&plan).await?;

        let cols = typed_columns(entity, &fetch);
        let mut rows = raw
            .iter()
            .map(|r| decode_row(r, &cols))
            .collect::<Result<Vec<_>>>()?;

        self.attach(entity, &mut rows, include).await?;
        strip_extras(&mut rows, &out, &fetch);
        Ok(rows)
    }

    /// Attach every included relation onto `rows`
    pub fn attach<'f>(
        &'f self,
        entity: &'static EntityDef,
        rows: &'f mut Vec<Row>,
        include: &'f Include,
    ) -> BoxFuture<'f, Result<()>> {
        Box::pin(async move {
            if rows.is_empty() || include.is_empty() {
                return Ok(());
            }
            for (name, args) in include.iter() {
                let rel = entity.relation(name).ok_or_else(|| {
                    DalError::validation_field(
                        format!("unknown relation {} on entity {}", name, entity.name),
                        name,
                    )
                })?;
                match &rel.kind {
                    RelationKind::BelongsTo { foreign_key, .. } => {
                        self.attach_belongs_to(rel.target, name, foreign_key, args, rows)
                            .await?;
                    }
                    RelationKind::HasMany { foreign_key } => {
                        self.attach_has_many(entity, rel.target, name, foreign_key, args, rows)
                            .await?;
                    }
                    RelationKind::ManyToMany {
                        join_entity,
                        near_key,
                        far_relation,
                    } => {
                        self.attach_many_to_many(
                            entity,
                            join_entity,
                            near_key,
                            far_relation,
                            name,
                            args,
                            rows,
                        )
                        .await?;
                    }
                }
            }
            Ok(())
        })
    }

    async fn attach_belongs_to(
        &self,
        target_name: &'static str,
        rel_name: &str,
        foreign_key: &'static str,
        args: &RelationArgs,
        rows: &mut Vec<Row>,
    ) -> Result<()> {
        if args.has_page_args() {
            return Err(DalError::validation_field(
                format!("filter/order/take/skip do not apply to to-one relation {}", rel_name),
                rel_name,
            ));
        }
        let target = registry().entity(target_name)?;
        let target_pk = target.single_pk()?;

        let mut keys: Vec<Value> = Vec::new();
        let mut seen: HashMap<String, ()> = HashMap::new();
        for row in rows.iter() {
            if let Some(v) = row.get(foreign_key) {
                if let Some(k) = v.as_key() {
                    if seen.insert(k, ()).is_none() {
                        keys.push(v.clone());
                    }
                }
            }
        }

        let mut by_pk: HashMap<String, Row> = HashMap::new();
        if !keys.is_empty() {
            let (out, fetch) = fetch_columns(target, &args.projection, &args.include)?;
            let qb = QueryBuilder::new(target);
            let plan = qb.select(
                &fetch,
                &FindArgs::new().filter(Filter::in_(target_pk, keys)),
            )?;
            let raw = self.handle.fetch_all(&plan).await?;
            let cols = typed_columns(target, &fetch);
            let mut fetched = raw
                .iter()
                .map(|r| decode_row(r, &cols))
                .collect::<Result<Vec<_>>>()?;
            self.attach(target, &mut fetched, &args.include).await?;
            strip_extras(&mut fetched, &out, &fetch);
            // pk may have been stripped from the output; key on the fetched copy
            for (raw_row, row) in raw.iter().zip(fetched.into_iter()) {
                let key = crate::repo::row::decode_scalar(
                    raw_row,
                    target_pk,
                    target.require_field(target_pk)?.ty,
                )?;
                if let Some(k) = key.as_key() {
                    by_pk.insert(k, row);
                }
            }
        }

        for row in rows.iter_mut() {
            let related = row
                .get(foreign_key)
                .and_then(Value::as_key)
                .and_then(|k| by_pk.get(&k))
                .cloned();
            row.set_relation(rel_name, Related::One(related.map(Box::new)));
        }
        Ok(())
    }

    async fn attach_has_many(
        &self,
        parent: &'static EntityDef,
        target_name: &'static str,
        rel_name: &str,
        foreign_key: &'static str,
        args: &RelationArgs,
        rows: &mut Vec<Row>,
    ) -> Result<()> {
        let target = registry().entity(target_name)?;
        let parent_pk = parent.single_pk()?;

        let parent_ids: Vec<Value> = rows
            .iter()
            .filter_map(|r| r.get(parent_pk).filter(|v| !v.is_null()).cloned())
            .collect();

        let mut groups = self
            .fetch_grouped(target, foreign_key, parent_ids, args)
            .await?;

        for row in rows.iter_mut() {
            let children = row
                .get(parent_pk)
                .and_then(Value::as_key)
                .and_then(|k| groups.remove(&k))
                .unwrap_or_default();
            row.set_relation(rel_name, Related::Many(children));
        }
        Ok(())
    }

    async fn attach_many_to_many(
        &self,
        parent: &'static EntityDef,
        join_entity: &'static str,
        near_key: &'static str,
        far_relation: &'static str,
        rel_name: &str,
        args: &RelationArgs,
        rows: &mut Vec<Row>,
    ) -> Result<()> {
        let join = registry().entity(join_entity)?;
        let parent_pk = parent.single_pk()?;

        let parent_ids: Vec<Value> = rows
            .iter()
            .filter_map(|r| r.get(parent_pk).filter(|v| !v.is_null()).cloned())
            .collect();

        // The join rows keep all their scalars; the caller's projection
        // and nested include apply to the far side.
        let join_args = RelationArgs {
            filter: args.filter.clone(),
            order: args.order.clone(),
            take: args.take,
            skip: args.skip,
            distinct: args.distinct.clone(),
            projection: Projection::All,
            include: Include::new().relation_with(
                far_relation,
                RelationArgs::new()
                    .projection(args.projection.clone())
                    .include(args.include.clone()),
            ),
        };
        join.relation(far_relation).ok_or_else(|| {
            DalError::validation_field(
                format!("join entity {} has no relation {}", join_entity, far_relation),
                far_relation,
            )
        })?;

        let mut groups = self
            .fetch_grouped(join, near_key, parent_ids, &join_args)
            .await?;

        for row in rows.iter_mut() {
            let links = row
                .get(parent_pk)
                .and_then(Value::as_key)
                .and_then(|k| groups.remove(&k))
                .unwrap_or_default();
            row.set_relation(rel_name, Related::Many(links));
        }
        Ok(())
    }

    /// Fetch `target` rows whose `key_col` falls in `keys`, hydrate nested
    /// includes, and return them grouped by `key_col`, with per-group
    /// take/skip applied.
    async fn fetch_grouped(
        &self,
        target: &'static EntityDef,
        key_col: &'static str,
        keys: Vec<Value>,
        args: &RelationArgs,
    ) -> Result<HashMap<String, Vec<Row>>> {
        let mut groups: HashMap<String, Vec<Row>> = HashMap::new();
        if keys.is_empty() {
            return Ok(groups);
        }

        let (out, mut fetch) = fetch_columns(target, &args.projection, &args.include)?;
        if !args.distinct.is_empty() {
            if !args.include.is_empty() {
                return Err(DalError::validation(
                    "distinct cannot be combined with include",
                ));
            }
            fetch = out.clone();
        }
        push_unique(&mut fetch, key_col);

        let membership = Filter::in_(key_col, keys);
        let filter = match &args.filter {
            Some(f) => Filter::and([f.clone(), membership]),
            None => membership,
        };
        let mut find = FindArgs::new().filter(filter);
        find.order = args.order.clone();
        if !args.distinct.is_empty() {
            // deduplicate within each parent's group: the grouping key
            // joins the distinct set so rows under different parents
            // never collapse together
            let mut distinct = args.distinct.clone();
            if !distinct.iter().any(|d| d == key_col) {
                distinct.push(key_col.to_string());
            }
            find.distinct = distinct;
        }

        let qb = QueryBuilder::new(target);
        let plan = qb.select(&fetch, &find)?;
        let raw = self.handle.fetch_all(&plan).await?;
        let cols = typed_columns(target, &fetch);
        let mut fetched = raw
            .iter()
            .map(|r| decode_row(r, &cols))
            .collect::<Result<Vec<_>>>()?;

        self.attach(target, &mut fetched, &args.include).await?;

        for row in fetched {
            if let Some(k) = row.get(key_col).and_then(Value::as_key) {
                groups.entry(k).or_default().push(row);
            }
        }

        // per-parent pagination, then strip stitching columns
        let skip = args.skip.unwrap_or(0) as usize;
        for rows in groups.values_mut() {
            if skip > 0 {
                rows.drain(..skip.min(rows.len()));
            }
            if let Some(take) = args.take {
                rows.truncate(take as usize);
            }
            strip_extras(rows, &out, &fetch);
        }
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::registry;

    #[test]
    fn test_fetch_columns_adds_stitching_keys() {
        let service = registry().entity("service").unwrap();
        let include = Include::new().relation("property");
        let projection = Projection::select(["description"]);
        let (out, fetch) = fetch_columns(service, &projection, &include).unwrap();
        assert_eq!(out, vec!["description"]);
        assert!(fetch.contains(&"id"));
        assert!(fetch.contains(&"property_id"));
    }

    #[test]
    fn test_fetch_columns_rejects_unknown_relation() {
        let client = registry().entity("client").unwrap();
        let include = Include::new().relation("bogus");
        assert!(fetch_columns(client, &Projection::All, &include).is_err());
    }

    #[test]
    fn test_strip_extras() {
        let mut row = Row::default();
        row.insert_field("description", Value::Text("x".into()));
        row.insert_field("id", Value::Text("y".into()));
        let mut rows = vec![row];
        strip_extras(&mut rows, &["description"], &["description", "id"]);
        assert!(rows[0].get("id").is_none());
        assert!(rows[0].get("description").is_some());
    }

    use crate::query::Record;
    use crate::repo::{Dal, Related, View};
    use chrono::Utc;
    use uuid::Uuid;

    async fn seeded_client(dal: &Dal) -> Uuid {
        let row = dal
            .repo("client")
            .unwrap()
            .create(
                Record::new()
                    .set("tax_id", "T1")
                    .set("first_name", "Ada")
                    .set("last_name", "Rossi")
                    .set("email", "ada@example.com"),
            )
            .await
            .unwrap();
        row.uuid("id").unwrap()
    }

    #[tokio::test]
    async fn test_include_has_many_groups_children() {
        let dal = Dal::in_memory().await.unwrap();
        let client_id = seeded_client(&dal).await;
        let properties = dal.repo("property").unwrap();
        for (code, city) in [("C1", "Rome"), ("C2", "Milan")] {
            properties
                .create(
                    Record::new()
                        .set("cadastral_code", code)
                        .set("address", "Via Roma 1")
                        .set("city", city)
                        .set("client_id", client_id),
                )
                .await
                .unwrap();
        }

        let view = View::new().include(Include::new().relation_with(
            "properties",
            RelationArgs::new().order_by(OrderSpec::asc("cadastral_code")),
        ));
        let row = dal
            .repo("client")
            .unwrap()
            .find_unique_required_with(Record::new().set("tax_id", "T1"), &view)
            .await
            .unwrap();

        let props = row.related_many("properties");
        assert_eq!(props.len(), 2);
        assert_eq!(props[0].str("cadastral_code"), Some("C1"));
        assert_eq!(props[1].str("city"), Some("Milan"));
    }

    #[tokio::test]
    async fn test_include_null_belongs_to_resolves_to_null() {
        let dal = Dal::in_memory().await.unwrap();
        let client_id = seeded_client(&dal).await;
        let type_id = dal
            .repo("service_type")
            .unwrap()
            .create(Record::new().set("name", "Filing"))
            .await
            .unwrap()
            .uuid("id")
            .unwrap();
        dal.repo("service")
            .unwrap()
            .create(
                Record::new()
                    .set("description", "Annual filing")
                    .set("date", Utc::now())
                    .set("amount", 120.0)
                    .set("client_id", client_id)
                    .set("service_type_id", type_id),
            )
            .await
            .unwrap();

        let view = View::new().include(Include::new().relation("property").relation("client"));
        let row = dal
            .repo("service")
            .unwrap()
            .find_first_with(FindArgs::new(), &view)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(row.related("property"), Some(Related::One(None))));
        let client = row.related_one("client").unwrap();
        assert_eq!(client.str("tax_id"), Some("T1"));
    }

    #[tokio::test]
    async fn test_include_many_to_many_surfaces_join_rows() {
        let dal = Dal::in_memory().await.unwrap();
        let roles = dal.repo("role").unwrap();
        let role_id = roles
            .create(Record::new().set("name", "admin"))
            .await
            .unwrap()
            .uuid("id")
            .unwrap();
        let permission_id = dal
            .repo("permission")
            .unwrap()
            .create(Record::new().set("action", "MANAGE").set("resource", "USERS"))
            .await
            .unwrap()
            .uuid("id")
            .unwrap();
        dal.repo("role_permission")
            .unwrap()
            .create(
                Record::new()
                    .set("role_id", role_id)
                    .set("permission_id", permission_id),
            )
            .await
            .unwrap();

        let view = View::new().include(Include::new().relation("permissions"));
        let row = roles
            .find_unique_required_with(Record::new().set("name", "admin"), &view)
            .await
            .unwrap();

        let links = row.related_many("permissions");
        assert_eq!(links.len(), 1);
        // the join row keeps its own scalars and nests the far side
        assert!(links[0].datetime("assigned_at").is_some());
        let permission = links[0].related_one("permission").unwrap();
        assert_eq!(permission.str("action"), Some("MANAGE"));
        assert_eq!(permission.str("resource"), Some("USERS"));
    }

    #[tokio::test]
    async fn test_include_has_many_distinct_within_parent() {
        let dal = Dal::in_memory().await.unwrap();
        let client_id = seeded_client(&dal).await;
        let properties = dal.repo("property").unwrap();
        for (code, city) in [("C1", "Rome"), ("C2", "Rome"), ("C3", "Milan")] {
            properties
                .create(
                    Record::new()
                        .set("cadastral_code", code)
                        .set("address", "Via Roma 1")
                        .set("city", city)
                        .set("client_id", client_id),
                )
                .await
                .unwrap();
        }

        let view = View::new().include(Include::new().relation_with(
            "properties",
            RelationArgs::new()
                .distinct(["city"])
                .projection(Projection::select(["city"])),
        ));
        let row = dal
            .repo("client")
            .unwrap()
            .find_unique_required_with(Record::new().set("tax_id", "T1"), &view)
            .await
            .unwrap();

        let mut cities: Vec<&str> = row
            .related_many("properties")
            .iter()
            .filter_map(|p| p.str("city"))
            .collect();
        cities.sort_unstable();
        assert_eq!(cities, vec!["Milan", "Rome"]);
    }

    #[tokio::test]
    async fn test_include_rejects_page_args_on_to_one() {
        let dal = Dal::in_memory().await.unwrap();
        let client_id = seeded_client(&dal).await;
        dal.repo("subject")
            .unwrap()
            .create(
                Record::new()
                    .set("tax_id", "S1")
                    .set("first_name", "Ugo")
                    .set("last_name", "Bianchi")
                    .set("client_id", client_id),
            )
            .await
            .unwrap();

        let view = View::new().include(Include::new().relation_with(
            "client",
            RelationArgs::new().take(1),
        ));
        let err = dal
            .repo("subject")
            .unwrap()
            .find_many_with(FindArgs::new(), &view)
            .await
            .unwrap_err();
        assert!(matches!(err, DalError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_distinct_cannot_combine_with_include() {
        let dal = Dal::in_memory().await.unwrap();
        let view = View::new()
            .projection(Projection::select(["city"]))
            .include(Include::new().relation("client"));
        let err = dal
            .repo("property")
            .unwrap()
            .find_many_with(FindArgs::new().distinct(["city"]), &view)
            .await
            .unwrap_err();
        assert!(matches!(err, DalError::Validation { .. }));
    }
}
