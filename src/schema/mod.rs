//! Schema Registry for praxisdb
//!
//! Static, read-only description of each entity: scalar fields, primary
//! keys, unique constraints, and relation edges. Everything else in the
//! crate (query builder, repository, relation resolver) reads from it;
//! nothing writes to it after startup.

pub mod domain;

pub use domain::{registry, PaymentMethod, PaymentStatus, PermissionAction, PermissionResource};

use crate::errors::{DalError, Result};
use serde::{Deserialize, Serialize};

/// Scalar column types supported by the layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarType {
    Text,
    Int,
    Float,
    Bool,
    Uuid,
    DateTime,
}

impl ScalarType {
    /// SQL column type for DDL emission
    pub fn sql_type(&self) -> &'static str {
        match self {
            ScalarType::Text | ScalarType::Uuid | ScalarType::DateTime => "TEXT",
            ScalarType::Int => "INTEGER",
            ScalarType::Float => "REAL",
            ScalarType::Bool => "BOOLEAN",
        }
    }
}

/// Column default filled in by the repository at insert time
#[derive(Debug, Clone, PartialEq)]
pub enum DefaultValue {
    /// Fresh v4 UUID
    UuidV4,
    /// Current UTC timestamp
    Now,
    Bool(bool),
    Int(i64),
    Text(&'static str),
}

/// A scalar field on an entity
#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: &'static str,
    pub ty: ScalarType,
    pub nullable: bool,
    pub default: Option<DefaultValue>,
}

impl FieldDef {
    pub fn required(name: &'static str, ty: ScalarType) -> Self {
        Self {
            name,
            ty,
            nullable: false,
            default: None,
        }
    }

    pub fn optional(name: &'static str, ty: ScalarType) -> Self {
        Self {
            name,
            ty,
            nullable: true,
            default: None,
        }
    }

    pub fn with_default(mut self, default: DefaultValue) -> Self {
        self.default = Some(default);
        self
    }
}

/// Kind of a relation edge
#[derive(Debug, Clone)]
pub enum RelationKind {
    /// One-to-many: the target entity holds `foreign_key` pointing back here
    HasMany { foreign_key: &'static str },

    /// Many-to-one: this entity holds `foreign_key` pointing at the target
    BelongsTo {
        foreign_key: &'static str,
        nullable: bool,
    },

    /// Many-to-many through a join entity. Resolution surfaces the join
    /// rows themselves (they carry their own scalar metadata); the far
    /// side is attached through `far_relation`, the belongs-to edge on
    /// the join entity pointing away from this one.
    ManyToMany {
        join_entity: &'static str,
        near_key: &'static str,
        far_relation: &'static str,
    },
}

/// A named relation edge from one entity to another
#[derive(Debug, Clone)]
pub struct RelationDef {
    pub name: &'static str,
    pub target: &'static str,
    pub kind: RelationKind,
}

/// Static description of one entity
#[derive(Debug, Clone)]
pub struct EntityDef {
    /// Logical entity name, e.g. "client"
    pub name: &'static str,
    /// Backing table name, e.g. "clients"
    pub table: &'static str,
    pub fields: Vec<FieldDef>,
    /// Primary key columns (composite for join entities)
    pub primary_key: Vec<&'static str>,
    /// Unique constraints beyond the primary key
    pub uniques: Vec<Vec<&'static str>>,
    pub relations: Vec<RelationDef>,
}

impl EntityDef {
    /// Look up a scalar field by name
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up a scalar field, failing with UnknownField
    pub fn require_field(&self, name: &str) -> Result<&FieldDef> {
        self.field(name).ok_or_else(|| DalError::UnknownField {
            entity: self.name.to_string(),
            field: name.to_string(),
        })
    }

    /// All scalar field names, in declaration order
    pub fn scalar_names(&self) -> Vec<&'static str> {
        self.fields.iter().map(|f| f.name).collect()
    }

    /// Look up a relation edge by name
    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Single-column primary key, or a validation error for composite keys
    pub fn single_pk(&self) -> Result<&'static str> {
        if self.primary_key.len() == 1 {
            Ok(self.primary_key[0])
        } else {
            Err(DalError::validation(format!(
                "entity {} has a composite primary key",
                self.name
            )))
        }
    }

    /// Match a set of field names against the primary key or a unique
    /// constraint. Returns the matched constraint columns, order-insensitive.
    pub fn matching_unique(&self, keys: &[&str]) -> Option<Vec<&'static str>> {
        let set_eq = |cols: &[&'static str]| {
            cols.len() == keys.len() && cols.iter().all(|c| keys.contains(c))
        };

        if set_eq(&self.primary_key) {
            return Some(self.primary_key.clone());
        }
        self.uniques.iter().find(|u| set_eq(u)).cloned()
    }

    /// Emit `CREATE TABLE IF NOT EXISTS` DDL for this entity
    pub fn create_table_sql(&self, registry: &SchemaRegistry) -> Result<String> {
        let mut parts: Vec<String> = Vec::new();

        for f in &self.fields {
            let mut col = format!("\"{}\" {}", f.name, f.ty.sql_type());
            if !f.nullable {
                col.push_str(" NOT NULL");
            }
            parts.push(col);
        }

        let pk_cols: Vec<String> = self
            .primary_key
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect();
        parts.push(format!("PRIMARY KEY ({})", pk_cols.join(", ")));

        for unique in &self.uniques {
            let cols: Vec<String> = unique.iter().map(|c| format!("\"{}\"", c)).collect();
            parts.push(format!("UNIQUE ({})", cols.join(", ")));
        }

        for rel in &self.relations {
            if let RelationKind::BelongsTo { foreign_key, .. } = &rel.kind {
                let target = registry.entity(rel.target)?;
                parts.push(format!(
                    "FOREIGN KEY (\"{}\") REFERENCES \"{}\" (\"{}\")",
                    foreign_key,
                    target.table,
                    target.single_pk()?
                ));
            }
        }

        Ok(format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (\n    {}\n)",
            self.table,
            parts.join(",\n    ")
        ))
    }
}

/// The full set of entity descriptors
#[derive(Debug)]
pub struct SchemaRegistry {
    entities: Vec<EntityDef>,
}

impl SchemaRegistry {
    pub fn new(entities: Vec<EntityDef>) -> Self {
        Self { entities }
    }

    /// Look up an entity by logical name
    pub fn entity(&self, name: &str) -> Result<&EntityDef> {
        self.entities
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| DalError::UnknownEntity {
                name: name.to_string(),
            })
    }

    /// All registered entities, in declaration order
    pub fn entities(&self) -> &[EntityDef] {
        &self.entities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_holds_all_entities() {
        let reg = registry();
        for name in [
            "role",
            "permission",
            "role_permission",
            "user",
            "client",
            "subject",
            "property",
            "service_type",
            "service",
            "payment",
            "service_payment",
        ] {
            assert!(reg.entity(name).is_ok(), "missing entity {}", name);
        }
        assert!(matches!(
            reg.entity("nonexistent"),
            Err(DalError::UnknownEntity { .. })
        ));
    }

    #[test]
    fn test_matching_unique() {
        let client = registry().entity("client").unwrap();
        assert_eq!(client.matching_unique(&["id"]), Some(vec!["id"]));
        assert_eq!(client.matching_unique(&["tax_id"]), Some(vec!["tax_id"]));
        assert_eq!(client.matching_unique(&["first_name"]), None);

        let perm = registry().entity("permission").unwrap();
        // order-insensitive composite match
        assert!(perm.matching_unique(&["resource", "action"]).is_some());
        assert!(perm.matching_unique(&["action"]).is_none());
    }

    #[test]
    fn test_composite_primary_keys() {
        let rp = registry().entity("role_permission").unwrap();
        assert_eq!(rp.primary_key, vec!["role_id", "permission_id"]);
        assert!(rp.single_pk().is_err());
        assert!(rp
            .matching_unique(&["role_id", "permission_id"])
            .is_some());
    }

    #[test]
    fn test_service_relation_nullability() {
        let service = registry().entity("service").unwrap();

        let required = |name: &str| match &service.relation(name).unwrap().kind {
            RelationKind::BelongsTo { nullable, .. } => !*nullable,
            _ => panic!("{} is not belongs-to", name),
        };

        // Asymmetric on purpose: client/service_type required, property/user optional
        assert!(required("client"));
        assert!(required("service_type"));
        assert!(!required("property"));
        assert!(!required("user"));
    }

    #[test]
    fn test_create_table_sql() {
        let reg = registry();
        let subject = reg.entity("subject").unwrap();
        let sql = subject.create_table_sql(reg).unwrap();
        assert!(sql.starts_with("CREATE TABLE IF NOT EXISTS \"subjects\""));
        assert!(sql.contains("\"tax_id\" TEXT NOT NULL"));
        assert!(sql.contains("UNIQUE (\"tax_id\")"));
        assert!(sql.contains("FOREIGN KEY (\"client_id\") REFERENCES \"clients\" (\"id\")"));
    }
}
