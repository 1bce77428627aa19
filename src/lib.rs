//! praxisdb — a typed data-access layer over SQLite
//!
//! Replaces ad-hoc per-entity SQL with one schema-driven stack:
//! - Schema Registry: entity descriptors (fields, keys, relations) for
//!   the whole business domain, queried by name at runtime
//! - Query Builder: validated filter/sort/page/aggregate plans compiled
//!   to parameterized SQL
//! - Entity Repository: one generic CRUD and analytics surface shared
//!   by every entity
//! - Relation Resolver: batched hydration of include graphs without
//!   per-row queries
//! - Transaction Coordinator: interactive callbacks and operation
//!   batches with commit/rollback semantics
//!
//! Entry point is [`Dal`]: connect, grab a [`Repository`] per entity,
//! and go.

pub mod config;
pub mod db;
pub mod errors;
pub mod query;
pub mod relation;
pub mod repo;
pub mod schema;
pub mod txn;

pub use config::{AppConfig, DatabaseConfig};
pub use db::{Db, DbHandle};
pub use errors::{DalError, ErrorCode, Result};
pub use query::{
    AggregateResult, AggregateSpec, Cond, ConflictAction, Cursor, Filter, FindArgs, GroupBySpec,
    NullsOrder, Op, OrderSpec, Projection, Record, SortDir, Value,
};
pub use relation::{Include, RelationArgs};
pub use repo::{Dal, Related, Repository, Row, View};
pub use schema::{
    registry, DefaultValue, EntityDef, FieldDef, PaymentMethod, PaymentStatus, PermissionAction,
    PermissionResource, RelationDef, RelationKind, ScalarType, SchemaRegistry,
};
pub use txn::{IsolationLevel, OpResult, Operation, TxOptions, TxRepos};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
