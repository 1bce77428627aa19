//! Transaction Coordinator
//!
//! Two ways to run work atomically:
//! - interactive: a callback receives transaction-bound repositories
//!   and decides commit/rollback by its Result
//! - batch: a pre-built operation list executed in order, all-or-nothing
//!
//! Acquiring the transaction respects `max_wait`; the work itself
//! respects `timeout`. Either elapsing rolls back and surfaces
//! `TransactionAborted`.

use crate::db::{Db, DbHandle, SharedTx};
use crate::errors::{DalError, Result};
use crate::query::{Filter, Record};
use crate::repo::{Repository, Row};
use crate::schema::registry;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Requested isolation level. SQLite serializes writers, so levels
/// other than ReadUncommitted are already satisfied by the engine
/// default; ReadUncommitted maps onto the matching pragma.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    /// Longest wait for a transaction slot before aborting
    pub max_wait: Duration,
    /// Longest the transactional work may run before rollback
    pub timeout: Duration,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::Serializable,
            max_wait: Duration::from_secs(2),
            timeout: Duration::from_secs(5),
        }
    }
}

impl TxOptions {
    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Repository factory bound to one in-flight transaction
#[derive(Clone)]
pub struct TxRepos {
    handle: DbHandle,
}

impl TxRepos {
    fn new(tx: SharedTx) -> Self {
        Self {
            handle: DbHandle::Tx(tx),
        }
    }

    /// Repository for one entity, executing inside this transaction
    pub fn repo(&self, entity: &str) -> Result<Repository> {
        let def = registry().entity(entity)?;
        Ok(Repository::new(self.handle.clone(), def))
    }
}

async fn begin(db: &Db, options: &TxOptions) -> Result<SharedTx> {
    let tx = tokio::time::timeout(options.max_wait, db.pool().begin())
        .await
        .map_err(|_| DalError::TransactionAborted {
            reason: format!(
                "could not acquire a transaction within {:?}",
                options.max_wait
            ),
        })??;

    let mut tx = tx;
    if options.isolation == IsolationLevel::ReadUncommitted {
        sqlx::query("PRAGMA read_uncommitted = true")
            .execute(&mut *tx)
            .await?;
    } else {
        debug!(isolation = ?options.isolation, "isolation satisfied by engine default");
    }

    Ok(Arc::new(Mutex::new(tx)))
}

async fn commit(shared: SharedTx) -> Result<()> {
    match Arc::try_unwrap(shared) {
        Ok(mutex) => mutex.into_inner().commit().await.map_err(DalError::from),
        Err(_) => Err(DalError::TransactionAborted {
            reason: "transaction handle still in use at commit".to_string(),
        }),
    }
}

async fn rollback(shared: SharedTx) {
    match Arc::try_unwrap(shared) {
        Ok(mutex) => {
            if let Err(e) = mutex.into_inner().rollback().await {
                warn!(error = %e, "rollback failed");
            }
        }
        // dropping the last handle rolls back implicitly
        Err(_) => warn!("transaction handle leaked past rollback; dropping"),
    }
}

/// Run `f` inside a transaction. An Ok return commits; an Err return,
/// a panic-free timeout, or a failed commit rolls everything back.
pub(crate) async fn interactive<T, F, Fut>(db: &Db, options: TxOptions, f: F) -> Result<T>
where
    F: FnOnce(TxRepos) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let shared = begin(db, &options).await?;
    let repos = TxRepos::new(shared.clone());

    let outcome = tokio::time::timeout(options.timeout, f(repos)).await;
    match outcome {
        Ok(Ok(value)) => {
            commit(shared).await?;
            debug!("transaction committed");
            Ok(value)
        }
        Ok(Err(e)) => {
            rollback(shared).await;
            debug!(error = %e, "transaction rolled back");
            Err(e)
        }
        Err(_) => {
            rollback(shared).await;
            Err(DalError::TransactionAborted {
                reason: format!("transaction exceeded its {:?} timeout", options.timeout),
            })
        }
    }
}

/// One step of an array-form transaction
#[derive(Debug, Clone)]
pub enum Operation {
    Create {
        entity: String,
        data: Record,
    },
    CreateMany {
        entity: String,
        data: Vec<Record>,
        skip_duplicates: bool,
    },
    Update {
        entity: String,
        key: Record,
        data: Record,
    },
    UpdateMany {
        entity: String,
        filter: Option<Filter>,
        data: Record,
        limit: Option<u32>,
    },
    Upsert {
        entity: String,
        key: Record,
        create: Record,
        update: Record,
    },
    Delete {
        entity: String,
        key: Record,
    },
    DeleteMany {
        entity: String,
        filter: Option<Filter>,
        limit: Option<u32>,
    },
}

impl Operation {
    fn entity(&self) -> &str {
        match self {
            Operation::Create { entity, .. }
            | Operation::CreateMany { entity, .. }
            | Operation::Update { entity, .. }
            | Operation::UpdateMany { entity, .. }
            | Operation::Upsert { entity, .. }
            | Operation::Delete { entity, .. }
            | Operation::DeleteMany { entity, .. } => entity,
        }
    }
}

/// Result of one batch step, positionally aligned with the input
#[derive(Debug, Clone, PartialEq)]
pub enum OpResult {
    Row(Row),
    Count(u64),
}

impl OpResult {
    pub fn row(&self) -> Option<&Row> {
        match self {
            OpResult::Row(row) => Some(row),
            OpResult::Count(_) => None,
        }
    }

    pub fn count(&self) -> Option<u64> {
        match self {
            OpResult::Count(n) => Some(*n),
            OpResult::Row(_) => None,
        }
    }
}

/// Execute `ops` in order inside one transaction. The first failure
/// rolls back every earlier step.
pub(crate) async fn batch(db: &Db, options: TxOptions, ops: Vec<Operation>) -> Result<Vec<OpResult>> {
    interactive(db, options, |repos| async move {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            let repo = repos.repo(op.entity())?;
            let result = match op {
                Operation::Create { data, .. } => OpResult::Row(repo.create(data).await?),
                Operation::CreateMany {
                    data,
                    skip_duplicates,
                    ..
                } => OpResult::Count(repo.create_many(data, skip_duplicates).await?),
                Operation::Update { key, data, .. } => {
                    OpResult::Row(repo.update(key, data).await?)
                }
                Operation::UpdateMany {
                    filter,
                    data,
                    limit,
                    ..
                } => OpResult::Count(repo.update_many(filter, data, limit).await?),
                Operation::Upsert {
                    key,
                    create,
                    update,
                    ..
                } => OpResult::Row(repo.upsert(key, create, update).await?),
                Operation::Delete { key, .. } => OpResult::Row(repo.delete(key).await?),
                Operation::DeleteMany { filter, limit, .. } => {
                    OpResult::Count(repo.delete_many(filter, limit).await?)
                }
            };
            results.push(result);
        }
        Ok(results)
    })
    .await
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = TxOptions::default();
        assert_eq!(opts.isolation, IsolationLevel::Serializable);
        assert_eq!(opts.max_wait, Duration::from_secs(2));
        assert_eq!(opts.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_options_builder() {
        let opts = TxOptions::default()
            .isolation(IsolationLevel::ReadUncommitted)
            .max_wait(Duration::from_millis(100))
            .timeout(Duration::from_secs(30));
        assert_eq!(opts.isolation, IsolationLevel::ReadUncommitted);
        assert_eq!(opts.max_wait, Duration::from_millis(100));
        assert_eq!(opts.timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_operation_entity() {
        let op = Operation::Delete {
            entity: "user".to_string(),
            key: Record::new(),
        };
        assert_eq!(op.entity(), "user");
    }

    #[test]
    fn test_op_result_accessors() {
        let count = OpResult::Count(3);
        assert_eq!(count.count(), Some(3));
        assert!(count.row().is_none());
    }

    use crate::repo::Dal;

    fn client_record(tax_id: &str, email: &str) -> Record {
        Record::new()
            .set("tax_id", tax_id)
            .set("first_name", "Ada")
            .set("last_name", "Rossi")
            .set("email", email)
    }

    #[tokio::test]
    async fn test_commit_makes_writes_visible() {
        let dal = Dal::in_memory().await.unwrap();
        dal.transaction(TxOptions::default(), |repos| async move {
            let clients = repos.repo("client")?;
            clients.create(client_record("T1", "a@x.com")).await?;
            clients.create(client_record("T2", "b@x.com")).await?;
            Ok(())
        })
        .await
        .unwrap();

        let count = dal.repo("client").unwrap().count(None).await.unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_error_rolls_back_every_write() {
        let dal = Dal::in_memory().await.unwrap();
        let result: Result<()> = dal
            .transaction(TxOptions::default(), |repos| async move {
                let clients = repos.repo("client")?;
                clients.create(client_record("T1", "a@x.com")).await?;
                // the duplicate aborts the whole transaction
                clients.create(client_record("T2", "a@x.com")).await?;
                Ok(())
            })
            .await;
        assert!(matches!(
            result,
            Err(DalError::UniqueConstraintViolation { .. })
        ));

        let count = dal.repo("client").unwrap().count(None).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_dependent_insert_failure_leaves_no_partial_writes() {
        let dal = Dal::in_memory().await.unwrap();
        let result: Result<()> = dal
            .transaction(TxOptions::default(), |repos| async move {
                repos
                    .repo("client")?
                    .create(client_record("T1", "a@x.com"))
                    .await?;
                // points at a client that does not exist
                repos
                    .repo("property")?
                    .create(
                        Record::new()
                            .set("cadastral_code", "C1")
                            .set("address", "Via Roma 1")
                            .set("city", "Rome")
                            .set("client_id", uuid::Uuid::new_v4()),
                    )
                    .await?;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(DalError::ForeignKeyViolation { .. })));

        let count = dal.repo("client").unwrap().count(None).await.unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_work_timeout_aborts() {
        let dal = Dal::in_memory().await.unwrap();
        let options = TxOptions::default().timeout(Duration::from_millis(20));
        let result: Result<()> = dal
            .transaction(options, |_repos| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(DalError::TransactionAborted { .. })));
    }

    #[tokio::test]
    async fn test_batch_results_align_with_operations() {
        let dal = Dal::in_memory().await.unwrap();
        let results = dal
            .batch(
                TxOptions::default(),
                vec![
                    Operation::Create {
                        entity: "client".to_string(),
                        data: client_record("T1", "a@x.com"),
                    },
                    Operation::CreateMany {
                        entity: "client".to_string(),
                        data: vec![
                            client_record("T2", "b@x.com"),
                            client_record("T3", "c@x.com"),
                        ],
                        skip_duplicates: false,
                    },
                    Operation::DeleteMany {
                        entity: "client".to_string(),
                        filter: Some(Filter::eq("tax_id", "T3")),
                        limit: None,
                    },
                ],
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].row().unwrap().str("tax_id"), Some("T1"));
        assert_eq!(results[1].count(), Some(2));
        assert_eq!(results[2].count(), Some(1));

        let count = dal.repo("client").unwrap().count(None).await.unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_batch_failure_rolls_back_earlier_steps() {
        let dal = Dal::in_memory().await.unwrap();
        let result = dal
            .batch(
                TxOptions::default(),
                vec![
                    Operation::Create {
                        entity: "client".to_string(),
                        data: client_record("T1", "a@x.com"),
                    },
                    Operation::Delete {
                        entity: "client".to_string(),
                        key: Record::new().set("tax_id", "MISSING"),
                    },
                ],
            )
            .await;
        assert!(matches!(result, Err(DalError::NotFound { .. })));

        let count = dal.repo("client").unwrap().count(None).await.unwrap();
        assert_eq!(count, 0);
    }
}
