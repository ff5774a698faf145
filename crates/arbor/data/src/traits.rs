use crate::{DataResult, IsolationLevel, LockMode, RecordSet, Statement, TransactionStatus};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;

/// A data server: provisions databases and opens connections to them
#[async_trait]
pub trait DataServer: Send + Sync {
    async fn database_exists(&self, name: &str) -> DataResult<bool>;

    /// Create a database; fails with `DatabaseExists` if it is already there
    async fn create_database(&self, name: &str) -> DataResult<()>;

    async fn drop_database(&self, name: &str) -> DataResult<()>;

    /// Open a connection bound to `database`
    async fn connect(&self, database: &str) -> DataResult<Arc<dyn DataConnection>>;
}

/// A connection bound to one database.
///
/// The database a connection targets is fixed when it is opened. There is
/// no ambient "current database" to switch, so two holders of different
/// connections can never observe each other's data.
#[async_trait]
pub trait DataConnection: Send + Sync {
    fn database(&self) -> &str;

    fn is_connected(&self) -> bool;

    async fn connect(&self) -> DataResult<()>;

    async fn disconnect(&self) -> DataResult<()>;

    async fn query(&self, statement: Statement) -> DataResult<RecordSet>;

    /// Begin a transaction; `None` uses the connection's default isolation level
    async fn begin_transaction(
        &self,
        isolation: Option<IsolationLevel>,
    ) -> DataResult<Arc<dyn Transaction>>;

    /// Acquire an advisory lock on `resource` for `owner`.
    ///
    /// Returns `false` when a conflicting lock held by another owner was not
    /// released within the connection's lock timeout.
    async fn acquire_lock(&self, resource: &str, mode: LockMode, owner: &str) -> DataResult<bool>;

    async fn release_lock(&self, resource: &str, owner: &str) -> DataResult<()>;
}

/// A transaction handle
#[async_trait]
pub trait Transaction: Send + Sync {
    fn id(&self) -> &str;

    fn isolation(&self) -> IsolationLevel;

    fn status(&self) -> TransactionStatus;

    /// Watch the status; the value changes exactly once, on commit or rollback
    fn subscribe(&self) -> watch::Receiver<TransactionStatus>;

    /// Run a statement inside the transaction; reads observe staged writes
    async fn query(&self, statement: Statement) -> DataResult<RecordSet>;

    async fn commit(&self) -> DataResult<()>;

    async fn rollback(&self) -> DataResult<()>;
}
