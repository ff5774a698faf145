//! In-memory reference backend for the data connection contract.
//!
//! Each database is a set of keyed tables plus an advisory lock table.
//! Transactions stage their writes in an overlay that is applied under a
//! single write lock on commit, so other connections see all of a
//! transaction's writes or none of them.

use crate::{
    DataConnection, DataError, DataResult, DataServer, IsolationLevel, LockMode, RecordSet, Row,
    Statement, Transaction, TransactionStatus,
};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

/// Default time an advisory lock request waits for a conflicting holder
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

type Table = BTreeMap<String, Row>;

/// In-memory data server.
#[derive(Clone)]
pub struct MemoryServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    databases: DashMap<String, Arc<MemoryDatabase>>,
    lock_timeout: Duration,
    default_isolation: IsolationLevel,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::with_settings(DEFAULT_LOCK_TIMEOUT, IsolationLevel::default())
    }

    pub fn with_settings(lock_timeout: Duration, default_isolation: IsolationLevel) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                databases: DashMap::new(),
                lock_timeout,
                default_isolation,
            }),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        self.inner.lock_timeout
    }

    /// Names of all live databases, sorted
    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .inner
            .databases
            .iter()
            .map(|db| db.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Current holders of an advisory lock, sorted by owner
    pub fn lock_holders(&self, database: &str, resource: &str) -> Vec<(String, LockMode)> {
        let Some(db) = self.inner.databases.get(database).map(|db| Arc::clone(db.value())) else {
            return Vec::new();
        };
        let locks = db.locks.lock();
        let mut holders: Vec<(String, LockMode)> = locks
            .get(resource)
            .map(|h| h.iter().map(|(o, m)| (o.clone(), *m)).collect())
            .unwrap_or_default();
        holders.sort_by(|a, b| a.0.cmp(&b.0));
        holders
    }
}

impl Default for MemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataServer for MemoryServer {
    async fn database_exists(&self, name: &str) -> DataResult<bool> {
        Ok(self.inner.databases.contains_key(name))
    }

    async fn create_database(&self, name: &str) -> DataResult<()> {
        match self.inner.databases.entry(name.to_string()) {
            Entry::Occupied(_) => Err(DataError::DatabaseExists(name.to_string())),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(MemoryDatabase::new(name)));
                tracing::debug!(database = name, "Database created");
                Ok(())
            }
        }
    }

    async fn drop_database(&self, name: &str) -> DataResult<()> {
        let (_, db) = self
            .inner
            .databases
            .remove(name)
            .ok_or_else(|| DataError::DatabaseNotFound(name.to_string()))?;
        db.dropped.store(true, Ordering::SeqCst);
        db.lock_released.notify_waiters();
        tracing::debug!(database = name, "Database dropped");
        Ok(())
    }

    async fn connect(&self, database: &str) -> DataResult<Arc<dyn DataConnection>> {
        let db = self
            .inner
            .databases
            .get(database)
            .map(|db| Arc::clone(db.value()))
            .ok_or_else(|| DataError::DatabaseNotFound(database.to_string()))?;

        Ok(Arc::new(MemoryConnection {
            database: db,
            connected: AtomicBool::new(true),
            lock_timeout: self.inner.lock_timeout,
            default_isolation: self.inner.default_isolation,
        }))
    }
}

// ── Database ─────────────────────────────────────────────────────────

struct MemoryDatabase {
    name: String,
    tables: RwLock<HashMap<String, Table>>,
    /// resource -> owner -> mode
    locks: Mutex<HashMap<String, HashMap<String, LockMode>>>,
    lock_released: Notify,
    dropped: AtomicBool,
}

impl MemoryDatabase {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tables: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
            lock_released: Notify::new(),
            dropped: AtomicBool::new(false),
        }
    }

    fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    fn execute(&self, statement: Statement) -> DataResult<RecordSet> {
        if statement.is_write() {
            apply_write(&mut self.tables.write(), statement)
        } else {
            read(&self.tables.read(), &statement)
        }
    }

    fn try_lock(&self, resource: &str, mode: LockMode, owner: &str) -> bool {
        let mut locks = self.locks.lock();
        let holders = locks.entry(resource.to_string()).or_default();

        if let Some(&held) = holders.get(owner) {
            // Upgrades still have to be compatible with the other holders.
            let target = stronger(held, mode);
            let others_allow = holders
                .iter()
                .filter(|(other, _)| other.as_str() != owner)
                .all(|(_, other_mode)| other_mode.is_compatible_with(target));
            if target == held || others_allow {
                holders.insert(owner.to_string(), target);
                return true;
            }
            return false;
        }

        if holders.values().all(|held| held.is_compatible_with(mode)) {
            holders.insert(owner.to_string(), mode);
            true
        } else {
            false
        }
    }

    fn unlock(&self, resource: &str, owner: &str) -> bool {
        let released = {
            let mut locks = self.locks.lock();
            let released = match locks.get_mut(resource) {
                Some(holders) => holders.remove(owner).is_some(),
                None => false,
            };
            if locks.get(resource).is_some_and(HashMap::is_empty) {
                locks.remove(resource);
            }
            released
        };
        if released {
            self.lock_released.notify_waiters();
        }
        released
    }
}

fn stronger(a: LockMode, b: LockMode) -> LockMode {
    fn rank(mode: LockMode) -> u8 {
        match mode {
            LockMode::Shared => 0,
            LockMode::Update => 1,
            LockMode::Exclusive => 2,
        }
    }
    if rank(b) > rank(a) {
        b
    } else {
        a
    }
}

fn apply_write(tables: &mut HashMap<String, Table>, statement: Statement) -> DataResult<RecordSet> {
    match statement {
        Statement::EnsureTable { table } => {
            tables.entry(table).or_default();
            Ok(RecordSet::affected(0))
        }
        Statement::Upsert { table, key, row } => {
            let rows = tables
                .get_mut(&table)
                .ok_or(DataError::TableNotFound(table))?;
            rows.insert(key, row);
            Ok(RecordSet::affected(1))
        }
        Statement::Delete { table, key } => {
            let rows = tables
                .get_mut(&table)
                .ok_or(DataError::TableNotFound(table))?;
            Ok(RecordSet::affected(u64::from(rows.remove(&key).is_some())))
        }
        read_only => read(tables, &read_only),
    }
}

fn read(tables: &HashMap<String, Table>, statement: &Statement) -> DataResult<RecordSet> {
    let table_name = statement.table();
    let rows = tables
        .get(table_name)
        .ok_or_else(|| DataError::TableNotFound(table_name.to_string()))?;
    match statement {
        Statement::Get { key, .. } => Ok(RecordSet::rows(rows.get(key).cloned().into_iter().collect())),
        Statement::Scan { .. } => Ok(RecordSet::rows(rows.values().cloned().collect())),
        _ => Ok(RecordSet::default()),
    }
}

// ── Connection ───────────────────────────────────────────────────────

struct MemoryConnection {
    database: Arc<MemoryDatabase>,
    connected: AtomicBool,
    lock_timeout: Duration,
    default_isolation: IsolationLevel,
}

impl MemoryConnection {
    fn ensure_usable(&self) -> DataResult<()> {
        if self.database.is_dropped() {
            return Err(DataError::DatabaseNotFound(self.database.name.clone()));
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(DataError::Disconnected(self.database.name.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl DataConnection for MemoryConnection {
    fn database(&self) -> &str {
        &self.database.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.database.is_dropped()
    }

    async fn connect(&self) -> DataResult<()> {
        if self.database.is_dropped() {
            return Err(DataError::DatabaseNotFound(self.database.name.clone()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> DataResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        tracing::debug!(database = %self.database.name, "Connection closed");
        Ok(())
    }

    async fn query(&self, statement: Statement) -> DataResult<RecordSet> {
        self.ensure_usable()?;
        self.database.execute(statement)
    }

    async fn begin_transaction(
        &self,
        isolation: Option<IsolationLevel>,
    ) -> DataResult<Arc<dyn Transaction>> {
        self.ensure_usable()?;
        let (status, _) = watch::channel(TransactionStatus::Active);
        let transaction = MemoryTransaction {
            id: uuid::Uuid::new_v4().to_string(),
            isolation: isolation.unwrap_or(self.default_isolation),
            database: Arc::clone(&self.database),
            overlay: Mutex::new(Overlay::default()),
            status,
        };
        tracing::trace!(
            database = %self.database.name,
            transaction_id = %transaction.id,
            isolation = %transaction.isolation,
            "Transaction started"
        );
        Ok(Arc::new(transaction))
    }

    async fn acquire_lock(&self, resource: &str, mode: LockMode, owner: &str) -> DataResult<bool> {
        self.ensure_usable()?;
        let deadline = Instant::now() + self.lock_timeout;

        loop {
            // Register for wakeups before checking, so a release between the
            // check and the wait is not missed.
            let released = self.database.lock_released.notified();

            if self.database.try_lock(resource, mode, owner) {
                return Ok(true);
            }
            if self.database.is_dropped() || Instant::now() >= deadline {
                return Ok(false);
            }
            if tokio::time::timeout_at(deadline, released).await.is_err() {
                return Ok(self.database.try_lock(resource, mode, owner));
            }
        }
    }

    async fn release_lock(&self, resource: &str, owner: &str) -> DataResult<()> {
        self.ensure_usable()?;
        if !self.database.unlock(resource, owner) {
            tracing::debug!(resource, owner, "Release of a lock that was not held");
        }
        Ok(())
    }
}

// ── Transaction ──────────────────────────────────────────────────────

#[derive(Default)]
struct Overlay {
    created_tables: HashSet<String>,
    /// table -> key -> staged row (`None` marks a delete)
    writes: HashMap<String, BTreeMap<String, Option<Row>>>,
}

struct MemoryTransaction {
    id: String,
    isolation: IsolationLevel,
    database: Arc<MemoryDatabase>,
    overlay: Mutex<Overlay>,
    status: watch::Sender<TransactionStatus>,
}

impl MemoryTransaction {
    fn ensure_active(&self) -> DataResult<()> {
        if self.status.borrow().is_terminal() {
            return Err(DataError::TransactionClosed(self.id.clone()));
        }
        if self.database.is_dropped() {
            return Err(DataError::DatabaseNotFound(self.database.name.clone()));
        }
        Ok(())
    }

    fn run(&self, overlay: &mut Overlay, statement: Statement) -> DataResult<RecordSet> {
        let tables = self.database.tables.read();
        let table_name = statement.table().to_string();
        let base = tables.get(&table_name);
        let known = base.is_some() || overlay.created_tables.contains(&table_name);

        match statement {
            Statement::EnsureTable { table } => {
                if base.is_none() {
                    overlay.created_tables.insert(table);
                }
                Ok(RecordSet::affected(0))
            }
            _ if !known => Err(DataError::TableNotFound(table_name)),
            Statement::Upsert { table, key, row } => {
                overlay.writes.entry(table).or_default().insert(key, Some(row));
                Ok(RecordSet::affected(1))
            }
            Statement::Delete { table, key } => {
                let staged = overlay.writes.get(&table).and_then(|w| w.get(&key));
                let existed = match staged {
                    Some(row) => row.is_some(),
                    None => base.is_some_and(|rows| rows.contains_key(&key)),
                };
                overlay.writes.entry(table).or_default().insert(key, None);
                Ok(RecordSet::affected(u64::from(existed)))
            }
            Statement::Get { table, key } => {
                let staged = overlay.writes.get(&table).and_then(|w| w.get(&key));
                let row = match staged {
                    Some(row) => row.clone(),
                    None => base.and_then(|rows| rows.get(&key).cloned()),
                };
                Ok(RecordSet::rows(row.into_iter().collect()))
            }
            Statement::Scan { table } => {
                let mut merged: Table = base.cloned().unwrap_or_default();
                if let Some(writes) = overlay.writes.get(&table) {
                    for (key, row) in writes {
                        match row {
                            Some(row) => merged.insert(key.clone(), row.clone()),
                            None => merged.remove(key),
                        };
                    }
                }
                Ok(RecordSet::rows(merged.into_values().collect()))
            }
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn id(&self) -> &str {
        &self.id
    }

    fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    fn status(&self) -> TransactionStatus {
        *self.status.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<TransactionStatus> {
        self.status.subscribe()
    }

    async fn query(&self, statement: Statement) -> DataResult<RecordSet> {
        let mut overlay = self.overlay.lock();
        self.ensure_active()?;
        self.run(&mut overlay, statement)
    }

    async fn commit(&self) -> DataResult<()> {
        let mut overlay = self.overlay.lock();
        self.ensure_active()?;

        let staged = std::mem::take(&mut *overlay);
        {
            let mut tables = self.database.tables.write();
            for table in staged.created_tables {
                tables.entry(table).or_default();
            }
            for (table, writes) in staged.writes {
                let rows = tables.entry(table).or_default();
                for (key, row) in writes {
                    match row {
                        Some(row) => rows.insert(key, row),
                        None => rows.remove(&key),
                    };
                }
            }
        }

        self.status.send_replace(TransactionStatus::Committed);
        tracing::trace!(transaction_id = %self.id, "Transaction committed");
        Ok(())
    }

    async fn rollback(&self) -> DataResult<()> {
        let mut overlay = self.overlay.lock();
        if self.status.borrow().is_terminal() {
            return Err(DataError::TransactionClosed(self.id.clone()));
        }
        *overlay = Overlay::default();
        self.status.send_replace(TransactionStatus::RolledBack);
        tracing::trace!(transaction_id = %self.id, "Transaction rolled back");
        Ok(())
    }
}
