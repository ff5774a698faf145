//! Session: the transactional and locking unit of work
//!
//! ```text
//! Created ──initialize──▶ Initialized ──close──▶ Closed
//! ```
//!
//! Every mutating operation runs under one per-session async mutex, so
//! concurrent callers on the same session are serialized. A session holds
//! at most one active transaction and at most one lock per resource name.
//! Cross-session exclusion comes from the connection's advisory locks; the
//! local lock map only records what this session holds.

use crate::{
    AuthorizationOracle, Company, RuntimeError, RuntimeEvents, RuntimeResult, SessionEvent,
    Tenant,
};
use arbor_data::{DataConnection, IsolationLevel, LockMode, RecordSet, Statement, Transaction};
use arbor_types::{PermissionSet, SessionId, SessionRef, User};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Notified when a session closes or leaves a context
pub trait SessionObserver: Send + Sync {
    fn detach_session(&self, session_id: &SessionId);
}

type TransactionSlot = Arc<Mutex<Option<Arc<dyn Transaction>>>>;

struct Binding {
    company: Arc<Company>,
    tenant: Option<Arc<Tenant>>,
}

struct HeldLock {
    mode: LockMode,
    acquired_at: DateTime<Utc>,
    /// Locks are released where they were taken, even after a company switch
    connection: Arc<dyn DataConnection>,
}

/// Information about a lock held by a session
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockInfo {
    pub resource: String,
    pub mode: LockMode,
    pub acquired_at: DateTime<Utc>,
}

struct SessionInner {
    id: SessionId,
    user: User,
    created_at: DateTime<Utc>,
    last_activity: RwLock<DateTime<Utc>>,
    oracle: Arc<dyn AuthorizationOracle>,
    events: Arc<RuntimeEvents>,
    ops: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
    closed: AtomicBool,
    binding: RwLock<Binding>,
    permissions: RwLock<PermissionSet>,
    transaction: TransactionSlot,
    locks: Mutex<BTreeMap<String, HeldLock>>,
    variables: RwLock<HashMap<String, Value>>,
    context: RwLock<HashMap<String, Value>>,
    observers: Mutex<HashMap<String, Weak<dyn SessionObserver>>>,
}

/// A user session bound to a company and optionally a tenant
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Non-owning session handle used for membership tracking
#[derive(Clone)]
pub struct WeakSession(Weak<SessionInner>);

impl WeakSession {
    pub fn upgrade(&self) -> Option<Session> {
        self.0.upgrade().map(|inner| Session { inner })
    }
}

impl Session {
    pub fn new(
        id: SessionId,
        user: User,
        company: Arc<Company>,
        tenant: Option<Arc<Tenant>>,
        oracle: Arc<dyn AuthorizationOracle>,
        events: Arc<RuntimeEvents>,
    ) -> Self {
        let now = Utc::now();
        Self {
            inner: Arc::new(SessionInner {
                id,
                user,
                created_at: now,
                last_activity: RwLock::new(now),
                oracle,
                events,
                ops: tokio::sync::Mutex::new(()),
                initialized: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                binding: RwLock::new(Binding { company, tenant }),
                permissions: RwLock::new(PermissionSet::new()),
                transaction: Arc::new(Mutex::new(None)),
                locks: Mutex::new(BTreeMap::new()),
                variables: RwLock::new(HashMap::new()),
                context: RwLock::new(HashMap::new()),
                observers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    pub fn user(&self) -> &User {
        &self.inner.user
    }

    pub fn company(&self) -> Arc<Company> {
        Arc::clone(&self.inner.binding.read().company)
    }

    pub fn tenant(&self) -> Option<Arc<Tenant>> {
        self.inner.binding.read().tenant.clone()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        *self.inner.last_activity.read()
    }

    /// Refresh the last-activity timestamp
    pub fn touch(&self) {
        *self.inner.last_activity.write() = Utc::now();
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession(Arc::downgrade(&self.inner))
    }

    /// Detached reference handed to extensions and workflows
    pub fn snapshot(&self) -> SessionRef {
        let binding = self.inner.binding.read();
        SessionRef {
            session_id: self.inner.id.clone(),
            user_id: self.inner.user.id.clone(),
            username: self.inner.user.username.clone(),
            company_id: binding.company.id().clone(),
            tenant_id: binding.tenant.as_ref().map(|tenant| tenant.id().clone()),
        }
    }

    fn check_active(&self) -> RuntimeResult<()> {
        if self.is_closed() {
            return Err(RuntimeError::SessionInactive(self.inner.id.clone()));
        }
        Ok(())
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Load permissions and register with the company, then the tenant
    pub async fn initialize(&self) -> RuntimeResult<()> {
        let _ops = self.inner.ops.lock().await;
        self.check_active()?;
        if self.is_initialized() {
            return Ok(());
        }

        let permissions = self.inner.oracle.permission_set(&self.inner.user).await?;
        *self.inner.permissions.write() = permissions;

        let (company, tenant) = {
            let binding = self.inner.binding.read();
            (Arc::clone(&binding.company), binding.tenant.clone())
        };
        company.set_context(self);
        if let Some(tenant) = &tenant {
            tenant.set_context(self);
        }

        self.inner.initialized.store(true, Ordering::SeqCst);
        tracing::info!(
            session_id = %self.inner.id,
            username = %self.inner.user.username,
            company_id = %company.id(),
            "Session initialized"
        );
        self.inner.events.sessions.publish(SessionEvent::Initialized {
            session_id: self.inner.id.clone(),
            username: self.inner.user.username.clone(),
            company_id: company.id().clone(),
            tenant_id: tenant.map(|tenant| tenant.id().clone()),
        });
        Ok(())
    }

    /// Roll back any open transaction, release every lock and mark the
    /// session terminal. Idempotent; cleanup failures are logged only.
    pub async fn close(&self) {
        let _ops = self.inner.ops.lock().await;
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(transaction) = self.active_transaction() {
            if let Err(err) = transaction.rollback().await {
                tracing::warn!(session_id = %self.inner.id, error = %err, "Rollback on close failed");
            }
        }
        self.inner.transaction.lock().take();
        let released = self.release_all().await;

        let observers = std::mem::take(&mut *self.inner.observers.lock());
        for observer in observers.into_values().filter_map(|weak| weak.upgrade()) {
            observer.detach_session(&self.inner.id);
        }

        tracing::info!(session_id = %self.inner.id, locks_released = released, "Session closed");
        self.inner.events.sessions.publish(SessionEvent::Closed {
            session_id: self.inner.id.clone(),
        });
    }

    pub(crate) fn add_observer(&self, key: String, observer: Weak<dyn SessionObserver>) {
        self.inner.observers.lock().insert(key, observer);
    }

    fn detach_from(&self, key: &str, observer: &dyn SessionObserver) {
        self.inner.observers.lock().remove(key);
        observer.detach_session(&self.inner.id);
    }

    // ── Transactions ─────────────────────────────────────────────────

    /// Open a transaction on the company connection
    pub async fn begin_transaction(
        &self,
        isolation: Option<IsolationLevel>,
    ) -> RuntimeResult<Arc<dyn Transaction>> {
        let _ops = self.inner.ops.lock().await;
        self.check_active()?;
        if self.active_transaction().is_some() {
            return Err(RuntimeError::TransactionAlreadyActive(self.inner.id.clone()));
        }

        let connection = self.company().get_connection().await?;
        let transaction = connection
            .begin_transaction(isolation)
            .await
            .map_err(RuntimeError::Transaction)?;
        *self.inner.transaction.lock() = Some(Arc::clone(&transaction));
        self.watch_transaction(&transaction);
        self.touch();

        tracing::debug!(
            session_id = %self.inner.id,
            transaction_id = transaction.id(),
            isolation = %transaction.isolation(),
            "Transaction started"
        );
        Ok(transaction)
    }

    pub async fn commit_transaction(&self) -> RuntimeResult<()> {
        let _ops = self.inner.ops.lock().await;
        self.check_active()?;
        let transaction = self
            .active_transaction()
            .ok_or_else(|| RuntimeError::NoActiveTransaction(self.inner.id.clone()))?;

        transaction.commit().await.map_err(RuntimeError::Transaction)?;
        self.clear_transaction(transaction.id());
        self.touch();
        tracing::debug!(session_id = %self.inner.id, transaction_id = transaction.id(), "Transaction committed");
        Ok(())
    }

    pub async fn rollback_transaction(&self) -> RuntimeResult<()> {
        let _ops = self.inner.ops.lock().await;
        self.check_active()?;
        let transaction = self
            .active_transaction()
            .ok_or_else(|| RuntimeError::NoActiveTransaction(self.inner.id.clone()))?;

        transaction.rollback().await.map_err(RuntimeError::Transaction)?;
        self.clear_transaction(transaction.id());
        self.touch();
        tracing::debug!(session_id = %self.inner.id, transaction_id = transaction.id(), "Transaction rolled back");
        Ok(())
    }

    pub fn has_transaction(&self) -> bool {
        self.active_transaction().is_some()
    }

    /// The open transaction, dropping a handle that already finished
    fn active_transaction(&self) -> Option<Arc<dyn Transaction>> {
        let mut slot = self.inner.transaction.lock();
        match slot.as_ref() {
            Some(transaction) if !transaction.status().is_terminal() => Some(Arc::clone(transaction)),
            Some(_) => {
                *slot = None;
                None
            }
            None => None,
        }
    }

    fn clear_transaction(&self, id: &str) {
        let mut slot = self.inner.transaction.lock();
        if slot.as_ref().is_some_and(|transaction| transaction.id() == id) {
            *slot = None;
        }
    }

    /// Clear the slot when the handle reports commit or rollback, however
    /// it was finished
    fn watch_transaction(&self, transaction: &Arc<dyn Transaction>) {
        let mut status = transaction.subscribe();
        let slot = Arc::downgrade(&self.inner.transaction);
        let id = transaction.id().to_string();

        tokio::spawn(async move {
            while !status.borrow_and_update().is_terminal() {
                if status.changed().await.is_err() {
                    break;
                }
            }
            if let Some(slot) = slot.upgrade() {
                let mut slot = slot.lock();
                if slot.as_ref().is_some_and(|transaction| transaction.id() == id) {
                    *slot = None;
                }
            }
        });
    }

    /// Run a statement through the open transaction, or directly on the
    /// company connection when none is open
    pub async fn execute(&self, statement: Statement) -> RuntimeResult<RecordSet> {
        let _ops = self.inner.ops.lock().await;
        self.check_active()?;
        self.touch();

        match self.active_transaction() {
            Some(transaction) => transaction
                .query(statement)
                .await
                .map_err(RuntimeError::Transaction),
            None => {
                let connection = self.company().get_connection().await?;
                Ok(connection.query(statement).await?)
            }
        }
    }

    // ── Locks ────────────────────────────────────────────────────────

    /// Acquire an advisory lock on `resource`.
    ///
    /// Returns `false` without contacting the connection if this session
    /// already holds `resource`, and `false` if the connection does not
    /// grant the lock in time.
    pub async fn lock(&self, resource: &str, mode: LockMode) -> RuntimeResult<bool> {
        let _ops = self.inner.ops.lock().await;
        self.check_active()?;
        if self.inner.locks.lock().contains_key(resource) {
            tracing::debug!(session_id = %self.inner.id, resource, "Lock already held by session");
            return Ok(false);
        }

        let connection = self.company().get_connection().await?;
        let acquired = connection
            .acquire_lock(resource, mode, self.inner.id.as_str())
            .await?;
        self.touch();
        if !acquired {
            tracing::debug!(session_id = %self.inner.id, resource, ?mode, "Lock not granted");
            return Ok(false);
        }

        self.inner.locks.lock().insert(
            resource.to_string(),
            HeldLock {
                mode,
                acquired_at: Utc::now(),
                connection,
            },
        );
        tracing::debug!(session_id = %self.inner.id, resource, ?mode, "Lock acquired");
        self.inner.events.sessions.publish(SessionEvent::LockAcquired {
            session_id: self.inner.id.clone(),
            resource: resource.to_string(),
            mode,
        });
        Ok(true)
    }

    /// Release one lock; `false` if this session did not hold it
    pub async fn release_lock(&self, resource: &str) -> RuntimeResult<bool> {
        let _ops = self.inner.ops.lock().await;
        self.check_active()?;

        let held = self.inner.locks.lock().remove(resource);
        let Some(held) = held else {
            return Ok(false);
        };
        held.connection
            .release_lock(resource, self.inner.id.as_str())
            .await?;
        self.lock_released(resource);
        Ok(true)
    }

    /// Release every lock this session holds
    pub async fn release_all_locks(&self) -> RuntimeResult<usize> {
        let _ops = self.inner.ops.lock().await;
        self.check_active()?;
        Ok(self.release_all().await)
    }

    async fn release_all(&self) -> usize {
        let held = std::mem::take(&mut *self.inner.locks.lock());
        let mut released = 0;
        for (resource, lock) in held {
            match lock
                .connection
                .release_lock(&resource, self.inner.id.as_str())
                .await
            {
                Ok(()) => {
                    released += 1;
                    self.lock_released(&resource);
                }
                Err(err) => {
                    tracing::warn!(session_id = %self.inner.id, resource = %resource, error = %err, "Failed to release lock");
                }
            }
        }
        released
    }

    fn lock_released(&self, resource: &str) {
        tracing::debug!(session_id = %self.inner.id, resource, "Lock released");
        self.inner.events.sessions.publish(SessionEvent::LockReleased {
            session_id: self.inner.id.clone(),
            resource: resource.to_string(),
        });
    }

    pub fn held_locks(&self) -> Vec<LockInfo> {
        self.inner
            .locks
            .lock()
            .iter()
            .map(|(resource, held)| LockInfo {
                resource: resource.clone(),
                mode: held.mode,
                acquired_at: held.acquired_at,
            })
            .collect()
    }

    pub fn holds_lock(&self, resource: &str) -> bool {
        self.inner.locks.lock().contains_key(resource)
    }

    // ── Context switching ────────────────────────────────────────────

    /// Rebind the session to another company.
    ///
    /// Refused while a transaction is open, when the company is not active,
    /// and when the company belongs to a tenant other than the session's.
    pub async fn switch_company(&self, company: Arc<Company>) -> RuntimeResult<()> {
        let _ops = self.inner.ops.lock().await;
        self.check_active()?;
        self.ensure_no_transaction()?;

        let current = self.company();
        if current.id() == company.id() {
            return Ok(());
        }
        if !company.is_active() {
            return Err(RuntimeError::CompanyUnavailable {
                id: company.id().clone(),
                status: company.status(),
            });
        }
        if let Some(owner) = company.tenant_id() {
            let tenant = self.tenant();
            if tenant.as_ref().map(|tenant| tenant.id()) != Some(owner) {
                return Err(RuntimeError::TenantMismatch {
                    company: company.id().clone(),
                    tenant: tenant.map(|t| t.id().clone()).unwrap_or_else(|| owner.clone()),
                });
            }
        }

        self.rebind_company(&current, company);
        self.touch();
        Ok(())
    }

    /// Rebind the session to another tenant.
    ///
    /// A company owned by a different tenant is replaced with the target
    /// tenant's first active company; a standalone company is kept.
    pub async fn switch_tenant(&self, tenant: Arc<Tenant>) -> RuntimeResult<()> {
        let _ops = self.inner.ops.lock().await;
        self.check_active()?;
        self.ensure_no_transaction()?;

        if !tenant.is_active() {
            return Err(RuntimeError::TenantUnavailable {
                id: tenant.id().clone(),
                status: tenant.status(),
            });
        }
        let previous = self.tenant();
        if previous.as_ref().map(|t| t.id()) == Some(tenant.id()) {
            return Ok(());
        }

        let company = self.company();
        let replacement = match company.tenant_id() {
            Some(owner) if owner != tenant.id() => Some(
                tenant
                    .companies()
                    .into_iter()
                    .find(|candidate| candidate.is_active())
                    .ok_or(RuntimeError::NoCompanyAvailable)?,
            ),
            _ => None,
        };

        tenant.set_context(self);
        self.inner.binding.write().tenant = Some(Arc::clone(&tenant));
        if let Some(previous) = &previous {
            self.detach_from(&previous.observer_key(), previous.as_ref());
        }
        if let Some(replacement) = replacement {
            self.rebind_company(&company, replacement);
        }

        tracing::info!(session_id = %self.inner.id, tenant_id = %tenant.id(), "Session switched tenant");
        self.inner.events.sessions.publish(SessionEvent::TenantSwitched {
            session_id: self.inner.id.clone(),
            from: previous.map(|t| t.id().clone()),
            to: tenant.id().clone(),
        });
        self.touch();
        Ok(())
    }

    fn ensure_no_transaction(&self) -> RuntimeResult<()> {
        if self.active_transaction().is_some() {
            return Err(RuntimeError::ContextSwitchDuringTransaction(self.inner.id.clone()));
        }
        Ok(())
    }

    fn rebind_company(&self, current: &Arc<Company>, company: Arc<Company>) {
        company.set_context(self);
        self.inner.binding.write().company = Arc::clone(&company);
        self.detach_from(&current.observer_key(), current.as_ref());

        tracing::info!(
            session_id = %self.inner.id,
            from = %current.id(),
            to = %company.id(),
            "Session switched company"
        );
        self.inner.events.sessions.publish(SessionEvent::CompanySwitched {
            session_id: self.inner.id.clone(),
            from: current.id().clone(),
            to: company.id().clone(),
        });
    }

    // ── Permissions and variables ────────────────────────────────────

    pub fn check_permission(&self, permission: &str, resource: Option<&str>) -> bool {
        let snapshot = self.snapshot();
        let permissions = self.inner.permissions.read();
        self.inner
            .oracle
            .check_permission(&snapshot, &permissions, permission, resource)
    }

    pub fn require_permission(&self, permission: &str, resource: Option<&str>) -> RuntimeResult<()> {
        if self.check_permission(permission, resource) {
            Ok(())
        } else {
            Err(RuntimeError::PermissionDenied {
                permission: permission.to_string(),
            })
        }
    }

    pub fn permissions(&self) -> PermissionSet {
        self.inner.permissions.read().clone()
    }

    pub fn set_variable(&self, key: impl Into<String>, value: Value) {
        self.inner.variables.write().insert(key.into(), value);
    }

    pub fn variable(&self, key: &str) -> Option<Value> {
        self.inner.variables.read().get(key).cloned()
    }

    pub fn remove_variable(&self, key: &str) -> Option<Value> {
        self.inner.variables.write().remove(key)
    }

    pub fn set_context_value(&self, key: impl Into<String>, value: Value) {
        self.inner.context.write().insert(key.into(), value);
    }

    pub fn context_value(&self, key: &str) -> Option<Value> {
        self.inner.context.read().get(key).cloned()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("user", &self.inner.user.username)
            .field("company", self.company().id())
            .field("closed", &self.is_closed())
            .finish()
    }
}
