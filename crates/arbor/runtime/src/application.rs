//! Session coordinator
//!
//! [`Application`] is the single authenticated entry point for sessions. It
//! owns the tenant registry, the company table, the session registry, the
//! extension manager and the workflow engine, and runs the background
//! housekeeping loops (idle-session reaper, workflow cleanup).

use crate::{
    AuthorizationOracle, Company, CompanyConfig, RuntimeConfig, RuntimeError, RuntimeEvents,
    RuntimeResult, Session, Tenant, TenantConfig, TenantRegistry,
};
use arbor_data::DataServer;
use arbor_types::{CompanyId, Credentials, SessionId, TenantId, User};
use chrono::Utc;
use dashmap::DashMap;
use extension_host::{ExtensionManager, HookResult, InitializationReport};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use workflow_engine::WorkflowEngine;
use workflow_types::{InstanceId, WorkflowId};

/// Permission required to open a session as another user
pub const IMPERSONATE_PERMISSION: &str = "session:impersonate";

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

struct AppInner {
    config: RuntimeConfig,
    server: Arc<dyn DataServer>,
    oracle: Arc<dyn AuthorizationOracle>,
    events: Arc<RuntimeEvents>,
    tenants: TenantRegistry,
    companies: DashMap<CompanyId, Arc<Company>>,
    /// Registration order; the first active entry is the default company
    company_order: RwLock<Vec<CompanyId>>,
    company_registration: tokio::sync::Mutex<()>,
    sessions: DashMap<SessionId, Session>,
    extensions: Arc<ExtensionManager>,
    workflows: WorkflowEngine,
    shutdown: watch::Sender<bool>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

/// The Arbor application: session coordinator and subsystem owner
#[derive(Clone)]
pub struct Application {
    inner: Arc<AppInner>,
}

impl Application {
    /// Open the runtime on `server`, restoring persisted tenants and their
    /// companies
    pub async fn open(
        config: RuntimeConfig,
        server: Arc<dyn DataServer>,
        oracle: Arc<dyn AuthorizationOracle>,
    ) -> RuntimeResult<Self> {
        let events = Arc::new(RuntimeEvents::new());
        let tenants =
            TenantRegistry::open(Arc::clone(&server), &config.data, Arc::clone(&events)).await?;
        tenants.load().await?;

        let extensions = Arc::new(ExtensionManager::new(config.extensions.clone()));
        let workflows = WorkflowEngine::new(config.workflow.engine.clone());
        let (shutdown, _) = watch::channel(false);

        let app = Self {
            inner: Arc::new(AppInner {
                config,
                server,
                oracle,
                events,
                tenants,
                companies: DashMap::new(),
                company_order: RwLock::new(Vec::new()),
                company_registration: tokio::sync::Mutex::new(()),
                sessions: DashMap::new(),
                extensions,
                workflows,
                shutdown,
                background: Mutex::new(Vec::new()),
            }),
        };

        for tenant in app.inner.tenants.tenants() {
            for company in tenant.companies() {
                app.check_unique(company.id(), company.database())?;
                app.insert_company(company);
            }
        }
        tracing::info!(
            tenants = app.inner.tenants.len(),
            companies = app.inner.companies.len(),
            "Application opened"
        );
        Ok(app)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn events(&self) -> &Arc<RuntimeEvents> {
        &self.inner.events
    }

    pub fn tenants(&self) -> &TenantRegistry {
        &self.inner.tenants
    }

    pub fn extensions(&self) -> &Arc<ExtensionManager> {
        &self.inner.extensions
    }

    pub fn workflows(&self) -> &WorkflowEngine {
        &self.inner.workflows
    }

    pub fn oracle(&self) -> &Arc<dyn AuthorizationOracle> {
        &self.inner.oracle
    }

    /// Load extensions from the configured directory and, when
    /// `auto_enable` is set, enable them in dependency order
    pub async fn load_extensions(&self) -> RuntimeResult<InitializationReport> {
        let config = &self.inner.config.extensions;
        if let Some(dir) = &config.extensions_dir {
            self.inner.extensions.load_extensions_from_dir(dir).await?;
        }
        if !config.auto_enable {
            return Ok(InitializationReport::default());
        }
        let report = self.inner.extensions.initialize_extensions().await?;
        tracing::info!(
            enabled = report.enabled.len(),
            failed = report.failed.len(),
            "Extensions initialized"
        );
        Ok(report)
    }

    // ── Tenants ──────────────────────────────────────────────────────

    pub async fn register_tenant(&self, config: TenantConfig) -> RuntimeResult<Arc<Tenant>> {
        self.inner.tenants.register_tenant(config).await
    }

    /// Soft-delete a tenant and forget its companies
    pub async fn delete_tenant(&self, id: &TenantId) -> RuntimeResult<()> {
        let tenant = self.inner.tenants.delete_tenant(id).await?;
        let removed: Vec<CompanyId> = tenant.companies().iter().map(|c| c.id().clone()).collect();
        for company_id in &removed {
            self.inner.companies.remove(company_id);
        }
        self.inner
            .company_order
            .write()
            .retain(|company_id| !removed.contains(company_id));
        Ok(())
    }

    fn active_tenant(&self, id: &TenantId) -> RuntimeResult<Arc<Tenant>> {
        let tenant = self
            .inner
            .tenants
            .get_tenant(id)
            .ok_or_else(|| RuntimeError::TenantNotFound(id.clone()))?;
        if !tenant.is_active() {
            return Err(RuntimeError::TenantUnavailable {
                id: id.clone(),
                status: tenant.status(),
            });
        }
        Ok(tenant)
    }

    // ── Companies ────────────────────────────────────────────────────

    /// Initialize and register an existing company object
    pub async fn register_company(&self, company: Arc<Company>) -> RuntimeResult<Arc<Company>> {
        let _registration = self.inner.company_registration.lock().await;
        self.check_unique(company.id(), company.database())?;
        company.initialize().await?;
        self.insert_company(Arc::clone(&company));
        tracing::info!(company_id = %company.id(), database = company.database(), "Company registered");
        Ok(company)
    }

    /// Create and register a standalone company
    pub async fn create_company(&self, config: CompanyConfig) -> RuntimeResult<Arc<Company>> {
        let company = Company::new(
            config,
            None,
            Arc::clone(&self.inner.server),
            Arc::clone(&self.inner.events),
        );
        self.register_company(company).await
    }

    /// Create a company owned by a tenant and register it
    pub async fn create_tenant_company(
        &self,
        tenant_id: &TenantId,
        mut config: CompanyConfig,
    ) -> RuntimeResult<Arc<Company>> {
        let tenant = self.active_tenant(tenant_id)?;
        let _registration = self.inner.company_registration.lock().await;

        let id = config.id.clone().unwrap_or_else(CompanyId::generate);
        self.check_unique(&id, &config.database_for(&id))?;
        config.id = Some(id);

        let company = tenant.create_company(config).await?;
        self.insert_company(Arc::clone(&company));
        Ok(company)
    }

    fn check_unique(&self, id: &CompanyId, database: &str) -> RuntimeResult<()> {
        if self.inner.companies.contains_key(id) {
            return Err(RuntimeError::DuplicateCompany(id.clone()));
        }
        if self
            .inner
            .companies
            .iter()
            .any(|company| company.database() == database)
        {
            return Err(RuntimeError::DuplicateDatabase(database.to_string()));
        }
        Ok(())
    }

    fn insert_company(&self, company: Arc<Company>) {
        self.inner.company_order.write().push(company.id().clone());
        self.inner.companies.insert(company.id().clone(), company);
    }

    pub fn get_company(&self, id: &CompanyId) -> Option<Arc<Company>> {
        self.inner
            .companies
            .get(id)
            .map(|company| Arc::clone(company.value()))
    }

    /// Companies in registration order
    pub fn companies(&self) -> Vec<Arc<Company>> {
        self.inner
            .company_order
            .read()
            .iter()
            .filter_map(|id| self.get_company(id))
            .collect()
    }

    /// The first registered active company
    pub fn default_company(&self) -> Option<Arc<Company>> {
        self.companies().into_iter().find(|company| company.is_active())
    }

    // ── Sessions ─────────────────────────────────────────────────────

    /// Authenticate and open a session.
    ///
    /// Without a company id the session binds the tenant's first company
    /// when a tenant is given, else the default company. A company owned by
    /// a tenant brings that tenant along when none is given.
    pub async fn create_session(
        &self,
        credentials: &Credentials,
        company_id: Option<&CompanyId>,
        tenant_id: Option<&TenantId>,
    ) -> RuntimeResult<Session> {
        let user = self.inner.oracle.authenticate(credentials).await?;
        self.open_session(user, company_id, tenant_id).await
    }

    async fn open_session(
        &self,
        user: User,
        company_id: Option<&CompanyId>,
        tenant_id: Option<&TenantId>,
    ) -> RuntimeResult<Session> {
        let tenant = tenant_id.map(|id| self.active_tenant(id)).transpose()?;

        let company = match (company_id, &tenant) {
            (Some(id), _) => self
                .get_company(id)
                .ok_or_else(|| RuntimeError::CompanyNotFound(id.clone()))?,
            (None, Some(tenant)) => tenant
                .companies()
                .into_iter()
                .find(|company| company.is_active())
                .ok_or(RuntimeError::NoCompanyAvailable)?,
            (None, None) => self
                .default_company()
                .ok_or(RuntimeError::NoCompanyAvailable)?,
        };
        if !company.is_active() {
            return Err(RuntimeError::CompanyUnavailable {
                id: company.id().clone(),
                status: company.status(),
            });
        }

        let tenant = match (tenant, company.tenant_id()) {
            (Some(tenant), Some(owner)) if tenant.id() != owner => {
                return Err(RuntimeError::TenantMismatch {
                    company: company.id().clone(),
                    tenant: tenant.id().clone(),
                });
            }
            (Some(tenant), _) => Some(tenant),
            (None, Some(owner)) => Some(self.active_tenant(owner)?),
            (None, None) => None,
        };

        let session = Session::new(
            SessionId::generate(),
            user,
            company,
            tenant,
            Arc::clone(&self.inner.oracle),
            Arc::clone(&self.inner.events),
        );
        session.initialize().await?;
        self.inner
            .sessions
            .insert(session.id().clone(), session.clone());
        Ok(session)
    }

    /// Close and forget a session; `false` if it was not registered
    pub async fn end_session(&self, id: &SessionId) -> bool {
        match self.inner.sessions.remove(id) {
            Some((_, session)) => {
                session.close().await;
                true
            }
            None => false,
        }
    }

    /// Look up a live session and refresh its activity timestamp
    pub fn get_session(&self, id: &SessionId) -> Option<Session> {
        let session = self.inner.sessions.get(id).map(|s| s.value().clone())?;
        if session.is_closed() {
            self.inner.sessions.remove(id);
            return None;
        }
        session.touch();
        Some(session)
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.inner
            .sessions
            .iter()
            .map(|session| session.value().clone())
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Open a new session for `username` in the caller's context.
    ///
    /// Requires the `session:impersonate` permission; the caller's session
    /// is left untouched.
    pub async fn impersonate(&self, session_id: &SessionId, username: &str) -> RuntimeResult<Session> {
        let session = self
            .get_session(session_id)
            .ok_or_else(|| RuntimeError::SessionNotFound(session_id.clone()))?;
        session.require_permission(IMPERSONATE_PERMISSION, Some(username))?;

        let user = self
            .inner
            .oracle
            .find_user(username)
            .await?
            .ok_or(RuntimeError::AuthenticationFailed)?;
        let company = session.company();
        let tenant = session.tenant();
        let impersonated = self
            .open_session(user, Some(company.id()), tenant.as_ref().map(|t| t.id()))
            .await?;

        tracing::info!(
            session_id = %session_id,
            impersonator = %session.user().username,
            username,
            impersonation_session = %impersonated.id(),
            "Session impersonation"
        );
        Ok(impersonated)
    }

    pub async fn switch_company(&self, session_id: &SessionId, company_id: &CompanyId) -> RuntimeResult<()> {
        let session = self
            .get_session(session_id)
            .ok_or_else(|| RuntimeError::SessionNotFound(session_id.clone()))?;
        let company = self
            .get_company(company_id)
            .ok_or_else(|| RuntimeError::CompanyNotFound(company_id.clone()))?;
        session.switch_company(company).await
    }

    pub async fn switch_tenant(&self, session_id: &SessionId, tenant_id: &TenantId) -> RuntimeResult<()> {
        let session = self
            .get_session(session_id)
            .ok_or_else(|| RuntimeError::SessionNotFound(session_id.clone()))?;
        let tenant = self
            .inner
            .tenants
            .get_tenant(tenant_id)
            .ok_or_else(|| RuntimeError::TenantNotFound(tenant_id.clone()))?;
        session.switch_tenant(tenant).await
    }

    /// End every session idle for longer than the configured timeout, and
    /// drop sessions closed elsewhere. Returns the number ended.
    pub async fn reap_idle_sessions(&self) -> usize {
        let timeout = self.inner.config.session.timeout();
        let now = Utc::now();
        let expired: Vec<SessionId> = self
            .inner
            .sessions
            .iter()
            .filter(|session| {
                session.is_closed()
                    || (now - session.last_activity())
                        .to_std()
                        .unwrap_or_default()
                        >= timeout
            })
            .map(|session| session.key().clone())
            .collect();

        let mut ended = 0;
        for id in expired {
            if self.end_session(&id).await {
                ended += 1;
            }
        }
        if ended > 0 {
            tracing::info!(ended, "Idle sessions reaped");
        }
        ended
    }

    // ── Extensions and workflows ─────────────────────────────────────

    /// Run a hook point, attaching the session reference when given
    pub async fn execute_hook(
        &self,
        point: &str,
        payload: &Value,
        session: Option<&Session>,
    ) -> Vec<HookResult> {
        let session_ref = session.map(|session| {
            session.touch();
            session.snapshot()
        });
        self.inner
            .extensions
            .execute_hook(point, payload, session_ref.as_ref())
            .await
    }

    /// Start a workflow instance on behalf of a session
    pub fn start_workflow(
        &self,
        workflow_id: &WorkflowId,
        variables: HashMap<String, Value>,
        session: Option<&Session>,
    ) -> RuntimeResult<InstanceId> {
        let session_ref = match session {
            Some(session) if session.is_closed() => {
                return Err(RuntimeError::SessionInactive(session.id().clone()));
            }
            Some(session) => {
                session.touch();
                Some(session.snapshot())
            }
            None => None,
        };
        Ok(self
            .inner
            .workflows
            .start_workflow(workflow_id, variables, session_ref)?)
    }

    // ── Background tasks and shutdown ────────────────────────────────

    /// Spawn the idle-session reaper and the workflow housekeeping loop.
    /// Calling it again while they run does nothing.
    pub fn start_background_tasks(&self) {
        let mut background = self.inner.background.lock();
        if !background.is_empty() {
            return;
        }

        let reap_every = self.inner.config.session.reap_interval();
        background.push(self.spawn_sweep("session-reaper", reap_every, |app| async move {
            app.reap_idle_sessions().await;
        }));

        let cleanup_every = Duration::from_secs(self.inner.config.workflow.cleanup_interval_secs);
        background.push(self.spawn_sweep("workflow-cleanup", cleanup_every, |app| async move {
            let retention = app.inner.config.workflow.retention_hours;
            let removed = app.inner.workflows.cleanup_completed_instances(retention);
            let expired = app.inner.workflows.expire_overdue_tasks();
            if removed > 0 || expired > 0 {
                tracing::info!(removed, expired, "Workflow housekeeping");
            }
        }));
        tracing::info!("Background tasks started");
    }

    fn spawn_sweep<F, Fut>(&self, name: &'static str, every: Duration, sweep: F) -> JoinHandle<()>
    where
        F: Fn(Application) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let app: Weak<AppInner> = Arc::downgrade(&self.inner);
        let mut shutdown = self.inner.shutdown.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(MIN_SWEEP_INTERVAL));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(inner) = app.upgrade() else { break };
                        sweep(Application { inner }).await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!(task = name, "Background task stopped");
        })
    }

    /// Stop background tasks, end every session, shut down companies and
    /// tenants, and disable extensions
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let handles = std::mem::take(&mut *self.inner.background.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "Background task failed");
            }
        }

        let ids: Vec<SessionId> = self
            .inner
            .sessions
            .iter()
            .map(|session| session.key().clone())
            .collect();
        for id in &ids {
            self.end_session(id).await;
        }

        // tenant-owned companies go down with their tenant
        for company in self.companies() {
            if company.tenant_id().is_none() {
                company.shutdown().await;
            }
        }
        self.inner.tenants.shutdown().await;
        self.inner.extensions.shutdown().await;

        tracing::info!(sessions_ended = ids.len(), "Application shut down");
    }
}

impl std::fmt::Debug for Application {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Application")
            .field("tenants", &self.inner.tenants.len())
            .field("companies", &self.inner.companies.len())
            .field("sessions", &self.inner.sessions.len())
            .finish()
    }
}
