//! Tenant registry: tenant discovery, provisioning and connection caching
//!
//! Tenant rows live in the system database. Registration provisions the
//! tenant database, prepares its company table and persists the row as one
//! step: if any part fails the database is dropped again and nothing is
//! cached, so lookups never see a half-registered tenant.

use crate::records::{database_name, from_row, to_row};
use crate::tenant::COMPANIES_TABLE;
use crate::{
    DataConfig, RuntimeError, RuntimeEvents, RuntimeResult, Tenant, TenantConfig, TenantEvent,
    TenantRecord, TenantStatus,
};
use arbor_data::{DataConnection, DataServer, Statement};
use arbor_types::TenantId;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const TENANTS_TABLE: &str = "tenants";

/// Connections shared by the registry and its tenants
pub(crate) struct TenantStore {
    server: Arc<dyn DataServer>,
    system: Arc<dyn DataConnection>,
    connections: DashMap<TenantId, Arc<dyn DataConnection>>,
    connect_lock: Mutex<()>,
}

impl TenantStore {
    pub(crate) fn server(&self) -> Arc<dyn DataServer> {
        Arc::clone(&self.server)
    }

    /// One cached connection per tenant id
    pub(crate) async fn connection(
        &self,
        id: &TenantId,
        database: &str,
    ) -> RuntimeResult<Arc<dyn DataConnection>> {
        if let Some(connection) = self.cached(id) {
            return Ok(connection);
        }

        let _connect = self.connect_lock.lock().await;
        if let Some(connection) = self.cached(id) {
            return Ok(connection);
        }
        let connection = self.server.connect(database).await?;
        self.connections.insert(id.clone(), Arc::clone(&connection));
        tracing::debug!(tenant_id = %id, database, "Tenant connection opened");
        Ok(connection)
    }

    fn cached(&self, id: &TenantId) -> Option<Arc<dyn DataConnection>> {
        self.connections
            .get(id)
            .map(|connection| Arc::clone(connection.value()))
            .filter(|connection| connection.is_connected())
    }

    pub(crate) async fn disconnect(&self, id: &TenantId) {
        if let Some((_, connection)) = self.connections.remove(id) {
            if let Err(err) = connection.disconnect().await {
                tracing::warn!(tenant_id = %id, error = %err, "Failed to disconnect tenant connection");
            }
        }
    }

    pub(crate) async fn save(&self, record: &TenantRecord) -> RuntimeResult<()> {
        self.system
            .query(Statement::upsert(TENANTS_TABLE, record.id.as_str(), to_row(record)?))
            .await?;
        Ok(())
    }
}

pub struct TenantRegistry {
    store: Arc<TenantStore>,
    tenants: DashMap<TenantId, Arc<Tenant>>,
    registration: Mutex<()>,
    events: Arc<RuntimeEvents>,
}

impl TenantRegistry {
    /// Open the registry on the system database, creating it if needed
    pub async fn open(
        server: Arc<dyn DataServer>,
        config: &DataConfig,
        events: Arc<RuntimeEvents>,
    ) -> RuntimeResult<Self> {
        let database = &config.system_database;
        if !server.database_exists(database).await? {
            server
                .create_database(database)
                .await
                .map_err(|err| RuntimeError::ProvisioningError {
                    database: database.clone(),
                    reason: err.to_string(),
                })?;
            tracing::info!(database = %database, "System database created");
        }
        let system = server.connect(database).await?;
        system.query(Statement::ensure_table(TENANTS_TABLE)).await?;

        Ok(Self {
            store: Arc::new(TenantStore {
                server,
                system,
                connections: DashMap::new(),
                connect_lock: Mutex::new(()),
            }),
            tenants: DashMap::new(),
            registration: Mutex::new(()),
            events,
        })
    }

    /// Restore persisted tenants and their companies; returns the number of
    /// tenants loaded
    pub async fn load(&self) -> RuntimeResult<usize> {
        let rows = self
            .store
            .system
            .query(Statement::scan(TENANTS_TABLE))
            .await?
            .rows;

        let mut loaded = 0;
        for row in rows {
            let record: TenantRecord = from_row(row)?;
            if record.deleted_at.is_some() {
                continue;
            }
            let tenant = Tenant::from_record(record, Arc::clone(&self.store), Arc::clone(&self.events));
            let companies = tenant.load_companies().await?;
            tracing::debug!(tenant_id = %tenant.id(), code = tenant.code(), companies, "Tenant loaded");
            self.tenants.insert(tenant.id().clone(), tenant);
            loaded += 1;
        }
        tracing::info!(tenants = loaded, "Tenants loaded");
        Ok(loaded)
    }

    /// Provision and persist a new tenant
    pub async fn register_tenant(&self, config: TenantConfig) -> RuntimeResult<Arc<Tenant>> {
        let _registration = self.registration.lock().await;
        if self.get_tenant_by_code(&config.code).is_some() {
            return Err(RuntimeError::DuplicateTenantCode(config.code));
        }

        let database = self.free_database_name(&config.code).await?;
        self.store
            .server
            .create_database(&database)
            .await
            .map_err(|err| RuntimeError::ProvisioningError {
                database: database.clone(),
                reason: err.to_string(),
            })?;

        let record = TenantRecord {
            id: TenantId::generate(),
            code: config.code,
            name: config.name,
            database: database.clone(),
            status: TenantStatus::Active,
            settings: config.settings,
            features: config.features,
            domains: config.domains,
            version: config.version,
            created_at: Utc::now(),
            deleted_at: None,
        };
        let tenant = Tenant::from_record(record, Arc::clone(&self.store), Arc::clone(&self.events));

        if let Err(err) = self.persist_new(&tenant).await {
            self.store.disconnect(tenant.id()).await;
            if let Err(drop_err) = self.store.server.drop_database(&database).await {
                tracing::warn!(database = %database, error = %drop_err, "Failed to drop database of unregistered tenant");
            }
            return Err(err);
        }
        self.tenants.insert(tenant.id().clone(), Arc::clone(&tenant));

        tracing::info!(tenant_id = %tenant.id(), code = tenant.code(), database = %database, "Tenant registered");
        self.events.tenants.publish(TenantEvent::DatabaseCreated {
            tenant_id: tenant.id().clone(),
            database,
        });
        self.events.tenants.publish(TenantEvent::Registered {
            tenant_id: tenant.id().clone(),
            code: tenant.code().to_string(),
        });
        self.events.tenants.publish(TenantEvent::Initialized {
            tenant_id: tenant.id().clone(),
        });
        Ok(tenant)
    }

    async fn persist_new(&self, tenant: &Tenant) -> RuntimeResult<()> {
        let connection = tenant.connection().await?;
        connection
            .query(Statement::ensure_table(COMPANIES_TABLE))
            .await?;
        self.store.save(&tenant.record()).await
    }

    /// `tenant_<code>`, suffixed when a soft-deleted tenant still owns it
    async fn free_database_name(&self, code: &str) -> RuntimeResult<String> {
        let base = database_name("tenant", code);
        let mut candidate = base.clone();
        let mut suffix = 2;
        while self.store.server.database_exists(&candidate).await? {
            candidate = format!("{base}_{suffix}");
            suffix += 1;
        }
        Ok(candidate)
    }

    pub fn get_tenant(&self, id: &TenantId) -> Option<Arc<Tenant>> {
        self.tenants.get(id).map(|tenant| Arc::clone(tenant.value()))
    }

    /// Case-insensitive code lookup
    pub fn get_tenant_by_code(&self, code: &str) -> Option<Arc<Tenant>> {
        self.tenants
            .iter()
            .find(|tenant| tenant.code().eq_ignore_ascii_case(code))
            .map(|tenant| Arc::clone(tenant.value()))
    }

    pub fn get_tenant_by_domain(&self, domain: &str) -> Option<Arc<Tenant>> {
        self.tenants
            .iter()
            .find(|tenant| tenant.serves_domain(domain))
            .map(|tenant| Arc::clone(tenant.value()))
    }

    /// All live tenants, oldest first
    pub fn tenants(&self) -> Vec<Arc<Tenant>> {
        let mut tenants: Vec<Arc<Tenant>> = self
            .tenants
            .iter()
            .map(|tenant| Arc::clone(tenant.value()))
            .collect();
        tenants.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.code().cmp(b.code()))
        });
        tenants
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }

    pub async fn get_tenant_connection(&self, id: &TenantId) -> RuntimeResult<Arc<dyn DataConnection>> {
        let tenant = self
            .get_tenant(id)
            .ok_or_else(|| RuntimeError::TenantNotFound(id.clone()))?;
        tenant.connection().await
    }

    pub async fn set_status(&self, id: &TenantId, status: TenantStatus) -> RuntimeResult<()> {
        let tenant = self
            .get_tenant(id)
            .ok_or_else(|| RuntimeError::TenantNotFound(id.clone()))?;
        tenant.set_status(status).await
    }

    /// Soft-delete a tenant: the row is kept with `deleted_at` set, the
    /// tenant disappears from every lookup and its code becomes reusable
    pub async fn delete_tenant(&self, id: &TenantId) -> RuntimeResult<Arc<Tenant>> {
        let _registration = self.registration.lock().await;
        let tenant = self
            .get_tenant(id)
            .ok_or_else(|| RuntimeError::TenantNotFound(id.clone()))?;

        tenant.mark_deleted().await?;
        self.tenants.remove(id);
        tenant.shutdown().await;

        tracing::info!(tenant_id = %id, code = tenant.code(), "Tenant deleted");
        self.events.tenants.publish(TenantEvent::Deleted {
            tenant_id: id.clone(),
        });
        Ok(tenant)
    }

    /// Shut down every tenant
    pub async fn shutdown(&self) {
        for tenant in self.tenants() {
            tenant.shutdown().await;
        }
    }
}

impl std::fmt::Debug for TenantRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantRegistry")
            .field("tenants", &self.tenants.len())
            .finish()
    }
}
