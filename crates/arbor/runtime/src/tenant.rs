//! Tenant: the top-level isolation boundary
//!
//! A tenant owns a dedicated database holding its company rows, the
//! companies themselves, tenant-level settings and the set of sessions bound
//! to it. Connections are obtained through the store shared with the
//! registry, so both see the same cached connection.

use crate::records::{from_row, to_row};
use crate::session::{Session, SessionObserver, WeakSession};
use crate::tenant_registry::TenantStore;
use crate::{
    Company, CompanyConfig, CompanyRecord, RuntimeError, RuntimeEvents, RuntimeResult,
    TenantEvent,
};
use arbor_data::{DataConnection, Statement};
use arbor_types::{CompanyId, SessionId, SettingValue, TenantId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

pub const COMPANIES_TABLE: &str = "companies";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStatus {
    #[default]
    Active,
    Inactive,
    Suspended,
    Migrating,
}

/// Registration parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TenantConfig {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub settings: BTreeMap<String, SettingValue>,
    #[serde(default = "default_version")]
    pub version: String,
}

fn default_version() -> String {
    "1.0.0".to_string()
}

impl TenantConfig {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code: code.into(),
            domains: Vec::new(),
            features: Vec::new(),
            settings: BTreeMap::new(),
            version: default_version(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domains.push(domain.into());
        self
    }

    pub fn with_feature(mut self, feature: impl Into<String>) -> Self {
        self.features.push(feature.into());
        self
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<SettingValue>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }
}

/// Persisted form of a tenant
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TenantRecord {
    pub id: TenantId,
    pub code: String,
    pub name: String,
    pub database: String,
    pub status: TenantStatus,
    #[serde(default)]
    pub settings: BTreeMap<String, SettingValue>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    pub version: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

pub struct Tenant {
    id: TenantId,
    code: String,
    name: String,
    database: String,
    version: String,
    domains: Vec<String>,
    features: Vec<String>,
    created_at: DateTime<Utc>,
    status: RwLock<TenantStatus>,
    settings: RwLock<BTreeMap<String, SettingValue>>,
    deleted_at: RwLock<Option<DateTime<Utc>>>,
    companies: RwLock<Vec<Arc<Company>>>,
    sessions: DashMap<SessionId, WeakSession>,
    store: Arc<TenantStore>,
    events: Arc<RuntimeEvents>,
}

impl Tenant {
    pub(crate) fn from_record(
        record: TenantRecord,
        store: Arc<TenantStore>,
        events: Arc<RuntimeEvents>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: record.id,
            code: record.code,
            name: record.name,
            database: record.database,
            version: record.version,
            domains: record.domains,
            features: record.features,
            created_at: record.created_at,
            status: RwLock::new(record.status),
            settings: RwLock::new(record.settings),
            deleted_at: RwLock::new(record.deleted_at),
            companies: RwLock::new(Vec::new()),
            sessions: DashMap::new(),
            store,
            events,
        })
    }

    pub fn id(&self) -> &TenantId {
        &self.id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn features(&self) -> &[String] {
        &self.features
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> TenantStatus {
        *self.status.read()
    }

    pub fn is_active(&self) -> bool {
        self.status() == TenantStatus::Active && !self.is_deleted()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.read().is_some()
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    pub fn serves_domain(&self, domain: &str) -> bool {
        self.domains.iter().any(|d| d.eq_ignore_ascii_case(domain))
    }

    pub fn record(&self) -> TenantRecord {
        TenantRecord {
            id: self.id.clone(),
            code: self.code.clone(),
            name: self.name.clone(),
            database: self.database.clone(),
            status: self.status(),
            settings: self.settings.read().clone(),
            features: self.features.clone(),
            domains: self.domains.clone(),
            version: self.version.clone(),
            created_at: self.created_at,
            deleted_at: *self.deleted_at.read(),
        }
    }

    pub fn setting(&self, key: &str) -> Option<SettingValue> {
        self.settings.read().get(key).cloned()
    }

    pub async fn set_setting(&self, key: &str, value: impl Into<SettingValue>) -> RuntimeResult<()> {
        self.settings.write().insert(key.to_string(), value.into());
        self.store.save(&self.record()).await
    }

    pub(crate) async fn set_status(&self, status: TenantStatus) -> RuntimeResult<()> {
        *self.status.write() = status;
        self.store.save(&self.record()).await?;
        tracing::info!(tenant_id = %self.id, ?status, "Tenant status changed");
        self.events.tenants.publish(TenantEvent::StatusChanged {
            tenant_id: self.id.clone(),
            status,
        });
        Ok(())
    }

    pub(crate) async fn mark_deleted(&self) -> RuntimeResult<()> {
        *self.deleted_at.write() = Some(Utc::now());
        *self.status.write() = TenantStatus::Inactive;
        self.store.save(&self.record()).await
    }

    /// The tenant's cached connection
    pub async fn connection(&self) -> RuntimeResult<Arc<dyn DataConnection>> {
        self.store.connection(&self.id, &self.database).await
    }

    // ── Companies ────────────────────────────────────────────────────

    /// Create, initialize and persist a company owned by this tenant
    pub async fn create_company(&self, config: CompanyConfig) -> RuntimeResult<Arc<Company>> {
        let company = Company::new(
            config,
            Some(self.id.clone()),
            self.store.server(),
            Arc::clone(&self.events),
        );
        if self
            .companies
            .read()
            .iter()
            .any(|existing| existing.id() == company.id() || existing.database() == company.database())
        {
            return Err(RuntimeError::DuplicateDatabase(company.database().to_string()));
        }

        company.initialize().await?;
        let connection = self.connection().await?;
        connection
            .query(Statement::upsert(
                COMPANIES_TABLE,
                company.id().as_str(),
                to_row(&company.record())?,
            ))
            .await?;
        self.companies.write().push(Arc::clone(&company));

        tracing::info!(tenant_id = %self.id, company_id = %company.id(), "Tenant company created");
        self.events.tenants.publish(TenantEvent::CompanyCreated {
            tenant_id: self.id.clone(),
            company_id: company.id().clone(),
        });
        Ok(company)
    }

    /// Restore persisted companies; returns how many were loaded
    pub(crate) async fn load_companies(&self) -> RuntimeResult<usize> {
        let connection = self.connection().await?;
        let mut records: Vec<CompanyRecord> = connection
            .query(Statement::scan(COMPANIES_TABLE))
            .await?
            .rows
            .into_iter()
            .map(from_row::<CompanyRecord>)
            .collect::<RuntimeResult<_>>()?;
        records.sort_by_key(|record| record.created_at);

        let mut loaded = Vec::with_capacity(records.len());
        for record in records {
            let company = Company::from_record(record, self.store.server(), Arc::clone(&self.events));
            company.initialize().await?;
            loaded.push(company);
        }
        let count = loaded.len();
        *self.companies.write() = loaded;
        Ok(count)
    }

    /// Companies in creation order
    pub fn companies(&self) -> Vec<Arc<Company>> {
        self.companies.read().clone()
    }

    pub fn company(&self, id: &CompanyId) -> Option<Arc<Company>> {
        self.companies
            .read()
            .iter()
            .find(|company| company.id() == id)
            .cloned()
    }

    // ── Sessions ─────────────────────────────────────────────────────

    /// Track `session` as bound to this tenant until it closes or moves.
    /// Repeatable.
    pub fn set_context(self: &Arc<Self>, session: &Session) {
        self.sessions.insert(session.id().clone(), session.downgrade());
        let observer: Weak<dyn SessionObserver> = Arc::downgrade(self) as Weak<dyn SessionObserver>;
        session.add_observer(self.observer_key(), observer);
    }

    pub(crate) fn observer_key(&self) -> String {
        format!("tenant:{}", self.id)
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Shut down every company, close remaining sessions and drop the
    /// tenant connection
    pub async fn shutdown(&self) {
        for company in self.companies() {
            company.shutdown().await;
        }

        let sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        self.sessions.clear();
        for session in sessions {
            session.close().await;
        }

        self.store.disconnect(&self.id).await;
        tracing::info!(tenant_id = %self.id, "Tenant shut down");
        self.events.tenants.publish(TenantEvent::Shutdown {
            tenant_id: self.id.clone(),
        });
    }
}

impl SessionObserver for Tenant {
    fn detach_session(&self, session_id: &SessionId) {
        self.sessions.remove(session_id);
    }
}

impl std::fmt::Debug for Tenant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tenant")
            .field("id", &self.id)
            .field("code", &self.code)
            .field("database", &self.database)
            .field("status", &self.status())
            .finish()
    }
}
