//! Company: one logical business database
//!
//! A company owns exactly one data connection to its own database, created
//! lazily after [`Company::initialize`] has ensured the database exists.
//! The first connection bootstraps the settings table with defaults.
//! Sessions bound to the company are tracked weakly; only
//! [`Company::shutdown`] closes them from outside the coordinator.

use crate::records::database_name;
use crate::session::{Session, SessionObserver, WeakSession};
use crate::{CompanyEvent, RuntimeError, RuntimeEvents, RuntimeResult};
use arbor_data::{DataConnection, DataServer, Row, Statement};
use arbor_types::{CompanyId, SessionId, SettingValue, TenantId};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;

pub const SETTINGS_TABLE: &str = "settings";

const DEFAULT_SETTINGS: [(&str, &str); 5] = [
    ("currency", "USD"),
    ("date_format", "YYYY-MM-DD"),
    ("time_zone", "UTC"),
    ("language", "en"),
    ("fiscal_year_start", "01-01"),
];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompanyStatus {
    #[default]
    Active,
    Inactive,
    Suspended,
    Pending,
    Deleted,
}

/// Parameters for creating a company
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompanyConfig {
    #[serde(default)]
    pub id: Option<CompanyId>,
    pub name: String,
    /// Derived from the id when unset
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub status: CompanyStatus,
}

impl CompanyConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            database: None,
            status: CompanyStatus::Active,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(CompanyId::new(id));
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_status(mut self, status: CompanyStatus) -> Self {
        self.status = status;
        self
    }

    /// The database name this config resolves to for `id`
    pub fn database_for(&self, id: &CompanyId) -> String {
        self.database
            .clone()
            .unwrap_or_else(|| database_name("company", id.as_str()))
    }
}

/// Persisted form of a company
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CompanyRecord {
    pub id: CompanyId,
    pub name: String,
    pub database: String,
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
    pub status: CompanyStatus,
    pub created_at: DateTime<Utc>,
}

/// Typed view of a company's settings table
#[derive(Clone, Debug, PartialEq)]
pub struct CompanySettings {
    pub currency: String,
    pub date_format: String,
    pub time_zone: String,
    pub language: String,
    pub fiscal_year_start: String,
    pub extras: BTreeMap<String, SettingValue>,
}

pub struct Company {
    id: CompanyId,
    name: String,
    database: String,
    tenant_id: Option<TenantId>,
    created_at: DateTime<Utc>,
    status: RwLock<CompanyStatus>,
    server: Arc<dyn DataServer>,
    events: Arc<RuntimeEvents>,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
    connection: Mutex<Option<Arc<dyn DataConnection>>>,
    sessions: DashMap<SessionId, WeakSession>,
}

impl Company {
    pub fn new(
        config: CompanyConfig,
        tenant_id: Option<TenantId>,
        server: Arc<dyn DataServer>,
        events: Arc<RuntimeEvents>,
    ) -> Arc<Self> {
        let id = config.id.clone().unwrap_or_else(CompanyId::generate);
        let record = CompanyRecord {
            database: config.database_for(&id),
            id,
            name: config.name,
            tenant_id,
            status: config.status,
            created_at: Utc::now(),
        };
        Self::from_record(record, server, events)
    }

    pub fn from_record(
        record: CompanyRecord,
        server: Arc<dyn DataServer>,
        events: Arc<RuntimeEvents>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: record.id,
            name: record.name,
            database: record.database,
            tenant_id: record.tenant_id,
            created_at: record.created_at,
            status: RwLock::new(record.status),
            server,
            events,
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
            connection: Mutex::new(None),
            sessions: DashMap::new(),
        })
    }

    pub fn id(&self) -> &CompanyId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Owning tenant, `None` for standalone companies
    pub fn tenant_id(&self) -> Option<&TenantId> {
        self.tenant_id.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> CompanyStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: CompanyStatus) {
        *self.status.write() = status;
    }

    pub fn is_active(&self) -> bool {
        self.status() == CompanyStatus::Active
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn record(&self) -> CompanyRecord {
        CompanyRecord {
            id: self.id.clone(),
            name: self.name.clone(),
            database: self.database.clone(),
            tenant_id: self.tenant_id.clone(),
            status: self.status(),
            created_at: self.created_at,
        }
    }

    /// Ensure the company database exists. Idempotent.
    pub async fn initialize(&self) -> RuntimeResult<()> {
        let _init = self.init_lock.lock().await;
        if self.is_initialized() {
            return Ok(());
        }

        if !self.server.database_exists(&self.database).await? {
            self.server
                .create_database(&self.database)
                .await
                .map_err(|err| RuntimeError::ProvisioningError {
                    database: self.database.clone(),
                    reason: err.to_string(),
                })?;
            tracing::info!(company_id = %self.id, database = %self.database, "Company database created");
            self.events.companies.publish(CompanyEvent::DatabaseCreated {
                company_id: self.id.clone(),
                database: self.database.clone(),
            });
        }

        self.initialized.store(true, Ordering::SeqCst);
        tracing::debug!(company_id = %self.id, "Company initialized");
        self.events.companies.publish(CompanyEvent::Initialized {
            company_id: self.id.clone(),
        });
        Ok(())
    }

    /// The company's connection, created and bootstrapped on first use
    pub async fn get_connection(&self) -> RuntimeResult<Arc<dyn DataConnection>> {
        if !self.is_initialized() {
            return Err(RuntimeError::NotInitialized(self.id.clone()));
        }

        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            if connection.is_connected() {
                return Ok(Arc::clone(connection));
            }
        }

        let connection = self.server.connect(&self.database).await?;
        bootstrap_schema(connection.as_ref()).await?;
        tracing::debug!(company_id = %self.id, database = %self.database, "Company connection opened");
        *slot = Some(Arc::clone(&connection));
        Ok(connection)
    }

    pub async fn get_setting(&self, key: &str) -> RuntimeResult<Option<SettingValue>> {
        let connection = self.get_connection().await?;
        let row = connection
            .query(Statement::get(SETTINGS_TABLE, key))
            .await?
            .into_first();
        row.map(|row| decode_setting(key, &row)).transpose()
    }

    /// Store a setting; its type is taken from the Rust value
    pub async fn set_setting(&self, key: &str, value: impl Into<SettingValue>) -> RuntimeResult<()> {
        let value = value.into();
        let connection = self.get_connection().await?;
        connection
            .query(Statement::upsert(SETTINGS_TABLE, key, setting_row(key, &value)))
            .await?;

        tracing::debug!(company_id = %self.id, key, kind = value.type_name(), "Company setting stored");
        self.events.companies.publish(CompanyEvent::SettingChanged {
            company_id: self.id.clone(),
            key: key.to_string(),
        });
        Ok(())
    }

    /// All settings, with the well-known keys split out
    pub async fn settings(&self) -> RuntimeResult<CompanySettings> {
        let connection = self.get_connection().await?;
        let rows = connection.query(Statement::scan(SETTINGS_TABLE)).await?.rows;

        let mut extras = BTreeMap::new();
        for row in rows {
            let key = row
                .get("key")
                .and_then(|key| key.as_str())
                .unwrap_or_default()
                .to_string();
            let value = decode_setting(&key, &row)?;
            extras.insert(key, value);
        }

        let mut take = |key: &str| {
            extras
                .remove(key)
                .map(|value| value.encode())
                .unwrap_or_else(|| default_setting(key).to_string())
        };
        Ok(CompanySettings {
            currency: take("currency"),
            date_format: take("date_format"),
            time_zone: take("time_zone"),
            language: take("language"),
            fiscal_year_start: take("fiscal_year_start"),
            extras,
        })
    }

    /// Track `session` as bound to this company until it closes or moves.
    /// Repeatable.
    pub fn set_context(self: &Arc<Self>, session: &Session) {
        self.sessions.insert(session.id().clone(), session.downgrade());
        let observer: Weak<dyn SessionObserver> = Arc::downgrade(self) as Weak<dyn SessionObserver>;
        session.add_observer(self.observer_key(), observer);
    }

    pub(crate) fn observer_key(&self) -> String {
        format!("company:{}", self.id)
    }

    pub fn active_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Close every bound session and release the connection.
    ///
    /// An `Active` company becomes `Inactive`, so session resolution no
    /// longer picks it. Returns the number of sessions closed.
    pub async fn shutdown(&self) -> usize {
        let sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter_map(|entry| entry.value().upgrade())
            .collect();
        self.sessions.clear();

        let closed = sessions.len();
        for session in sessions {
            session.close().await;
        }

        if let Some(connection) = self.connection.lock().await.take() {
            if let Err(err) = connection.disconnect().await {
                tracing::warn!(company_id = %self.id, error = %err, "Failed to disconnect company connection");
            }
        }
        self.initialized.store(false, Ordering::SeqCst);
        {
            let mut status = self.status.write();
            if *status == CompanyStatus::Active {
                *status = CompanyStatus::Inactive;
            }
        }

        tracing::info!(company_id = %self.id, sessions_closed = closed, "Company shut down");
        self.events.companies.publish(CompanyEvent::Shutdown {
            company_id: self.id.clone(),
            sessions_closed: closed,
        });
        closed
    }
}

impl SessionObserver for Company {
    fn detach_session(&self, session_id: &SessionId) {
        self.sessions.remove(session_id);
    }
}

impl std::fmt::Debug for Company {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Company")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("database", &self.database)
            .field("tenant_id", &self.tenant_id)
            .field("status", &self.status())
            .finish()
    }
}

async fn bootstrap_schema(connection: &dyn DataConnection) -> RuntimeResult<()> {
    connection.query(Statement::ensure_table(SETTINGS_TABLE)).await?;
    for (key, value) in DEFAULT_SETTINGS {
        let existing = connection.query(Statement::get(SETTINGS_TABLE, key)).await?;
        if existing.is_empty() {
            let value = SettingValue::from(value);
            connection
                .query(Statement::upsert(SETTINGS_TABLE, key, setting_row(key, &value)))
                .await?;
        }
    }
    Ok(())
}

fn default_setting(key: &str) -> &'static str {
    DEFAULT_SETTINGS
        .iter()
        .find(|(name, _)| *name == key)
        .map(|(_, value)| *value)
        .unwrap_or_default()
}

fn setting_row(key: &str, value: &SettingValue) -> Row {
    let mut row = Row::new();
    row.insert("key".into(), json!(key));
    row.insert("value".into(), json!(value.encode()));
    row.insert("type".into(), json!(value.type_name()));
    row
}

fn decode_setting(key: &str, row: &Row) -> RuntimeResult<SettingValue> {
    let field = |name: &str| row.get(name).and_then(|v| v.as_str()).unwrap_or_default();
    SettingValue::decode(field("type"), field("value")).map_err(|source| {
        RuntimeError::InvalidSetting {
            key: key.to_string(),
            source,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_data::MemoryServer;

    fn company(server: &Arc<MemoryServer>) -> Arc<Company> {
        let server: Arc<dyn DataServer> = Arc::clone(server) as Arc<dyn DataServer>;
        Company::new(
            CompanyConfig::new("Acme Trading").with_id("acme-1"),
            None,
            server,
            Arc::new(RuntimeEvents::new()),
        )
    }

    #[tokio::test]
    async fn test_connection_requires_initialize() {
        let server = Arc::new(MemoryServer::new());
        let company = company(&server);
        assert_eq!(company.database(), "company_acme_1");

        assert!(matches!(
            company.get_connection().await,
            Err(RuntimeError::NotInitialized(_))
        ));

        company.initialize().await.unwrap();
        company.initialize().await.unwrap();
        assert!(server.database_exists("company_acme_1").await.unwrap());

        let first = company.get_connection().await.unwrap();
        let second = company.get_connection().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_settings_round_trip_types() {
        let server = Arc::new(MemoryServer::new());
        let company = company(&server);
        company.initialize().await.unwrap();

        company.set_setting("X", 42).await.unwrap();
        company.set_setting("Y", true).await.unwrap();
        company.set_setting("rate", 0.25).await.unwrap();
        company.set_setting("label", "north").await.unwrap();

        assert_eq!(company.get_setting("X").await.unwrap(), Some(SettingValue::Integer(42)));
        assert_eq!(company.get_setting("Y").await.unwrap(), Some(SettingValue::Boolean(true)));
        assert_eq!(company.get_setting("rate").await.unwrap(), Some(SettingValue::Decimal(0.25)));
        assert_eq!(
            company.get_setting("label").await.unwrap(),
            Some(SettingValue::Text("north".into()))
        );
        assert_eq!(company.get_setting("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_defaults_written_on_bootstrap() {
        let server = Arc::new(MemoryServer::new());
        let company = company(&server);
        company.initialize().await.unwrap();
        company.set_setting("currency", "EUR").await.unwrap();
        company.set_setting("invoice_prefix", "INV").await.unwrap();

        let settings = company.settings().await.unwrap();
        assert_eq!(settings.currency, "EUR");
        assert_eq!(settings.date_format, "YYYY-MM-DD");
        assert_eq!(settings.time_zone, "UTC");
        assert_eq!(settings.language, "en");
        assert_eq!(settings.fiscal_year_start, "01-01");
        assert_eq!(
            settings.extras.get("invoice_prefix"),
            Some(&SettingValue::Text("INV".into()))
        );
        assert_eq!(settings.extras.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_releases_connection() {
        let server = Arc::new(MemoryServer::new());
        let company = company(&server);
        company.initialize().await.unwrap();
        let connection = company.get_connection().await.unwrap();

        assert_eq!(company.shutdown().await, 0);
        assert!(!connection.is_connected());
        assert_eq!(company.status(), CompanyStatus::Inactive);
        assert!(!company.is_active());
        assert!(matches!(
            company.get_connection().await,
            Err(RuntimeError::NotInitialized(_))
        ));
    }
}
