use arbor_data::LockMode;
use arbor_types::{CompanyId, EventBus, NamedEvent, SessionId, TenantId};
use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TenantEvent {
    Registered { tenant_id: TenantId, code: String },
    Initialized { tenant_id: TenantId },
    DatabaseCreated { tenant_id: TenantId, database: String },
    CompanyCreated { tenant_id: TenantId, company_id: CompanyId },
    StatusChanged { tenant_id: TenantId, status: crate::TenantStatus },
    Deleted { tenant_id: TenantId },
    Shutdown { tenant_id: TenantId },
}

impl NamedEvent for TenantEvent {
    fn name(&self) -> &'static str {
        match self {
            TenantEvent::Registered { .. } => "tenant_registered",
            TenantEvent::Initialized { .. } => "tenant_initialized",
            TenantEvent::DatabaseCreated { .. } => "tenant_database_created",
            TenantEvent::CompanyCreated { .. } => "tenant_company_created",
            TenantEvent::StatusChanged { .. } => "tenant_status_changed",
            TenantEvent::Deleted { .. } => "tenant_deleted",
            TenantEvent::Shutdown { .. } => "tenant_shutdown",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CompanyEvent {
    Initialized { company_id: CompanyId },
    DatabaseCreated { company_id: CompanyId, database: String },
    SettingChanged { company_id: CompanyId, key: String },
    Shutdown { company_id: CompanyId, sessions_closed: usize },
}

impl NamedEvent for CompanyEvent {
    fn name(&self) -> &'static str {
        match self {
            CompanyEvent::Initialized { .. } => "company_initialized",
            CompanyEvent::DatabaseCreated { .. } => "company_database_created",
            CompanyEvent::SettingChanged { .. } => "company_setting_changed",
            CompanyEvent::Shutdown { .. } => "company_shutdown",
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Initialized {
        session_id: SessionId,
        username: String,
        company_id: CompanyId,
        tenant_id: Option<TenantId>,
    },
    Closed { session_id: SessionId },
    LockAcquired { session_id: SessionId, resource: String, mode: LockMode },
    LockReleased { session_id: SessionId, resource: String },
    CompanySwitched { session_id: SessionId, from: CompanyId, to: CompanyId },
    TenantSwitched { session_id: SessionId, from: Option<TenantId>, to: TenantId },
}

impl NamedEvent for SessionEvent {
    fn name(&self) -> &'static str {
        match self {
            SessionEvent::Initialized { .. } => "session_initialized",
            SessionEvent::Closed { .. } => "session_closed",
            SessionEvent::LockAcquired { .. } => "lock_acquired",
            SessionEvent::LockReleased { .. } => "lock_released",
            SessionEvent::CompanySwitched { .. } => "company_switched",
            SessionEvent::TenantSwitched { .. } => "tenant_switched",
        }
    }
}

/// Event buses shared by every runtime component
#[derive(Default)]
pub struct RuntimeEvents {
    pub tenants: EventBus<TenantEvent>,
    pub companies: EventBus<CompanyEvent>,
    pub sessions: EventBus<SessionEvent>,
}

impl RuntimeEvents {
    pub fn new() -> Self {
        Self::default()
    }
}
