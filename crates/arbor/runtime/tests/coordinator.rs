//! Application coordinator: tenants, companies and session lifecycle

use arbor_data::{DataConnection, DataError, DataResult, DataServer, MemoryServer};
use async_trait::async_trait;
use arbor_runtime::{
    Application, CompanyConfig, CompanyStatus, RuntimeConfig, RuntimeError, TenantConfig,
    TenantEvent, TenantStatus,
};
use arbor_types::{Credentials, SettingValue};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use workflow_types::{StateDefinition, TransitionDefinition, WorkflowDefinition};

struct Harness {
    server: Arc<MemoryServer>,
    auth: Arc<arbor_runtime::StaticAuthorizer>,
    app: Application,
}

async fn harness_with(config: RuntimeConfig) -> Harness {
    let server = Arc::new(MemoryServer::new());
    let auth = Arc::new(arbor_runtime::StaticAuthorizer::new());
    auth.add_user("u1", "secret", ["*"]);
    auth.add_user("clerk", "secret", ["customer:*"]);
    auth.add_user("support", "secret", ["session:impersonate"]);
    let app = Application::open(config, server.clone(), auth.clone())
        .await
        .unwrap();
    Harness { server, auth, app }
}

async fn harness() -> Harness {
    harness_with(RuntimeConfig::default()).await
}

fn creds(username: &str) -> Credentials {
    Credentials::new(username, "secret")
}

/// Memory server that refuses to create or open chosen databases
struct FailingServer {
    inner: MemoryServer,
    refuse_create: Option<&'static str>,
    refuse_connect: Option<&'static str>,
}

impl FailingServer {
    fn new() -> Self {
        Self {
            inner: MemoryServer::new(),
            refuse_create: None,
            refuse_connect: None,
        }
    }
}

#[async_trait]
impl DataServer for FailingServer {
    async fn database_exists(&self, name: &str) -> DataResult<bool> {
        self.inner.database_exists(name).await
    }

    async fn create_database(&self, name: &str) -> DataResult<()> {
        if self.refuse_create == Some(name) {
            return Err(DataError::Backend(format!("disk full creating {name}")));
        }
        self.inner.create_database(name).await
    }

    async fn drop_database(&self, name: &str) -> DataResult<()> {
        self.inner.drop_database(name).await
    }

    async fn connect(&self, database: &str) -> DataResult<Arc<dyn DataConnection>> {
        if self.refuse_connect == Some(database) {
            return Err(DataError::Backend(format!("connection refused for {database}")));
        }
        self.inner.connect(database).await
    }
}

async fn app_on(server: Arc<FailingServer>) -> Application {
    let auth = Arc::new(arbor_runtime::StaticAuthorizer::new());
    Application::open(RuntimeConfig::default(), server, auth)
        .await
        .unwrap()
}

#[tokio::test]
async fn registering_a_tenant_provisions_its_database() {
    let h = harness().await;
    let mut events = h.app.events().tenants.subscribe();

    let tenant = h
        .app
        .register_tenant(TenantConfig::new("Acme", "acme").with_domain("acme.example"))
        .await
        .unwrap();

    assert_eq!(tenant.status(), TenantStatus::Active);
    assert_eq!(tenant.database(), "tenant_acme");
    assert!(h.server.database_names().contains(&"tenant_acme".to_string()));
    assert!(h.app.tenants().get_tenant_by_code("ACME").is_some());
    assert!(h.app.tenants().get_tenant_by_domain("acme.example").is_some());

    let first = events.recv().await.unwrap();
    assert!(matches!(first, TenantEvent::DatabaseCreated { ref database, .. } if database == "tenant_acme"));
}

#[tokio::test]
async fn duplicate_tenant_codes_are_rejected() {
    let h = harness().await;
    h.app
        .register_tenant(TenantConfig::new("Acme", "acme"))
        .await
        .unwrap();

    let err = h
        .app
        .register_tenant(TenantConfig::new("Acme Again", "Acme"))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::DuplicateTenantCode(code) if code == "Acme"));
    assert_eq!(h.app.tenants().len(), 1);
}

#[tokio::test]
async fn deleted_tenant_code_can_be_reused() {
    let h = harness().await;
    let first = h
        .app
        .register_tenant(TenantConfig::new("Acme", "acme"))
        .await
        .unwrap();
    h.app
        .create_tenant_company(first.id(), CompanyConfig::new("Acme Main").with_id("acme-main"))
        .await
        .unwrap();

    h.app.delete_tenant(first.id()).await.unwrap();
    assert!(first.is_deleted());
    assert!(h.app.tenants().get_tenant(first.id()).is_none());
    assert!(h.app.get_company(&"acme-main".into()).is_none());

    let second = h
        .app
        .register_tenant(TenantConfig::new("Acme", "acme"))
        .await
        .unwrap();
    assert_ne!(second.id(), first.id());
    assert_eq!(second.database(), "tenant_acme_2");
}

#[tokio::test]
async fn failed_database_creation_leaves_no_tenant() {
    let server = Arc::new(FailingServer {
        refuse_create: Some("tenant_acme"),
        ..FailingServer::new()
    });
    let app = app_on(server.clone()).await;
    let before = app.tenants().len();

    let err = app
        .register_tenant(TenantConfig::new("Acme", "acme"))
        .await
        .unwrap_err();

    assert!(matches!(err, RuntimeError::ProvisioningError { ref database, .. } if database == "tenant_acme"));
    assert!(app.tenants().get_tenant_by_code("acme").is_none());
    assert_eq!(app.tenants().len(), before);
    assert!(!server.database_exists("tenant_acme").await.unwrap());
}

#[tokio::test]
async fn failed_tenant_persist_drops_the_new_database() {
    let server = Arc::new(FailingServer {
        refuse_connect: Some("tenant_acme"),
        ..FailingServer::new()
    });
    let app = app_on(server.clone()).await;

    assert!(app
        .register_tenant(TenantConfig::new("Acme", "acme"))
        .await
        .is_err());

    assert!(app.tenants().get_tenant_by_code("acme").is_none());
    assert!(app.tenants().is_empty());
    assert!(!server.database_exists("tenant_acme").await.unwrap());
}

#[tokio::test]
async fn session_without_company_binds_the_default_company() {
    let h = harness().await;
    h.app
        .create_company(CompanyConfig::new("First").with_id("first"))
        .await
        .unwrap();
    h.app
        .create_company(CompanyConfig::new("Second").with_id("second"))
        .await
        .unwrap();

    let session = h.app.create_session(&creds("u1"), None, None).await.unwrap();
    assert_eq!(session.company().id().as_str(), "first");
    assert!(session.is_initialized());
    assert!(session.tenant().is_none());
    assert_eq!(h.app.session_count(), 1);
}

#[tokio::test]
async fn default_company_skips_inactive_companies() {
    let h = harness().await;
    h.app
        .create_company(
            CompanyConfig::new("Old")
                .with_id("old")
                .with_status(CompanyStatus::Suspended),
        )
        .await
        .unwrap();
    h.app
        .create_company(CompanyConfig::new("New").with_id("new"))
        .await
        .unwrap();

    let session = h.app.create_session(&creds("u1"), None, None).await.unwrap();
    assert_eq!(session.company().id().as_str(), "new");

    let err = h
        .app
        .create_session(&creds("u1"), Some(&"old".into()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::CompanyUnavailable { status: CompanyStatus::Suspended, .. }));
}

#[tokio::test]
async fn session_creation_failures() {
    let h = harness().await;

    let err = h.app.create_session(&creds("u1"), None, None).await.unwrap_err();
    assert!(matches!(err, RuntimeError::NoCompanyAvailable));

    h.app
        .create_company(CompanyConfig::new("Main").with_id("main"))
        .await
        .unwrap();
    let err = h
        .app
        .create_session(&Credentials::new("u1", "wrong"), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::AuthenticationFailed));

    let err = h
        .app
        .create_session(&creds("u1"), Some(&"missing".into()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::CompanyNotFound(_)));
    assert_eq!(h.app.session_count(), 0);
}

#[tokio::test]
async fn duplicate_companies_are_rejected() {
    let h = harness().await;
    h.app
        .create_company(CompanyConfig::new("Main").with_id("main"))
        .await
        .unwrap();

    let err = h
        .app
        .create_company(CompanyConfig::new("Main").with_id("main"))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::DuplicateCompany(_)));

    let err = h
        .app
        .create_company(
            CompanyConfig::new("Other")
                .with_id("other")
                .with_database("company_main"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::DuplicateDatabase(db) if db == "company_main"));
}

#[tokio::test]
async fn tenant_company_brings_its_tenant_along() {
    let h = harness().await;
    let tenant = h
        .app
        .register_tenant(TenantConfig::new("Acme", "acme"))
        .await
        .unwrap();
    h.app
        .create_tenant_company(tenant.id(), CompanyConfig::new("Acme Main").with_id("acme-main"))
        .await
        .unwrap();

    let session = h
        .app
        .create_session(&creds("u1"), Some(&"acme-main".into()), None)
        .await
        .unwrap();
    assert_eq!(session.tenant().unwrap().id(), tenant.id());
    assert_eq!(tenant.active_sessions(), vec![session.id().clone()]);

    let by_tenant = h
        .app
        .create_session(&creds("u1"), None, Some(tenant.id()))
        .await
        .unwrap();
    assert_eq!(by_tenant.company().id().as_str(), "acme-main");
}

#[tokio::test]
async fn company_of_another_tenant_is_refused() {
    let h = harness().await;
    let acme = h
        .app
        .register_tenant(TenantConfig::new("Acme", "acme"))
        .await
        .unwrap();
    let globex = h
        .app
        .register_tenant(TenantConfig::new("Globex", "globex"))
        .await
        .unwrap();
    h.app
        .create_tenant_company(acme.id(), CompanyConfig::new("Acme Main").with_id("acme-main"))
        .await
        .unwrap();
    h.app
        .create_tenant_company(globex.id(), CompanyConfig::new("Globex HQ").with_id("globex-hq"))
        .await
        .unwrap();

    let err = h
        .app
        .create_session(&creds("u1"), Some(&"acme-main".into()), Some(globex.id()))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::TenantMismatch { .. }));

    let session = h
        .app
        .create_session(&creds("u1"), None, Some(globex.id()))
        .await
        .unwrap();
    let err = h
        .app
        .switch_company(session.id(), &"acme-main".into())
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::TenantMismatch { .. }));
}

#[tokio::test]
async fn switching_tenant_moves_to_its_company() {
    let h = harness().await;
    let acme = h
        .app
        .register_tenant(TenantConfig::new("Acme", "acme"))
        .await
        .unwrap();
    let globex = h
        .app
        .register_tenant(TenantConfig::new("Globex", "globex"))
        .await
        .unwrap();
    h.app
        .create_tenant_company(acme.id(), CompanyConfig::new("Acme Main").with_id("acme-main"))
        .await
        .unwrap();
    h.app
        .create_tenant_company(globex.id(), CompanyConfig::new("Globex HQ").with_id("globex-hq"))
        .await
        .unwrap();

    let session = h
        .app
        .create_session(&creds("u1"), None, Some(acme.id()))
        .await
        .unwrap();
    h.app.switch_tenant(session.id(), globex.id()).await.unwrap();

    assert_eq!(session.tenant().unwrap().id(), globex.id());
    assert_eq!(session.company().id().as_str(), "globex-hq");
    assert!(acme.active_sessions().is_empty());
    assert_eq!(globex.active_sessions(), vec![session.id().clone()]);
}

#[tokio::test]
async fn suspended_tenant_cannot_open_sessions() {
    let h = harness().await;
    let tenant = h
        .app
        .register_tenant(TenantConfig::new("Acme", "acme"))
        .await
        .unwrap();
    h.app
        .create_tenant_company(tenant.id(), CompanyConfig::new("Acme Main"))
        .await
        .unwrap();
    h.app
        .tenants()
        .set_status(tenant.id(), TenantStatus::Suspended)
        .await
        .unwrap();

    let err = h
        .app
        .create_session(&creds("u1"), None, Some(tenant.id()))
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::TenantUnavailable { status: TenantStatus::Suspended, .. }));
}

#[tokio::test]
async fn tenants_and_companies_survive_a_restart() {
    let h = harness().await;
    let tenant = h
        .app
        .register_tenant(TenantConfig::new("Acme", "acme").with_setting("plan", "gold"))
        .await
        .unwrap();
    h.app
        .create_tenant_company(tenant.id(), CompanyConfig::new("Acme Main").with_id("acme-main"))
        .await
        .unwrap();
    h.app.shutdown().await;

    let reopened = Application::open(RuntimeConfig::default(), h.server.clone(), h.auth.clone())
        .await
        .unwrap();
    let restored = reopened.tenants().get_tenant_by_code("acme").unwrap();
    assert_eq!(restored.id(), tenant.id());
    assert_eq!(restored.setting("plan"), Some(SettingValue::from("gold")));

    let company = reopened.get_company(&"acme-main".into()).unwrap();
    assert_eq!(company.tenant_id(), Some(tenant.id()));
    assert!(company.is_initialized());
}

#[tokio::test]
async fn company_settings_keep_their_types() {
    let h = harness().await;
    let company = h
        .app
        .create_company(CompanyConfig::new("Main").with_id("main"))
        .await
        .unwrap();

    company.set_setting("X", 42).await.unwrap();
    company.set_setting("Y", true).await.unwrap();

    assert_eq!(company.get_setting("X").await.unwrap(), Some(SettingValue::Integer(42)));
    assert_eq!(company.get_setting("Y").await.unwrap(), Some(SettingValue::Boolean(true)));
    assert_eq!(
        company.get_setting("currency").await.unwrap(),
        Some(SettingValue::from("USD"))
    );
}

#[tokio::test]
async fn impersonation_requires_permission() {
    let h = harness().await;
    h.app
        .create_company(CompanyConfig::new("Main").with_id("main"))
        .await
        .unwrap();

    let clerk = h.app.create_session(&creds("clerk"), None, None).await.unwrap();
    let err = h.app.impersonate(clerk.id(), "u1").await.unwrap_err();
    assert!(matches!(err, RuntimeError::PermissionDenied { .. }));

    let support = h.app.create_session(&creds("support"), None, None).await.unwrap();
    let as_clerk = h.app.impersonate(support.id(), "clerk").await.unwrap();
    assert_eq!(as_clerk.user().username, "clerk");
    assert_eq!(as_clerk.company().id(), support.company().id());
    assert!(as_clerk.check_permission("customer:read", None));
    assert!(!support.is_closed());

    let err = h.app.impersonate(support.id(), "nobody").await.unwrap_err();
    assert!(matches!(err, RuntimeError::AuthenticationFailed));
}

#[tokio::test]
async fn idle_sessions_are_reaped() {
    let mut config = RuntimeConfig::default();
    config.session.timeout_secs = 0;
    let h = harness_with(config).await;
    let company = h
        .app
        .create_company(CompanyConfig::new("Main").with_id("main"))
        .await
        .unwrap();

    let session = h.app.create_session(&creds("u1"), None, None).await.unwrap();
    assert_eq!(company.session_count(), 1);

    assert_eq!(h.app.reap_idle_sessions().await, 1);
    assert!(session.is_closed());
    assert_eq!(h.app.session_count(), 0);
    assert_eq!(company.session_count(), 0);
    assert!(h.app.get_session(session.id()).is_none());
}

#[tokio::test]
async fn active_sessions_are_not_reaped() {
    let h = harness().await;
    h.app
        .create_company(CompanyConfig::new("Main").with_id("main"))
        .await
        .unwrap();
    let session = h.app.create_session(&creds("u1"), None, None).await.unwrap();

    assert_eq!(h.app.reap_idle_sessions().await, 0);
    assert!(h.app.get_session(session.id()).is_some());
}

#[tokio::test]
async fn end_session_is_idempotent() {
    let h = harness().await;
    h.app
        .create_company(CompanyConfig::new("Main").with_id("main"))
        .await
        .unwrap();
    let session = h.app.create_session(&creds("u1"), None, None).await.unwrap();

    assert!(h.app.end_session(session.id()).await);
    assert!(!h.app.end_session(session.id()).await);
    assert!(matches!(
        h.app.switch_company(session.id(), &"main".into()).await,
        Err(RuntimeError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn workflows_started_for_a_session_carry_its_reference() {
    let h = harness().await;
    h.app
        .create_company(CompanyConfig::new("Main").with_id("main"))
        .await
        .unwrap();
    let session = h.app.create_session(&creds("u1"), None, None).await.unwrap();

    let definition = WorkflowDefinition::new("Approval")
        .with_state(StateDefinition::new("draft"))
        .with_state(StateDefinition::new("approved").final_state())
        .with_transition(TransitionDefinition::new("draft", "approved"))
        .with_initial_state("draft");
    let workflow_id = h.app.workflows().register_workflow(definition).unwrap();

    let mut variables = HashMap::new();
    variables.insert("amount".to_string(), json!(120));
    let instance_id = h
        .app
        .start_workflow(&workflow_id, variables, Some(&session))
        .unwrap();

    let instance = h.app.workflows().get_instance(&instance_id).unwrap();
    let reference = instance.session.unwrap();
    assert_eq!(reference.session_id, *session.id());
    assert_eq!(reference.company_id.as_str(), "main");

    h.app.end_session(session.id()).await;
    assert!(matches!(
        h.app.start_workflow(&workflow_id, HashMap::new(), Some(&session)),
        Err(RuntimeError::SessionInactive(_))
    ));
}

#[tokio::test]
async fn hooks_without_extensions_return_nothing() {
    let h = harness().await;
    let results = h
        .app
        .execute_hook("customer.before_save", &json!({ "id": "c1" }), None)
        .await;
    assert!(results.is_empty());
}

#[tokio::test]
async fn shutdown_closes_every_session() {
    let h = harness().await;
    let company = h
        .app
        .create_company(CompanyConfig::new("Main").with_id("main"))
        .await
        .unwrap();
    let first = h.app.create_session(&creds("u1"), None, None).await.unwrap();
    let second = h.app.create_session(&creds("clerk"), None, None).await.unwrap();
    h.app.start_background_tasks();

    h.app.shutdown().await;

    assert!(first.is_closed());
    assert!(second.is_closed());
    assert_eq!(h.app.session_count(), 0);
    assert!(!company.is_initialized());
}

#[tokio::test]
async fn shut_down_company_is_no_longer_the_default() {
    let h = harness().await;
    let first = h
        .app
        .create_company(CompanyConfig::new("First").with_id("first"))
        .await
        .unwrap();
    h.app
        .create_company(CompanyConfig::new("Second").with_id("second"))
        .await
        .unwrap();
    let bound = h.app.create_session(&creds("u1"), None, None).await.unwrap();

    assert_eq!(first.shutdown().await, 1);
    assert!(bound.is_closed());
    assert_eq!(first.status(), CompanyStatus::Inactive);
    assert_eq!(h.app.default_company().unwrap().id().as_str(), "second");

    let session = h.app.create_session(&creds("u1"), None, None).await.unwrap();
    assert_eq!(session.company().id().as_str(), "second");
    assert!(session.begin_transaction(None).await.is_ok());

    assert!(matches!(
        h.app
            .create_session(&creds("u1"), Some(&"first".into()), None)
            .await,
        Err(RuntimeError::CompanyUnavailable { .. })
    ));
}
