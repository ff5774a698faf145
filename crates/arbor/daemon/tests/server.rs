use arbor_daemon::{DaemonConfig, Server, TenantSeed, UserSeed};
use arbor_runtime::CompanyConfig;
use arbor_types::Credentials;

fn seeded_config(storage: &std::path::Path) -> DaemonConfig {
    let mut config = DaemonConfig::default();
    config.runtime.extensions.storage_root = storage.to_path_buf();
    config.bootstrap.users.push(UserSeed {
        username: "admin".to_string(),
        password: "changeme".to_string(),
        grants: vec!["*".to_string()],
    });
    config
        .bootstrap
        .companies
        .push(CompanyConfig::new("Headquarters").with_id("hq"));
    config.bootstrap.tenants.push(TenantSeed {
        name: "Acme".to_string(),
        code: "acme".to_string(),
        domains: vec!["acme.example".to_string()],
        features: Vec::new(),
        companies: vec![CompanyConfig::new("Acme Main").with_id("acme-main")],
    });
    config
}

#[tokio::test]
async fn bootstrap_creates_seeded_entities() {
    let storage = tempfile::tempdir().unwrap();
    let server = Server::new(seeded_config(storage.path())).await.unwrap();
    let app = server.application();

    let tenant = app.tenants().get_tenant_by_domain("acme.example").unwrap();
    assert_eq!(tenant.code(), "acme");
    assert_eq!(tenant.companies().len(), 1);
    assert_eq!(app.companies().len(), 2);
    assert_eq!(app.default_company().unwrap().id().as_str(), "hq");

    let session = app
        .create_session(&Credentials::new("admin", "changeme"), None, None)
        .await
        .unwrap();
    assert!(session.check_permission("anything", None));
}

#[tokio::test]
async fn start_without_extensions_dir_succeeds() {
    let storage = tempfile::tempdir().unwrap();
    let server = Server::new(seeded_config(storage.path())).await.unwrap();

    server.start().await.unwrap();
    assert!(server.application().extensions().list_extensions().is_empty());
    server.application().shutdown().await;
}
