//! Session behaviour against the in-memory backend

use arbor_data::{IsolationLevel, LockMode, MemoryServer, Statement, TransactionStatus};
use arbor_runtime::{
    Application, CompanyConfig, RuntimeConfig, RuntimeError, Session, StaticAuthorizer,
};
use arbor_types::Credentials;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    server: Arc<MemoryServer>,
    app: Application,
}

async fn harness() -> Harness {
    let server = Arc::new(MemoryServer::with_settings(
        Duration::from_millis(50),
        IsolationLevel::default(),
    ));
    let auth = Arc::new(StaticAuthorizer::new());
    auth.add_user("alice", "pw", ["*"]);
    auth.add_user("bob", "pw", ["customer:read"]);

    let app = Application::open(RuntimeConfig::default(), server.clone(), auth)
        .await
        .unwrap();
    app.create_company(CompanyConfig::new("North").with_id("north"))
        .await
        .unwrap();
    app.create_company(CompanyConfig::new("South").with_id("south"))
        .await
        .unwrap();
    Harness { server, app }
}

async fn login(app: &Application, username: &str, company: &str) -> Session {
    app.create_session(
        &Credentials::new(username, "pw"),
        Some(&company.into()),
        None,
    )
    .await
    .unwrap()
}

fn customer(name: &str) -> arbor_data::Row {
    let mut row = arbor_data::Row::new();
    row.insert("name".to_string(), json!(name));
    row
}

#[tokio::test]
async fn sessions_on_different_companies_see_separate_data() {
    let h = harness().await;
    let north = login(&h.app, "alice", "north").await;
    let south = login(&h.app, "alice", "south").await;

    for session in [&north, &south] {
        session
            .execute(Statement::ensure_table("customers"))
            .await
            .unwrap();
    }
    north
        .execute(Statement::upsert("customers", "c1", customer("Northwind")))
        .await
        .unwrap();

    let from_south = south
        .execute(Statement::get("customers", "c1"))
        .await
        .unwrap();
    assert!(from_south.is_empty());

    let from_north = north
        .execute(Statement::get("customers", "c1"))
        .await
        .unwrap();
    assert_eq!(from_north.first().unwrap()["name"], json!("Northwind"));
}

#[tokio::test]
async fn only_one_transaction_at_a_time() {
    let h = harness().await;
    let session = login(&h.app, "alice", "north").await;

    session.begin_transaction(None).await.unwrap();
    assert!(session.has_transaction());
    let err = session.begin_transaction(None).await.err().unwrap();
    assert!(matches!(err, RuntimeError::TransactionAlreadyActive(_)));

    session.commit_transaction().await.unwrap();
    assert!(!session.has_transaction());
    session
        .begin_transaction(Some(IsolationLevel::Serializable))
        .await
        .unwrap();
    session.rollback_transaction().await.unwrap();
    session.begin_transaction(None).await.unwrap();
}

#[tokio::test]
async fn commit_without_transaction_fails() {
    let h = harness().await;
    let session = login(&h.app, "alice", "north").await;

    assert!(matches!(
        session.commit_transaction().await,
        Err(RuntimeError::NoActiveTransaction(_))
    ));
    assert!(matches!(
        session.rollback_transaction().await,
        Err(RuntimeError::NoActiveTransaction(_))
    ));
}

#[tokio::test]
async fn transaction_writes_are_visible_after_commit_only() {
    let h = harness().await;
    let writer = login(&h.app, "alice", "north").await;
    let reader = login(&h.app, "bob", "north").await;
    writer
        .execute(Statement::ensure_table("customers"))
        .await
        .unwrap();

    writer.begin_transaction(None).await.unwrap();
    writer
        .execute(Statement::upsert("customers", "c1", customer("Acme")))
        .await
        .unwrap();
    assert!(reader
        .execute(Statement::get("customers", "c1"))
        .await
        .unwrap()
        .is_empty());

    writer.commit_transaction().await.unwrap();
    assert_eq!(
        reader
            .execute(Statement::get("customers", "c1"))
            .await
            .unwrap()
            .len(),
        1
    );
}

#[tokio::test]
async fn finishing_the_handle_directly_clears_the_session_slot() {
    let h = harness().await;
    let session = login(&h.app, "alice", "north").await;

    let transaction = session.begin_transaction(None).await.unwrap();
    transaction.commit().await.unwrap();
    assert_eq!(transaction.status(), TransactionStatus::Committed);

    assert!(!session.has_transaction());
    session.begin_transaction(None).await.unwrap();
}

#[tokio::test]
async fn second_lock_on_same_resource_returns_false() {
    let h = harness().await;
    let session = login(&h.app, "alice", "north").await;

    assert!(session.lock("Customer:42", LockMode::Exclusive).await.unwrap());
    assert!(!session.lock("Customer:42", LockMode::Shared).await.unwrap());

    let database = session.company().database().to_string();
    let holders = h.server.lock_holders(&database, "Customer:42");
    assert_eq!(holders, vec![(session.id().to_string(), LockMode::Exclusive)]);
    assert_eq!(session.held_locks().len(), 1);
}

#[tokio::test]
async fn advisory_locks_exclude_other_sessions() {
    let h = harness().await;
    let first = login(&h.app, "alice", "north").await;
    let second = login(&h.app, "bob", "north").await;

    assert!(first.lock("Invoice:7", LockMode::Exclusive).await.unwrap());
    assert!(!second.lock("Invoice:7", LockMode::Exclusive).await.unwrap());
    assert!(!second.holds_lock("Invoice:7"));

    assert!(first.release_lock("Invoice:7").await.unwrap());
    assert!(!first.release_lock("Invoice:7").await.unwrap());
    assert!(second.lock("Invoice:7", LockMode::Exclusive).await.unwrap());
}

#[tokio::test]
async fn close_rolls_back_and_releases_everything() {
    let h = harness().await;
    let session = login(&h.app, "alice", "north").await;
    session
        .execute(Statement::ensure_table("customers"))
        .await
        .unwrap();
    let database = session.company().database().to_string();

    session.begin_transaction(None).await.unwrap();
    session
        .execute(Statement::upsert("customers", "c9", customer("Ghost")))
        .await
        .unwrap();
    assert!(session.lock("Customer:42", LockMode::Exclusive).await.unwrap());
    assert!(!session.lock("Customer:42", LockMode::Exclusive).await.unwrap());

    h.app.end_session(session.id()).await;

    assert!(session.is_closed());
    assert!(session.held_locks().is_empty());
    assert!(!session.has_transaction());
    assert!(h.server.lock_holders(&database, "Customer:42").is_empty());

    let other = login(&h.app, "bob", "north").await;
    assert!(other
        .execute(Statement::get("customers", "c9"))
        .await
        .unwrap()
        .is_empty());

    // closing twice is harmless
    session.close().await;
    assert!(matches!(
        session.execute(Statement::scan("customers")).await,
        Err(RuntimeError::SessionInactive(_))
    ));
}

#[tokio::test]
async fn locks_are_released_on_the_company_they_were_taken_on() {
    let h = harness().await;
    let session = login(&h.app, "alice", "north").await;
    let north_db = session.company().database().to_string();

    assert!(session.lock("Order:1", LockMode::Update).await.unwrap());
    h.app
        .switch_company(session.id(), &"south".into())
        .await
        .unwrap();
    assert_eq!(session.company().id().as_str(), "south");

    assert_eq!(session.release_all_locks().await.unwrap(), 1);
    assert!(h.server.lock_holders(&north_db, "Order:1").is_empty());
}

#[tokio::test]
async fn context_switch_is_refused_inside_a_transaction() {
    let h = harness().await;
    let session = login(&h.app, "alice", "north").await;

    session.begin_transaction(None).await.unwrap();
    let err = h
        .app
        .switch_company(session.id(), &"south".into())
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::ContextSwitchDuringTransaction(_)));
    assert_eq!(session.company().id().as_str(), "north");

    session.rollback_transaction().await.unwrap();
    h.app
        .switch_company(session.id(), &"south".into())
        .await
        .unwrap();
}

#[tokio::test]
async fn company_membership_follows_the_session() {
    let h = harness().await;
    let session = login(&h.app, "alice", "north").await;
    let north = h.app.get_company(&"north".into()).unwrap();
    let south = h.app.get_company(&"south".into()).unwrap();
    assert_eq!(north.active_sessions(), vec![session.id().clone()]);

    h.app
        .switch_company(session.id(), &"south".into())
        .await
        .unwrap();
    assert!(north.active_sessions().is_empty());
    assert_eq!(south.session_count(), 1);

    h.app.end_session(session.id()).await;
    assert_eq!(south.session_count(), 0);
}

#[tokio::test]
async fn permissions_come_from_the_oracle() {
    let h = harness().await;
    let admin = login(&h.app, "alice", "north").await;
    let clerk = login(&h.app, "bob", "north").await;

    assert!(admin.check_permission("anything:write", None));
    assert!(clerk.check_permission("customer:read", Some("c1")));
    assert!(!clerk.check_permission("customer:write", None));
    assert!(matches!(
        clerk.require_permission("customer:write", None),
        Err(RuntimeError::PermissionDenied { .. })
    ));
}

#[tokio::test]
async fn variables_and_context_are_per_session() {
    let h = harness().await;
    let first = login(&h.app, "alice", "north").await;
    let second = login(&h.app, "alice", "north").await;

    first.set_variable("cart", json!(["sku-1"]));
    first.set_context_value("locale", json!("de"));
    assert_eq!(first.variable("cart"), Some(json!(["sku-1"])));
    assert_eq!(second.variable("cart"), None);
    assert_eq!(first.context_value("locale"), Some(json!("de")));

    assert_eq!(first.remove_variable("cart"), Some(json!(["sku-1"])));
    assert_eq!(first.variable("cart"), None);
}

#[tokio::test]
async fn snapshot_describes_the_binding() {
    let h = harness().await;
    let session = login(&h.app, "alice", "south").await;

    let snapshot = session.snapshot();
    assert_eq!(snapshot.session_id, *session.id());
    assert_eq!(snapshot.username, "alice");
    assert_eq!(snapshot.company_id.as_str(), "south");
    assert_eq!(snapshot.tenant_id, None);
}
