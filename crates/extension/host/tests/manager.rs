use async_trait::async_trait;
use extension_host::*;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Notify;

/// Records activation order into a shared log
struct Recorder {
    id: String,
    log: Arc<Mutex<Vec<String>>>,
    fail_activate: bool,
    fail_hook: bool,
}

#[async_trait]
impl Extension for Recorder {
    async fn activate(&self, context: Arc<ExtensionContext>) -> anyhow::Result<()> {
        if self.fail_activate {
            anyhow::bail!("boom");
        }
        context.register_object(&format!("{}-object", self.id), json!({}))?;
        self.log.lock().push(format!("activate:{}", self.id));
        Ok(())
    }

    async fn deactivate(&self, _context: Arc<ExtensionContext>) -> anyhow::Result<()> {
        self.log.lock().push(format!("deactivate:{}", self.id));
        Ok(())
    }

    async fn uninstall(&self) -> anyhow::Result<()> {
        self.log.lock().push(format!("uninstall:{}", self.id));
        anyhow::bail!("cleanup script missing")
    }

    async fn handle_hook(&self, invocation: HookInvocation<'_>) -> anyhow::Result<Value> {
        if self.fail_hook {
            anyhow::bail!("handler crashed");
        }
        Ok(json!({ "from": self.id, "payload": invocation.payload }))
    }
}

/// Holds deactivation open until released
struct Gate {
    entered: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl Extension for Gate {
    async fn activate(&self, _context: Arc<ExtensionContext>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn deactivate(&self, _context: Arc<ExtensionContext>) -> anyhow::Result<()> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

struct Harness {
    manager: ExtensionManager,
    log: Arc<Mutex<Vec<String>>>,
    _storage: TempDir,
}

impl Harness {
    fn new() -> Self {
        let storage = TempDir::new().unwrap();
        let config = ExtensionHostConfig {
            storage_root: storage.path().to_path_buf(),
            ..Default::default()
        };
        Self {
            manager: ExtensionManager::new(config),
            log: Arc::new(Mutex::new(Vec::new())),
            _storage: storage,
        }
    }

    fn module(&self, id: &str) {
        self.module_with(id, false, false);
    }

    fn module_with(&self, id: &str, fail_activate: bool, fail_hook: bool) {
        let log = Arc::clone(&self.log);
        let id = id.to_string();
        self.manager.register_factory(id.clone(), move |_| {
            Ok(Arc::new(Recorder {
                id: id.clone(),
                log: Arc::clone(&log),
                fail_activate,
                fail_hook,
            }) as Arc<dyn Extension>)
        });
    }

    fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

fn manifest(id: &str) -> ExtensionManifest {
    ExtensionManifest::new(id, id, "1.0.0", "acme")
}

fn write_manifest(dir: &Path, manifest: &ExtensionManifest) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(
        dir.join(MANIFEST_FILE),
        serde_json::to_string_pretty(manifest).unwrap(),
    )
    .unwrap();
}

#[tokio::test]
async fn test_dependencies_activate_first() {
    let h = Harness::new();
    for id in ["sales", "core", "reports"] {
        h.module(id);
    }
    h.manager
        .load_extension(manifest("sales").with_dependency("core"))
        .await
        .unwrap();
    h.manager
        .load_extension(manifest("reports").with_dependency("sales"))
        .await
        .unwrap();
    h.manager.load_extension(manifest("core")).await.unwrap();

    assert_eq!(
        h.manager.resolve_dependencies().unwrap(),
        vec!["core", "sales", "reports"]
    );

    let report = h.manager.initialize_extensions().await.unwrap();
    assert!(report.failed.is_empty());
    assert_eq!(
        h.log(),
        vec!["activate:core", "activate:sales", "activate:reports"]
    );
    assert_eq!(h.manager.stats().count(ExtensionState::Enabled), 3);
}

#[tokio::test]
async fn test_enable_pulls_in_dependencies() {
    let h = Harness::new();
    h.module("core");
    h.module("sales");
    h.manager.load_extension(manifest("core")).await.unwrap();
    h.manager
        .load_extension(manifest("sales").with_dependency("core"))
        .await
        .unwrap();

    h.manager.enable_extension("sales").await.unwrap();
    assert_eq!(h.log(), vec!["activate:core", "activate:sales"]);
    assert_eq!(h.manager.state("core"), Some(ExtensionState::Enabled));
}

#[tokio::test]
async fn test_missing_dependency_is_reported() {
    let h = Harness::new();
    h.module("b");
    h.manager
        .load_extension(manifest("b").with_dependency("a"))
        .await
        .unwrap();

    let err = h.manager.enable_extension("b").await.unwrap_err();
    assert!(matches!(
        err,
        ExtensionError::MissingDependency { ref extension, ref dependency }
            if extension == "b" && dependency == "a"
    ));
    assert_eq!(h.manager.state("b"), Some(ExtensionState::Loaded));
    assert!(h.log().is_empty());

    assert!(matches!(
        h.manager.resolve_dependencies(),
        Err(ExtensionError::MissingDependency { .. })
    ));
}

#[tokio::test]
async fn test_cycle_is_reported_with_chain() {
    let h = Harness::new();
    h.module("a");
    h.module("b");
    h.manager
        .load_extension(manifest("a").with_dependency("b"))
        .await
        .unwrap();
    h.manager
        .load_extension(manifest("b").with_dependency("a"))
        .await
        .unwrap();

    match h.manager.resolve_dependencies() {
        Err(ExtensionError::CircularDependency(chain)) => {
            assert_eq!(chain, vec!["a", "b", "a"]);
        }
        other => panic!("expected cycle, got {other:?}"),
    }
    assert!(matches!(
        h.manager.enable_extension("a").await,
        Err(ExtensionError::CircularDependency(_))
    ));
}

#[tokio::test]
async fn test_duplicate_load_and_unknown_module() {
    let h = Harness::new();
    h.module("core");
    h.manager.load_extension(manifest("core")).await.unwrap();

    assert!(matches!(
        h.manager.load_extension(manifest("core")).await,
        Err(ExtensionError::AlreadyLoaded(_))
    ));
    assert!(matches!(
        h.manager.load_extension(manifest("ghost")).await,
        Err(ExtensionError::ModuleLoadError { .. })
    ));
    assert!(h.manager.get_extension("ghost").is_none());
}

#[tokio::test]
async fn test_activation_failure_marks_error() {
    let h = Harness::new();
    h.module_with("flaky", true, false);
    h.manager.load_extension(manifest("flaky")).await.unwrap();
    let mut events = h.manager.subscribe();

    let err = h.manager.enable_extension("flaky").await.unwrap_err();
    assert!(matches!(err, ExtensionError::ActivationFailed { .. }));

    let info = h.manager.get_extension("flaky").unwrap();
    assert_eq!(info.state, ExtensionState::Error);
    assert_eq!(info.error.as_deref(), Some("boom"));
    assert!(h.manager.context("flaky").is_none());
    assert!(matches!(
        events.recv().await.unwrap(),
        ExtensionEvent::ExtensionFailed { .. }
    ));
}

#[tokio::test]
async fn test_disable_blocked_by_enabled_dependents() {
    let h = Harness::new();
    h.module("core");
    h.module("sales");
    h.manager.load_extension(manifest("core")).await.unwrap();
    h.manager
        .load_extension(manifest("sales").with_dependency("core"))
        .await
        .unwrap();
    h.manager.initialize_extensions().await.unwrap();

    let err = h.manager.disable_extension("core").await.unwrap_err();
    assert!(matches!(
        err,
        ExtensionError::HasEnabledDependents { ref dependents, .. } if dependents == &["sales"]
    ));

    h.manager.disable_extension("sales").await.unwrap();
    h.manager.disable_extension("core").await.unwrap();
    assert_eq!(h.manager.state("core"), Some(ExtensionState::Disabled));
    assert!(h.manager.objects().is_empty());
    assert_eq!(
        &h.log()[2..],
        &["deactivate:sales".to_string(), "deactivate:core".to_string()]
    );
}

#[tokio::test]
async fn test_hooks_run_in_registration_order_and_swallow_errors() {
    let h = Harness::new();
    h.module("first");
    h.module_with("broken", false, true);
    h.module("last");
    for id in ["first", "broken", "last"] {
        h.manager
            .load_extension(manifest(id).with_hook("before_save"))
            .await
            .unwrap();
    }
    h.manager.initialize_extensions().await.unwrap();
    let mut events = h.manager.subscribe();

    let results = h
        .manager
        .execute_hook("before_save", &json!({"doc": 7}), None)
        .await;
    let ids: Vec<&str> = results.iter().map(|r| r.extension_id.as_str()).collect();
    assert_eq!(ids, vec!["first", "last"]);
    assert_eq!(results[0].value["payload"]["doc"], 7);

    match events.recv().await.unwrap() {
        ExtensionEvent::HookError { point, id, .. } => {
            assert_eq!(point, "before_save");
            assert_eq!(id, "broken");
        }
        other => panic!("unexpected event {other:?}"),
    }

    h.manager.disable_extension("first").await.unwrap();
    let results = h.manager.execute_hook("before_save", &Value::Null, None).await;
    assert_eq!(results.len(), 1);
    assert!(h.manager.execute_hook("nobody", &Value::Null, None).await.is_empty());
}

#[tokio::test]
async fn test_context_state_survives_reactivation() {
    let h = Harness::new();
    h.module("core");
    h.manager.load_extension(manifest("core")).await.unwrap();
    h.manager.enable_extension("core").await.unwrap();

    let context = h.manager.context("core").unwrap();
    context.store_secret("api-key", "s3cret").await.unwrap();
    context
        .update_global_state("runs", json!(1))
        .await
        .unwrap();

    h.manager.disable_extension("core").await.unwrap();
    assert!(context.is_disposed());

    h.manager.enable_extension("core").await.unwrap();
    let context = h.manager.context("core").unwrap();
    assert_eq!(context.get_secret("api-key").as_deref(), Some("s3cret"));
    assert_eq!(context.get_global_state("runs"), Some(json!(1)));
}

#[tokio::test]
async fn test_uninstall_checks_dependents_and_clears_storage() {
    let h = Harness::new();
    h.module("core");
    h.module("sales");
    h.manager.load_extension(manifest("core")).await.unwrap();
    let mut sales = manifest("sales").with_dependency("core");
    sales.uninstall_script = true;
    h.manager.load_extension(sales).await.unwrap();
    h.manager.initialize_extensions().await.unwrap();

    assert!(matches!(
        h.manager.uninstall_extension("core").await,
        Err(ExtensionError::HasDependents { .. })
    ));

    let storage = h.manager.context("sales").unwrap().storage_path().to_path_buf();
    assert!(storage.exists());

    // Uninstall routine failure only warns
    h.manager.uninstall_extension("sales").await.unwrap();
    assert!(h.manager.get_extension("sales").is_none());
    assert!(!storage.exists());
    assert!(h.log().contains(&"uninstall:sales".to_string()));
    assert!(h.manager.hook_handlers("before_save").is_empty());

    h.manager.uninstall_extension("core").await.unwrap();
    assert_eq!(h.manager.stats().total, 0);
}

#[tokio::test]
async fn test_install_and_update_from_disk() {
    let h = Harness::new();
    h.module("crm");
    let packages = TempDir::new().unwrap();

    let v1 = packages.path().join("crm-1");
    write_manifest(&v1, &manifest("crm").with_hook("on_login"));
    let info = h.manager.install_extension(&v1).await.unwrap();
    assert_eq!(info.state, ExtensionState::Enabled);
    assert_eq!(info.version, "1.0.0");

    let same = packages.path().join("crm-same");
    write_manifest(&same, &manifest("crm"));
    assert!(matches!(
        h.manager.update_extension("crm", &same).await,
        Err(ExtensionError::VersionNotNewer { .. })
    ));

    let v2 = packages.path().join("crm-2");
    let mut newer = manifest("crm").with_hook("on_logout");
    newer.version = "1.2.0".into();
    write_manifest(&v2, &newer);
    let info = h.manager.update_extension("crm", &v2).await.unwrap();
    assert_eq!(info.version, "1.2.0");
    assert_eq!(info.state, ExtensionState::Enabled);
    assert!(h.manager.hook_handlers("on_login").is_empty());
    assert_eq!(h.manager.hook_handlers("on_logout"), vec!["crm"]);
    assert_eq!(
        h.log(),
        vec!["activate:crm", "deactivate:crm", "activate:crm"]
    );
}

#[tokio::test]
async fn test_update_reports_updating_while_old_version_stops() {
    let storage = TempDir::new().unwrap();
    let manager = Arc::new(ExtensionManager::new(ExtensionHostConfig {
        storage_root: storage.path().to_path_buf(),
        ..Default::default()
    }));
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    {
        let entered = Arc::clone(&entered);
        let release = Arc::clone(&release);
        manager.register_factory("crm", move |_| {
            Ok(Arc::new(Gate {
                entered: Arc::clone(&entered),
                release: Arc::clone(&release),
            }) as Arc<dyn Extension>)
        });
    }

    let packages = TempDir::new().unwrap();
    let v1 = packages.path().join("crm-1");
    write_manifest(&v1, &manifest("crm"));
    manager.install_extension(&v1).await.unwrap();

    let v2 = packages.path().join("crm-2");
    let mut newer = manifest("crm");
    newer.version = "2.0.0".into();
    write_manifest(&v2, &newer);

    let update = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move { manager.update_extension("crm", &v2).await }
    });

    entered.notified().await;
    assert_eq!(manager.state("crm"), Some(ExtensionState::Updating));
    release.notify_one();

    let info = update.await.unwrap().unwrap();
    assert_eq!(info.version, "2.0.0");
    assert_eq!(info.state, ExtensionState::Enabled);
}

#[tokio::test]
async fn test_load_from_dir_skips_broken_packages() {
    let h = Harness::new();
    h.module("alpha");
    h.module("beta");
    let root = TempDir::new().unwrap();

    write_manifest(&root.path().join("alpha"), &manifest("alpha"));
    write_manifest(&root.path().join("beta"), &manifest("beta"));
    std::fs::create_dir_all(root.path().join("empty")).unwrap();
    std::fs::create_dir_all(root.path().join("garbled")).unwrap();
    std::fs::write(root.path().join("garbled").join(MANIFEST_FILE), "{ nope").unwrap();

    let loaded = h.manager.load_extensions_from_dir(root.path()).await.unwrap();
    let ids: Vec<&str> = loaded.iter().map(|info| info.id.as_str()).collect();
    assert_eq!(ids, vec!["alpha", "beta"]);
    assert_eq!(h.manager.list_extensions().len(), 2);
}

#[tokio::test]
async fn test_shutdown_stops_dependents_first() {
    let h = Harness::new();
    h.module("core");
    h.module("sales");
    h.manager.load_extension(manifest("core")).await.unwrap();
    h.manager
        .load_extension(manifest("sales").with_dependency("core"))
        .await
        .unwrap();
    h.manager.initialize_extensions().await.unwrap();

    h.manager.shutdown().await;
    assert_eq!(
        &h.log()[2..],
        &["deactivate:sales".to_string(), "deactivate:core".to_string()]
    );
    assert_eq!(h.manager.stats().count(ExtensionState::Disabled), 2);
}
