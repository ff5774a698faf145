//! Per-extension context
//!
//! Every enabled extension gets a fresh context with three isolated maps:
//! secrets, workspace state and global state. Each map is persisted as JSON
//! under `<storage_root>/<extension id>/` and rewritten in full on every
//! update, so callers should batch related writes.

use crate::{ExtensionError, ExtensionResult, ObjectRegistry};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const SECRETS_FILE: &str = "secrets.json";
const WORKSPACE_STATE_FILE: &str = "workspace-state.json";
const GLOBAL_STATE_FILE: &str = "global-state.json";

type Disposer = Box<dyn FnOnce() + Send>;

pub struct ExtensionContext {
    extension_id: String,
    storage_dir: PathBuf,
    secrets: RwLock<BTreeMap<String, String>>,
    workspace_state: RwLock<BTreeMap<String, Value>>,
    global_state: RwLock<BTreeMap<String, Value>>,
    objects: Arc<ObjectRegistry>,
    subscriptions: Mutex<Vec<Disposer>>,
    /// Serializes file writes so the last update always lands last
    flush: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
}

impl ExtensionContext {
    /// Create a context, loading any state persisted by earlier activations
    pub async fn open(
        extension_id: &str,
        storage_root: &Path,
        objects: Arc<ObjectRegistry>,
    ) -> ExtensionResult<Self> {
        let storage_dir = storage_root.join(extension_id);
        tokio::fs::create_dir_all(&storage_dir).await?;

        Ok(Self {
            extension_id: extension_id.to_string(),
            secrets: RwLock::new(read_map(&storage_dir.join(SECRETS_FILE)).await?),
            workspace_state: RwLock::new(read_map(&storage_dir.join(WORKSPACE_STATE_FILE)).await?),
            global_state: RwLock::new(read_map(&storage_dir.join(GLOBAL_STATE_FILE)).await?),
            storage_dir,
            objects,
            subscriptions: Mutex::new(Vec::new()),
            flush: tokio::sync::Mutex::new(()),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn extension_id(&self) -> &str {
        &self.extension_id
    }

    pub fn storage_path(&self) -> &Path {
        &self.storage_dir
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Contribute an object type to the shared object registry
    pub fn register_object(&self, object_type: &str, definition: Value) -> ExtensionResult<()> {
        self.ensure_live()?;
        self.objects
            .register(&self.extension_id, object_type, definition)
    }

    // ── Secrets ──────────────────────────────────────────────────────

    pub fn get_secret(&self, key: &str) -> Option<String> {
        self.secrets.read().get(key).cloned()
    }

    pub async fn store_secret(&self, key: &str, value: impl Into<String>) -> ExtensionResult<()> {
        self.ensure_live()?;
        self.secrets.write().insert(key.to_string(), value.into());
        self.persist(SECRETS_FILE, &self.secrets).await
    }

    pub async fn delete_secret(&self, key: &str) -> ExtensionResult<bool> {
        self.ensure_live()?;
        let removed = self.secrets.write().remove(key).is_some();
        if removed {
            self.persist(SECRETS_FILE, &self.secrets).await?;
        }
        Ok(removed)
    }

    // ── Workspace / global state ─────────────────────────────────────

    pub fn get_workspace_state(&self, key: &str) -> Option<Value> {
        self.workspace_state.read().get(key).cloned()
    }

    /// Set a workspace state value; `Value::Null` removes the key
    pub async fn update_workspace_state(&self, key: &str, value: Value) -> ExtensionResult<()> {
        self.ensure_live()?;
        apply(&self.workspace_state, key, value);
        self.persist(WORKSPACE_STATE_FILE, &self.workspace_state).await
    }

    pub fn get_global_state(&self, key: &str) -> Option<Value> {
        self.global_state.read().get(key).cloned()
    }

    /// Set a global state value; `Value::Null` removes the key
    pub async fn update_global_state(&self, key: &str, value: Value) -> ExtensionResult<()> {
        self.ensure_live()?;
        apply(&self.global_state, key, value);
        self.persist(GLOBAL_STATE_FILE, &self.global_state).await
    }

    /// Register a cleanup routine that runs on dispose
    pub fn add_subscription(&self, disposer: impl FnOnce() + Send + 'static) {
        if self.is_disposed() {
            disposer();
            return;
        }
        self.subscriptions.lock().push(Box::new(disposer));
    }

    /// Run subscriptions and clear in-memory state; persisted files are kept
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for disposer in subscriptions {
            disposer();
        }
        self.secrets.write().clear();
        self.workspace_state.write().clear();
        self.global_state.write().clear();
        tracing::debug!(extension_id = %self.extension_id, "Extension context disposed");
    }

    fn ensure_live(&self) -> ExtensionResult<()> {
        if self.is_disposed() {
            return Err(ExtensionError::ContextDisposed(self.extension_id.clone()));
        }
        Ok(())
    }

    async fn persist<V: Serialize>(
        &self,
        file: &str,
        map: &RwLock<BTreeMap<String, V>>,
    ) -> ExtensionResult<()> {
        let _flush = self.flush.lock().await;
        // Snapshot under the flush lock, never hold the map lock across the write
        let json = {
            let map = map.read();
            serde_json::to_vec_pretty(&*map)?
        };
        tokio::fs::write(self.storage_dir.join(file), json).await?;
        Ok(())
    }
}

impl std::fmt::Debug for ExtensionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionContext")
            .field("extension_id", &self.extension_id)
            .field("storage_dir", &self.storage_dir)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn apply(map: &RwLock<BTreeMap<String, Value>>, key: &str, value: Value) {
    let mut map = map.write();
    if value.is_null() {
        map.remove(key);
    } else {
        map.insert(key.to_string(), value);
    }
}

async fn read_map<V: DeserializeOwned>(path: &Path) -> ExtensionResult<BTreeMap<String, V>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    async fn open(root: &Path) -> ExtensionContext {
        ExtensionContext::open("billing", root, Arc::new(ObjectRegistry::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = open(dir.path()).await;
        ctx.store_secret("api-key", "s3cr3t").await.unwrap();
        ctx.update_workspace_state("last-run", json!("2024-01-01"))
            .await
            .unwrap();
        ctx.update_global_state("runs", json!(3)).await.unwrap();

        let reopened = open(dir.path()).await;
        assert_eq!(reopened.get_secret("api-key").as_deref(), Some("s3cr3t"));
        assert_eq!(reopened.get_workspace_state("last-run"), Some(json!("2024-01-01")));
        assert_eq!(reopened.get_global_state("runs"), Some(json!(3)));
        assert!(dir.path().join("billing").join("secrets.json").exists());
    }

    #[tokio::test]
    async fn null_removes_state() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = open(dir.path()).await;
        ctx.update_global_state("k", json!(1)).await.unwrap();
        ctx.update_global_state("k", Value::Null).await.unwrap();
        assert!(ctx.get_global_state("k").is_none());
    }

    #[tokio::test]
    async fn dispose_runs_subscriptions_and_blocks_writes() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = open(dir.path()).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        ctx.add_subscription(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        ctx.store_secret("k", "v").await.unwrap();

        ctx.dispose();
        ctx.dispose();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(ctx.get_secret("k").is_none());
        assert!(matches!(
            ctx.store_secret("k", "v").await,
            Err(ExtensionError::ContextDisposed(_))
        ));
    }

    #[tokio::test]
    async fn register_object_goes_to_shared_registry() {
        let dir = tempfile::tempdir().unwrap();
        let objects = Arc::new(ObjectRegistry::new());
        let ctx = ExtensionContext::open("billing", dir.path(), Arc::clone(&objects))
            .await
            .unwrap();
        ctx.register_object("Invoice", json!({"fields": ["total"]}))
            .unwrap();
        assert_eq!(objects.get("Invoice").unwrap().extension_id, "billing");
    }
}
