//! Extension manager: dependency-ordered extension lifecycle
//!
//! State machine per extension:
//!
//! ```text
//! Loaded ──enable──▶ Enabled ◀──enable── Disabled
//!                      │                    ▲
//!                      └──────disable───────┘
//! ```
//!
//! A failed activation or deactivation moves the extension to `Error`.
//! `Installing`, `Updating` and `Uninstalling` mark the extension while the
//! corresponding flow runs. Lifecycle operations are serialized by one
//! async lock; hook execution is not.

use crate::{
    Extension, ExtensionContext, ExtensionError, ExtensionEvent, ExtensionFactory,
    ExtensionHostConfig, ExtensionInfo, ExtensionManifest, ExtensionResult, ExtensionState,
    ExtensionStats, HookInvocation, HookRegistry, HookResult, InitializationReport,
    ObjectRegistry,
};
use arbor_types::{EventBus, SessionRef};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

struct ExtensionEntry {
    manifest: ExtensionManifest,
    module: Arc<dyn Extension>,
    path: Option<PathBuf>,
    state: ExtensionState,
    error: Option<String>,
    seq: u64,
    loaded_at: DateTime<Utc>,
}

impl ExtensionEntry {
    fn info(&self) -> ExtensionInfo {
        ExtensionInfo {
            id: self.manifest.id.clone(),
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            publisher: self.manifest.publisher.clone(),
            state: self.state,
            dependencies: self.manifest.dependencies.clone(),
            hooks: self.manifest.hooks.clone(),
            path: self.path.clone(),
            error: self.error.clone(),
            loaded_at: self.loaded_at,
        }
    }
}

/// Manages extension loading, activation and hooks
pub struct ExtensionManager {
    config: ExtensionHostConfig,
    factories: DashMap<String, ExtensionFactory>,
    extensions: DashMap<String, ExtensionEntry>,
    contexts: DashMap<String, Arc<ExtensionContext>>,
    hooks: HookRegistry,
    objects: Arc<ObjectRegistry>,
    lifecycle: Mutex<()>,
    next_seq: AtomicU64,
    events: EventBus<ExtensionEvent>,
}

impl ExtensionManager {
    pub fn new(config: ExtensionHostConfig) -> Self {
        let events = EventBus::with_capacity(config.event_capacity);
        Self {
            config,
            factories: DashMap::new(),
            extensions: DashMap::new(),
            contexts: DashMap::new(),
            hooks: HookRegistry::new(),
            objects: Arc::new(ObjectRegistry::new()),
            lifecycle: Mutex::new(()),
            next_seq: AtomicU64::new(0),
            events,
        }
    }

    pub fn config(&self) -> &ExtensionHostConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus<ExtensionEvent> {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ExtensionEvent> {
        self.events.subscribe()
    }

    pub fn objects(&self) -> &Arc<ObjectRegistry> {
        &self.objects
    }

    // ── Modules ──────────────────────────────────────────────────────

    /// Register the factory that builds modules for `key`
    pub fn register_factory<F>(&self, key: impl Into<String>, factory: F)
    where
        F: Fn(&ExtensionManifest) -> anyhow::Result<Arc<dyn Extension>> + Send + Sync + 'static,
    {
        let key = key.into();
        tracing::debug!(key = %key, "Extension factory registered");
        self.factories.insert(key, Arc::new(factory) as ExtensionFactory);
    }

    /// Register a ready-made module instance for `key`
    pub fn register_module(&self, key: impl Into<String>, module: Arc<dyn Extension>) {
        self.register_factory(key, move |_| Ok(Arc::clone(&module)));
    }

    fn instantiate(&self, manifest: &ExtensionManifest) -> ExtensionResult<Arc<dyn Extension>> {
        let key = manifest.factory_key();
        let factory = self
            .factories
            .get(key)
            .map(|factory| Arc::clone(factory.value()))
            .ok_or_else(|| ExtensionError::ModuleLoadError {
                id: manifest.id.clone(),
                reason: format!("no module registered under '{key}'"),
            })?;

        factory(manifest).map_err(|err| ExtensionError::ModuleLoadError {
            id: manifest.id.clone(),
            reason: format!("{err:#}"),
        })
    }

    // ── Loading ──────────────────────────────────────────────────────

    /// Load an extension from a directory containing `extension.json`, or
    /// from a manifest file
    pub async fn load_extension_from_path(&self, path: &Path) -> ExtensionResult<ExtensionInfo> {
        let _lifecycle = self.lifecycle.lock().await;
        let manifest = ExtensionManifest::load(path).await?;
        self.insert(manifest, Some(path.to_path_buf()), ExtensionState::Loaded)
    }

    /// Load an extension from an in-memory manifest
    pub async fn load_extension(&self, manifest: ExtensionManifest) -> ExtensionResult<ExtensionInfo> {
        let _lifecycle = self.lifecycle.lock().await;
        self.insert(manifest, None, ExtensionState::Loaded)
    }

    /// Load every extension directory under `dir`, skipping failures
    pub async fn load_extensions_from_dir(&self, dir: &Path) -> ExtensionResult<Vec<ExtensionInfo>> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                paths.push(entry.path());
            }
        }
        paths.sort();

        let mut loaded = Vec::new();
        for path in paths {
            match self.load_extension_from_path(&path).await {
                Ok(info) => loaded.push(info),
                Err(err) => {
                    tracing::warn!(path = %path.display(), error = %err, "Skipping extension");
                }
            }
        }
        tracing::info!(dir = %dir.display(), loaded = loaded.len(), "Extensions loaded");
        Ok(loaded)
    }

    fn insert(
        &self,
        manifest: ExtensionManifest,
        path: Option<PathBuf>,
        state: ExtensionState,
    ) -> ExtensionResult<ExtensionInfo> {
        manifest.validate()?;
        if self.extensions.contains_key(&manifest.id) {
            return Err(ExtensionError::AlreadyLoaded(manifest.id));
        }
        let module = self.instantiate(&manifest)?;

        let id = manifest.id.clone();
        let version = manifest.version.clone();
        let entry = ExtensionEntry {
            manifest,
            module,
            path,
            state,
            error: None,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            loaded_at: Utc::now(),
        };
        let info = match self.extensions.entry(id.clone()) {
            Entry::Occupied(_) => return Err(ExtensionError::AlreadyLoaded(id)),
            Entry::Vacant(vacant) => vacant.insert(entry).info(),
        };

        tracing::info!(extension_id = %id, version = %version, "Extension loaded");
        self.events
            .publish(ExtensionEvent::ExtensionLoaded { id, version });
        Ok(info)
    }

    // ── Dependency resolution ────────────────────────────────────────

    /// Topologically order all loaded extensions, dependencies first
    pub fn resolve_dependencies(&self) -> ExtensionResult<Vec<String>> {
        let mut loaded: Vec<(u64, String, Vec<String>)> = self
            .extensions
            .iter()
            .map(|e| (e.seq, e.manifest.id.clone(), e.manifest.dependencies.clone()))
            .collect();
        loaded.sort();
        let graph: HashMap<&str, &[String]> = loaded
            .iter()
            .map(|(_, id, deps)| (id.as_str(), deps.as_slice()))
            .collect();

        let mut order = Vec::with_capacity(loaded.len());
        let mut visited = HashSet::new();
        let mut stack = Vec::new();
        for (_, id, _) in &loaded {
            visit(id, &graph, &mut stack, &mut visited, &mut order)?;
        }
        Ok(order)
    }

    // ── Enable / disable ─────────────────────────────────────────────

    /// Enable an extension, enabling its dependencies first
    pub async fn enable_extension(&self, id: &str) -> ExtensionResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.enable_locked(id, &mut Vec::new()).await
    }

    fn enable_locked<'a>(
        &'a self,
        id: &'a str,
        chain: &'a mut Vec<String>,
    ) -> BoxFuture<'a, ExtensionResult<()>> {
        Box::pin(async move {
            let (manifest, module, state) = self.snapshot(id)?;
            if state == ExtensionState::Enabled {
                return Ok(());
            }
            if chain.iter().any(|seen| seen == id) {
                let mut cycle = chain.clone();
                cycle.push(id.to_string());
                return Err(ExtensionError::CircularDependency(cycle));
            }

            chain.push(id.to_string());
            let mut dependencies = Ok(());
            for dependency in &manifest.dependencies {
                if !self.extensions.contains_key(dependency) {
                    dependencies = Err(ExtensionError::MissingDependency {
                        extension: id.to_string(),
                        dependency: dependency.clone(),
                    });
                    break;
                }
                if let Err(err) = self.enable_locked(dependency, chain).await {
                    dependencies = Err(err);
                    break;
                }
            }
            chain.pop();
            dependencies?;

            self.activate(id, &manifest, module).await
        })
    }

    async fn activate(
        &self,
        id: &str,
        manifest: &ExtensionManifest,
        module: Arc<dyn Extension>,
    ) -> ExtensionResult<()> {
        let context = Arc::new(
            ExtensionContext::open(id, &self.config.storage_root, Arc::clone(&self.objects))
                .await?,
        );

        if let Err(err) = module.activate(Arc::clone(&context)).await {
            let reason = format!("{err:#}");
            context.dispose();
            self.objects.remove_owned_by(id);
            self.fail(id, &reason);
            return Err(ExtensionError::ActivationFailed {
                id: id.to_string(),
                reason,
            });
        }

        self.hooks.register(id, &manifest.hooks);
        self.contexts.insert(id.to_string(), context);
        self.set_state(id, ExtensionState::Enabled, None);

        tracing::info!(extension_id = %id, "Extension enabled");
        self.events.publish(ExtensionEvent::ExtensionEnabled { id: id.to_string() });
        Ok(())
    }

    /// Disable an enabled extension; fails while enabled extensions depend on it
    pub async fn disable_extension(&self, id: &str) -> ExtensionResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let (_, _, state) = self.snapshot(id)?;
        if state != ExtensionState::Enabled {
            return Ok(());
        }

        let dependents = self.dependents_of(id, true);
        if !dependents.is_empty() {
            return Err(ExtensionError::HasEnabledDependents {
                id: id.to_string(),
                dependents,
            });
        }
        self.deactivate_locked(id, ExtensionState::Disabled).await
    }

    /// Stop an enabled module; on success the extension is left in `settled`
    async fn deactivate_locked(&self, id: &str, settled: ExtensionState) -> ExtensionResult<()> {
        let (_, module, _) = self.snapshot(id)?;
        let context = self.contexts.remove(id).map(|(_, context)| context);
        self.hooks.unregister(id);

        let result = match &context {
            Some(context) => module.deactivate(Arc::clone(context)).await,
            None => Ok(()),
        };
        if let Some(context) = context {
            context.dispose();
        }
        self.objects.remove_owned_by(id);

        if let Err(err) = result {
            let reason = format!("{err:#}");
            self.fail(id, &reason);
            return Err(ExtensionError::DeactivationFailed {
                id: id.to_string(),
                reason,
            });
        }

        self.set_state(id, settled, None);
        tracing::info!(extension_id = %id, "Extension disabled");
        self.events.publish(ExtensionEvent::ExtensionDisabled { id: id.to_string() });
        Ok(())
    }

    /// Enable every loaded extension in dependency order.
    ///
    /// Individual failures are recorded in the report; only a dependency
    /// graph that cannot be ordered fails the whole call.
    pub async fn initialize_extensions(&self) -> ExtensionResult<InitializationReport> {
        let order = self.resolve_dependencies()?;
        let mut report = InitializationReport::default();
        for id in order {
            match self.enable_extension(&id).await {
                Ok(()) => report.enabled.push(id),
                Err(err) => {
                    tracing::warn!(extension_id = %id, error = %err, "Extension failed to start");
                    report.failed.push((id, err.to_string()));
                }
            }
        }
        Ok(report)
    }

    // ── Install / update / uninstall ─────────────────────────────────

    /// Load and enable an extension in one step
    pub async fn install_extension(&self, path: &Path) -> ExtensionResult<ExtensionInfo> {
        let _lifecycle = self.lifecycle.lock().await;
        let manifest = ExtensionManifest::load(path).await?;
        let id = manifest.id.clone();
        self.insert(manifest, Some(path.to_path_buf()), ExtensionState::Installing)?;

        if let Err(err) = self.enable_locked(&id, &mut Vec::new()).await {
            if self.state(&id) == Some(ExtensionState::Installing) {
                self.fail(&id, &err.to_string());
            }
            return Err(err);
        }

        tracing::info!(extension_id = %id, "Extension installed");
        self.events.publish(ExtensionEvent::ExtensionInstalled { id: id.clone() });
        self.info(&id)
    }

    /// Replace an extension with a strictly newer version, re-enabling it if
    /// it was enabled
    pub async fn update_extension(&self, id: &str, path: &Path) -> ExtensionResult<ExtensionInfo> {
        let _lifecycle = self.lifecycle.lock().await;
        let (current_manifest, _, state) = self.snapshot(id)?;
        let manifest = ExtensionManifest::load(path).await?;
        if manifest.id != id {
            return Err(ExtensionError::ManifestInvalid(format!(
                "manifest id '{}' does not match '{}'",
                manifest.id, id
            )));
        }

        let current = current_manifest.semver()?;
        let requested = manifest.semver()?;
        if requested <= current {
            return Err(ExtensionError::VersionNotNewer {
                id: id.to_string(),
                current: current.to_string(),
                requested: requested.to_string(),
            });
        }
        let module = self.instantiate(&manifest)?;

        let was_enabled = state == ExtensionState::Enabled;
        self.set_state(id, ExtensionState::Updating, None);
        if was_enabled {
            self.deactivate_locked(id, ExtensionState::Updating).await?;
        }

        if let Some(mut entry) = self.extensions.get_mut(id) {
            entry.manifest = manifest;
            entry.module = module;
            entry.path = Some(path.to_path_buf());
            entry.error = None;
        }
        self.set_state(id, ExtensionState::Loaded, None);

        tracing::info!(extension_id = %id, from = %current, to = %requested, "Extension updated");
        self.events.publish(ExtensionEvent::ExtensionUpdated {
            id: id.to_string(),
            from: current.to_string(),
            to: requested.to_string(),
        });

        if was_enabled {
            self.enable_locked(id, &mut Vec::new()).await?;
        }
        self.info(id)
    }

    /// Remove an extension entirely; fails while any extension depends on it
    pub async fn uninstall_extension(&self, id: &str) -> ExtensionResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let (manifest, module, state) = self.snapshot(id)?;

        let dependents = self.dependents_of(id, false);
        if !dependents.is_empty() {
            return Err(ExtensionError::HasDependents {
                id: id.to_string(),
                dependents,
            });
        }

        self.set_state(id, ExtensionState::Uninstalling, None);
        if state == ExtensionState::Enabled {
            self.deactivate_locked(id, ExtensionState::Uninstalling).await?;
        }

        if manifest.uninstall_script {
            if let Err(err) = module.uninstall().await {
                tracing::warn!(extension_id = %id, error = %format!("{err:#}"), "Uninstall routine failed");
            }
        }

        self.hooks.unregister(id);
        self.objects.remove_owned_by(id);
        self.contexts.remove(id);
        self.extensions.remove(id);

        let storage = self.config.storage_root.join(id);
        match tokio::fs::remove_dir_all(&storage).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(extension_id = %id, path = %storage.display(), error = %err, "Failed to remove extension storage");
            }
        }

        tracing::info!(extension_id = %id, "Extension uninstalled");
        self.events.publish(ExtensionEvent::ExtensionUninstalled { id: id.to_string() });
        Ok(())
    }

    /// Disable every enabled extension, dependents first
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let mut order = self.resolve_dependencies().unwrap_or_else(|_| {
            self.list_extensions().into_iter().map(|info| info.id).collect()
        });
        order.reverse();

        for id in order {
            if self.state(&id) == Some(ExtensionState::Enabled) {
                if let Err(err) = self.deactivate_locked(&id, ExtensionState::Disabled).await {
                    tracing::warn!(extension_id = %id, error = %err, "Extension failed to stop");
                }
            }
        }
    }

    // ── Hooks ────────────────────────────────────────────────────────

    /// Run every enabled handler registered at `point`, in registration order.
    ///
    /// Handler failures are logged and published as `HookError` events and
    /// never reach the caller; only successful results are returned.
    pub async fn execute_hook(
        &self,
        point: &str,
        payload: &Value,
        session: Option<&SessionRef>,
    ) -> Vec<HookResult> {
        let mut results = Vec::new();
        for id in self.hooks.handlers(point) {
            let module = match self.extensions.get(&id) {
                Some(entry) if entry.state == ExtensionState::Enabled => Arc::clone(&entry.module),
                _ => continue,
            };

            let invocation = HookInvocation {
                point,
                payload,
                session,
            };
            match module.handle_hook(invocation).await {
                Ok(value) => results.push(HookResult {
                    extension_id: id,
                    value,
                }),
                Err(err) => {
                    let error = format!("{err:#}");
                    tracing::warn!(hook = point, extension_id = %id, error = %error, "Hook handler failed");
                    self.events.publish(ExtensionEvent::HookError {
                        point: point.to_string(),
                        id,
                        error,
                    });
                }
            }
        }
        results
    }

    /// Extension ids registered at `point`
    pub fn hook_handlers(&self, point: &str) -> Vec<String> {
        self.hooks.handlers(point)
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn get_extension(&self, id: &str) -> Option<ExtensionInfo> {
        self.extensions.get(id).map(|entry| entry.info())
    }

    /// All loaded extensions in load order
    pub fn list_extensions(&self) -> Vec<ExtensionInfo> {
        let mut entries: Vec<(u64, ExtensionInfo)> = self
            .extensions
            .iter()
            .map(|entry| (entry.seq, entry.info()))
            .collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, info)| info).collect()
    }

    pub fn state(&self, id: &str) -> Option<ExtensionState> {
        self.extensions.get(id).map(|entry| entry.state)
    }

    pub fn context(&self, id: &str) -> Option<Arc<ExtensionContext>> {
        self.contexts.get(id).map(|context| Arc::clone(context.value()))
    }

    pub fn stats(&self) -> ExtensionStats {
        let mut by_state = BTreeMap::new();
        for entry in self.extensions.iter() {
            *by_state.entry(entry.state).or_insert(0) += 1;
        }
        ExtensionStats {
            total: self.extensions.len(),
            by_state,
            hook_points: self.hooks.point_count(),
            registered_objects: self.objects.len(),
        }
    }

    // ── Internals ────────────────────────────────────────────────────

    fn info(&self, id: &str) -> ExtensionResult<ExtensionInfo> {
        self.get_extension(id)
            .ok_or_else(|| ExtensionError::NotFound(id.to_string()))
    }

    fn snapshot(
        &self,
        id: &str,
    ) -> ExtensionResult<(ExtensionManifest, Arc<dyn Extension>, ExtensionState)> {
        self.extensions
            .get(id)
            .map(|entry| (entry.manifest.clone(), Arc::clone(&entry.module), entry.state))
            .ok_or_else(|| ExtensionError::NotFound(id.to_string()))
    }

    /// Ids of extensions declaring a dependency on `id`, sorted
    fn dependents_of(&self, id: &str, enabled_only: bool) -> Vec<String> {
        let mut dependents: Vec<String> = self
            .extensions
            .iter()
            .filter(|entry| !enabled_only || entry.state == ExtensionState::Enabled)
            .filter(|entry| entry.manifest.dependencies.iter().any(|dep| dep == id))
            .map(|entry| entry.manifest.id.clone())
            .collect();
        dependents.sort();
        dependents
    }

    fn set_state(&self, id: &str, state: ExtensionState, error: Option<String>) {
        if let Some(mut entry) = self.extensions.get_mut(id) {
            entry.state = state;
            entry.error = error;
        }
    }

    fn fail(&self, id: &str, reason: &str) {
        self.set_state(id, ExtensionState::Error, Some(reason.to_string()));
        tracing::warn!(extension_id = %id, error = %reason, "Extension entered error state");
        self.events.publish(ExtensionEvent::ExtensionFailed {
            id: id.to_string(),
            error: reason.to_string(),
        });
    }
}

impl std::fmt::Debug for ExtensionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtensionManager")
            .field("extensions", &self.extensions.len())
            .field("factories", &self.factories.len())
            .finish()
    }
}

fn visit(
    id: &str,
    graph: &HashMap<&str, &[String]>,
    stack: &mut Vec<String>,
    visited: &mut HashSet<String>,
    order: &mut Vec<String>,
) -> ExtensionResult<()> {
    if visited.contains(id) {
        return Ok(());
    }
    if let Some(start) = stack.iter().position(|seen| seen == id) {
        let mut cycle = stack[start..].to_vec();
        cycle.push(id.to_string());
        return Err(ExtensionError::CircularDependency(cycle));
    }

    stack.push(id.to_string());
    for dependency in graph.get(id).copied().unwrap_or_default() {
        if !graph.contains_key(dependency.as_str()) {
            return Err(ExtensionError::MissingDependency {
                extension: id.to_string(),
                dependency: dependency.clone(),
            });
        }
        visit(dependency, graph, stack, visited, order)?;
    }
    stack.pop();

    visited.insert(id.to_string());
    order.push(id.to_string());
    Ok(())
}
