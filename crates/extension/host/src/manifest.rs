//! Extension manifests
//!
//! A manifest is a JSON document named `extension.json` at the root of the
//! extension directory. Required fields are `id`, `name`, `version` and
//! `publisher`; ids are lowercase and hyphenated, versions are `x.y.z`.

use crate::{ExtensionError, ExtensionResult};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// File name of a manifest inside an extension directory
pub const MANIFEST_FILE: &str = "extension.json";

static ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9-]+$").expect("id regex is valid"));

static VERSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+\.\d+\.\d+$").expect("version regex is valid"));

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionManifest {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub publisher: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Factory key of the extension module; defaults to the id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub objects: Vec<serde_json::Value>,
    #[serde(default)]
    pub features: Vec<String>,
    /// Hook points the extension handles
    #[serde(default)]
    pub hooks: Vec<String>,
    /// Whether the module's uninstall routine must run on uninstall
    #[serde(default)]
    pub uninstall_script: bool,
}

impl ExtensionManifest {
    /// A minimal manifest with the required fields set
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        publisher: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            publisher: publisher.into(),
            description: None,
            entry_point: None,
            dependencies: Vec::new(),
            permissions: Vec::new(),
            objects: Vec::new(),
            features: Vec::new(),
            hooks: Vec::new(),
            uninstall_script: false,
        }
    }

    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn with_hook(mut self, point: impl Into<String>) -> Self {
        self.hooks.push(point.into());
        self
    }

    pub fn with_entry_point(mut self, entry_point: impl Into<String>) -> Self {
        self.entry_point = Some(entry_point.into());
        self
    }

    /// Parse and validate a manifest document
    pub fn parse(json: &str) -> ExtensionResult<Self> {
        let manifest: Self = serde_json::from_str(json)
            .map_err(|err| ExtensionError::ManifestInvalid(err.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Read a manifest from an extension directory or a manifest file
    pub async fn load(path: &Path) -> ExtensionResult<Self> {
        let file = manifest_path(path);
        let json = match tokio::fs::read_to_string(&file).await {
            Ok(json) => json,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(ExtensionError::ManifestMissing(file));
            }
            Err(err) => return Err(err.into()),
        };
        Self::parse(&json)
    }

    pub fn validate(&self) -> ExtensionResult<()> {
        for (field, value) in [
            ("id", &self.id),
            ("name", &self.name),
            ("version", &self.version),
            ("publisher", &self.publisher),
        ] {
            if value.trim().is_empty() {
                return Err(ExtensionError::ManifestInvalid(format!(
                    "missing required field '{field}'"
                )));
            }
        }
        if !ID_REGEX.is_match(&self.id) {
            return Err(ExtensionError::ManifestInvalid(format!(
                "id '{}' must contain only lowercase letters, digits and hyphens",
                self.id
            )));
        }
        if !VERSION_REGEX.is_match(&self.version) {
            return Err(ExtensionError::ManifestInvalid(format!(
                "version '{}' must be in x.y.z form",
                self.version
            )));
        }
        if self.dependencies.iter().any(|dep| dep == &self.id) {
            return Err(ExtensionError::ManifestInvalid(format!(
                "{} depends on itself",
                self.id
            )));
        }
        Ok(())
    }

    pub fn semver(&self) -> ExtensionResult<semver::Version> {
        semver::Version::parse(&self.version)
            .map_err(|err| ExtensionError::ManifestInvalid(err.to_string()))
    }

    /// Key used to look up the module factory
    pub fn factory_key(&self) -> &str {
        self.entry_point.as_deref().unwrap_or(&self.id)
    }
}

/// Resolve a path to the manifest file it designates
pub fn manifest_path(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == "json") {
        path.to_path_buf()
    } else {
        path.join(MANIFEST_FILE)
    }
}
