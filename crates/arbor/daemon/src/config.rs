//! Configuration for arbor-daemon

use arbor_runtime::{CompanyConfig, RuntimeConfig, TenantConfig};
use serde::{Deserialize, Serialize};

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Runtime configuration (sessions, data, extensions, workflows)
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Users, companies and tenants created at startup
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Seed data applied when the daemon starts. Entries that already exist
/// are left alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    #[serde(default)]
    pub users: Vec<UserSeed>,

    /// Standalone companies
    #[serde(default)]
    pub companies: Vec<CompanyConfig>,

    #[serde(default)]
    pub tenants: Vec<TenantSeed>,
}

/// A user account for the built-in authorizer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSeed {
    pub username: String,
    pub password: String,
    /// Permission grants, e.g. `customer:*` or `invoice:read@inv-1`
    #[serde(default)]
    pub grants: Vec<String>,
}

/// A tenant and the companies it owns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantSeed {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub companies: Vec<CompanyConfig>,
}

impl TenantSeed {
    pub fn tenant_config(&self) -> TenantConfig {
        let mut config = TenantConfig::new(&self.name, &self.code);
        config.domains = self.domains.clone();
        config.features = self.features.clone();
        config
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration from defaults, an optional file and `ARBOR_*`
    /// environment variables, in that order of precedence
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        // Add default configuration
        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        // Add file configuration if provided
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // Nested keys use a double underscore: ARBOR_RUNTIME__SESSION__TIMEOUT_SECS
        builder = builder.add_source(
            config::Environment::with_prefix("ARBOR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
