//! Server setup and lifecycle management

use crate::config::DaemonConfig;
use crate::error::DaemonResult;
use arbor_data::{IsolationLevel, MemoryServer};
use arbor_runtime::{Application, StaticAuthorizer};
use std::sync::Arc;

/// Arbor daemon server: owns the data backend and the application
pub struct Server {
    config: DaemonConfig,
    application: Application,
}

impl Server {
    /// Open the runtime and apply bootstrap data
    pub async fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let data = Arc::new(MemoryServer::with_settings(
            config.runtime.data.lock_timeout(),
            IsolationLevel::default(),
        ));

        let authorizer = Arc::new(StaticAuthorizer::new());
        for user in &config.bootstrap.users {
            authorizer.add_user(&user.username, &user.password, user.grants.iter().cloned());
        }

        let application = Application::open(config.runtime.clone(), data, authorizer).await?;
        let server = Self {
            config,
            application,
        };
        server.bootstrap().await?;
        Ok(server)
    }

    pub fn application(&self) -> &Application {
        &self.application
    }

    async fn bootstrap(&self) -> DaemonResult<()> {
        let seed = &self.config.bootstrap;

        for company in &seed.companies {
            if let Some(id) = &company.id {
                if self.application.get_company(id).is_some() {
                    continue;
                }
            }
            let company = self.application.create_company(company.clone()).await?;
            tracing::info!(company_id = %company.id(), "Bootstrap company created");
        }

        for tenant_seed in &seed.tenants {
            let tenant = match self.application.tenants().get_tenant_by_code(&tenant_seed.code) {
                Some(tenant) => tenant,
                None => {
                    self.application
                        .register_tenant(tenant_seed.tenant_config())
                        .await?
                }
            };
            for company in &tenant_seed.companies {
                if let Some(id) = &company.id {
                    if tenant.company(id).is_some() {
                        continue;
                    }
                }
                self.application
                    .create_tenant_company(tenant.id(), company.clone())
                    .await?;
            }
        }
        Ok(())
    }

    /// Load extensions and start background housekeeping
    pub async fn start(&self) -> DaemonResult<()> {
        let report = self.application.load_extensions().await?;
        for (extension, reason) in &report.failed {
            tracing::warn!(extension = %extension, reason = %reason, "Extension failed to start");
        }
        self.application.start_background_tasks();

        tracing::info!(
            tenants = self.application.tenants().len(),
            companies = self.application.companies().len(),
            extensions = report.enabled.len(),
            "Arbor daemon started"
        );
        Ok(())
    }

    /// Run until a shutdown signal arrives, then shut the runtime down
    pub async fn run(self) -> DaemonResult<()> {
        self.start().await?;
        shutdown_signal().await;

        tracing::info!("Arbor daemon shutting down");
        self.application.shutdown().await;
        Ok(())
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
