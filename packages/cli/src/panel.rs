// ABOUTME: Wires storage, the Docker runtime and the sandbox and hosting managers together
// ABOUTME: One Panel per process; it owns the provisioning worker pool

use crate::config::Config;
use anyhow::{Context, Result};
use sbpanel_sandbox::storage;
use sbpanel_sandbox::{
    Caller, DockerRuntime, HostingManager, Runtime, SandboxManager, SandboxStorage,
    SettingsManager,
};
use std::sync::Arc;
use tracing::debug;

const POOL_CONNECTIONS: u32 = 5;

pub struct Panel {
    pub storage: Arc<SandboxStorage>,
    pub settings: SettingsManager,
    pub manager: Arc<SandboxManager>,
    pub hosting: HostingManager,
}

impl Panel {
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = storage::connect(&config.database_url, POOL_CONNECTIONS)
            .await
            .with_context(|| format!("Failed to open database {}", config.database_url))?;
        debug!(url = %config.database_url, "Database ready");

        let runtime = DockerRuntime::new()
            .context("Failed to connect to Docker")?
            .with_stop_timeout(config.stop_timeout)
            .with_pull_timeout(config.pull_timeout);
        runtime
            .ping()
            .await
            .context("Docker daemon is not responding")?;
        let runtime: Arc<dyn Runtime> = Arc::new(runtime);

        let storage = Arc::new(SandboxStorage::new(pool.clone()));
        let manager = Arc::new(SandboxManager::new(
            storage.clone(),
            runtime,
            config.manager_config(),
        ));
        let hosting = HostingManager::new(
            storage.clone(),
            manager.executor().clone(),
            SettingsManager::new(pool.clone()),
            manager.sandbox_locks(),
        );

        Ok(Self {
            storage,
            settings: SettingsManager::new(pool),
            manager,
            hosting,
        })
    }

    /// Resolve `--as`, which every sandbox and hosting command needs
    pub async fn caller(&self, account_id: Option<i64>) -> Result<Caller> {
        let account_id = account_id.context("This command needs --as <account_id>")?;
        self.manager
            .caller(account_id)
            .await
            .with_context(|| format!("Unknown account {}", account_id))
    }

    /// Let queued provisioning finish before the process exits
    pub async fn close(&self) {
        self.manager.shutdown().await;
    }
}
