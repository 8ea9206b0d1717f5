// ABOUTME: Hosting manager for websites, databases, cron jobs, certificates and files in a sandbox
// ABOUTME: Persists each resource row and drives its provisioner under the sandbox lock

use crate::executor::CommandExecutor;
use crate::files::{FileEntry, FileError, FileManager};
use crate::locks::KeyedLocks;
use crate::manager::Caller;
use crate::resources::website::default_document_root;
use crate::resources::{
    CronProvisioner, DatabaseEngine, DatabaseProvisioner, DatabaseSpec, ResourceError, SiteConfig,
    TlsProvisioner, WebsiteProvisioner,
};
use crate::settings::SettingsManager;
use crate::storage::{
    CronJob, DatabaseRecord, NewCronJob, NewDatabase, NewSite, Sandbox, SandboxStatus,
    SandboxStorage, Site, StorageError,
};
use crate::templates::{Template, WebServer};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum HostingError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("Sandbox {0} not found")]
    SandboxNotFound(i64),

    #[error("Account {caller} may not manage sandbox {sandbox_id}")]
    Forbidden { sandbox_id: i64, caller: i64 },

    #[error("Sandbox {sandbox_id} is {status}, resources can only be managed while it is running")]
    NotRunning {
        sandbox_id: i64,
        status: SandboxStatus,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{0} already exists")]
    Duplicate(String),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error(transparent)]
    File(#[from] FileError),

    #[error("Storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for HostingError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => HostingError::NotFound(what),
            StorageError::Conflict(what) => HostingError::Duplicate(what),
            StorageError::Validation(message) => HostingError::Validation(message),
            other => HostingError::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, HostingError>;

#[derive(Debug, Clone)]
pub struct CreateSiteRequest {
    pub domain: String,
    /// Defaults to the web server of the sandbox template
    pub server: Option<WebServer>,
    pub php_version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreateDatabaseRequest {
    pub name: String,
    pub engine: DatabaseEngine,
    /// Defaults to the database name
    pub user: Option<String>,
    pub remote_access: bool,
}

/// A freshly created database and the only copy of its password
#[derive(Debug, Clone, Serialize)]
pub struct CreatedDatabase {
    pub database: DatabaseRecord,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct CreateCronJobRequest {
    pub name: String,
    pub command: String,
    pub schedule: String,
}

/// A sandbox checked for ownership and liveness, held under its lock
struct Target {
    sandbox: Sandbox,
    runtime_id: String,
    _guard: OwnedMutexGuard<()>,
}

fn site_config(site: &Site, ssl_enabled: bool) -> Result<SiteConfig> {
    let server = site
        .server_type
        .parse::<WebServer>()
        .map_err(HostingError::Validation)?;
    Ok(SiteConfig {
        domain: site.domain.clone(),
        server,
        php_version: Some(site.php_version.clone()).filter(|v| !v.is_empty()),
        document_root: site.document_root.clone(),
        ssl_enabled,
    })
}

pub struct HostingManager {
    storage: Arc<SandboxStorage>,
    settings: SettingsManager,
    locks: Arc<KeyedLocks<i64>>,
    websites: WebsiteProvisioner,
    databases: DatabaseProvisioner,
    cron: CronProvisioner,
    tls: TlsProvisioner,
    files: FileManager,
}

impl HostingManager {
    /// `locks` must be the same per-sandbox locks the lifecycle manager uses
    pub fn new(
        storage: Arc<SandboxStorage>,
        executor: CommandExecutor,
        settings: SettingsManager,
        locks: Arc<KeyedLocks<i64>>,
    ) -> Self {
        Self {
            storage,
            settings,
            locks,
            websites: WebsiteProvisioner::new(executor.clone()),
            databases: DatabaseProvisioner::new(executor.clone()),
            cron: CronProvisioner::new(executor.clone()),
            tls: TlsProvisioner::new(executor.clone()),
            files: FileManager::new(executor),
        }
    }

    // ========================================================================
    // WEBSITES
    // ========================================================================

    pub async fn create_site(
        &self,
        caller: Caller,
        sandbox_id: i64,
        request: CreateSiteRequest,
    ) -> Result<Site> {
        let domain = request.domain.trim().to_lowercase();
        crate::resources::validate_domain(&domain)?;

        let target = self.target(caller, sandbox_id).await?;
        let server = match request.server {
            Some(server) => server,
            None => Template::from_tag(&target.sandbox.template)
                .map(|t| t.web_server())
                .unwrap_or(WebServer::Nginx),
        };

        let site = self
            .storage
            .create_site(NewSite {
                sandbox_id,
                owner_id: target.sandbox.owner_id,
                domain: domain.clone(),
                server_type: server.as_str().to_string(),
                php_version: request.php_version.unwrap_or_default(),
                document_root: default_document_root(&domain),
            })
            .await?;

        let config = site_config(&site, false)?;
        if let Err(e) = self.websites.create(&target.runtime_id, &config).await {
            self.discard("site", site.id, self.storage.delete_site(site.id).await);
            return Err(e.into());
        }

        self.record_activity(caller, "create_site", &format!("{} in sandbox {}", domain, sandbox_id))
            .await;
        info!(sandbox_id = sandbox_id, site_id = site.id, domain = %domain, "Site created");
        Ok(site)
    }

    pub async fn delete_site(&self, caller: Caller, site_id: i64) -> Result<()> {
        let site = self.storage.get_site(site_id).await?;
        let target = self.target(caller, site.sandbox_id).await?;

        self.websites.delete(&target.runtime_id, &site.domain).await?;
        self.storage.delete_site(site_id).await?;

        self.record_activity(caller, "delete_site", &site.domain).await;
        info!(sandbox_id = site.sandbox_id, site_id = site_id, domain = %site.domain, "Site deleted");
        Ok(())
    }

    /// Issue a certificate for a site and switch its virtual host to TLS
    pub async fn request_certificate(&self, caller: Caller, site_id: i64) -> Result<Site> {
        let site = self.storage.get_site(site_id).await?;
        let target = self.target(caller, site.sandbox_id).await?;
        let config = site_config(&site, true)?;
        let email = self.settings.ssl_email().await?;

        let expires_at = self
            .tls
            .request(&target.runtime_id, &site.domain, email.as_deref(), config.server)
            .await?;
        self.websites.configure(&target.runtime_id, &config).await?;
        self.storage.set_site_certificate(site_id, expires_at).await?;

        self.record_activity(caller, "request_certificate", &site.domain)
            .await;
        info!(site_id = site_id, domain = %site.domain, expires_at = %expires_at, "Certificate installed");
        Ok(self.storage.get_site(site_id).await?)
    }

    // ========================================================================
    // DATABASES
    // ========================================================================

    pub async fn create_database(
        &self,
        caller: Caller,
        sandbox_id: i64,
        request: CreateDatabaseRequest,
    ) -> Result<CreatedDatabase> {
        let spec = DatabaseSpec {
            user: request.user.unwrap_or_else(|| request.name.clone()),
            name: request.name,
            engine: request.engine,
            remote_access: request.remote_access,
        };
        crate::resources::database::validate_identifier("database name", &spec.name)?;
        crate::resources::database::validate_identifier("database user", &spec.user)?;

        let target = self.target(caller, sandbox_id).await?;
        let database = self
            .storage
            .create_database(NewDatabase {
                sandbox_id,
                owner_id: target.sandbox.owner_id,
                name: spec.name.clone(),
                engine: spec.engine.as_str().to_string(),
                db_user: spec.user.clone(),
                remote_access: spec.remote_access,
            })
            .await?;

        let password = match self.databases.create(&target.runtime_id, &spec).await {
            Ok(password) => password,
            Err(e) => {
                self.discard("database", database.id, self.storage.delete_database(database.id).await);
                return Err(e.into());
            }
        };

        self.record_activity(
            caller,
            "create_database",
            &format!("{} in sandbox {}", spec.name, sandbox_id),
        )
        .await;
        info!(sandbox_id = sandbox_id, database_id = database.id, name = %spec.name, "Database created");
        Ok(CreatedDatabase { database, password })
    }

    pub async fn delete_database(&self, caller: Caller, database_id: i64) -> Result<()> {
        let database = self.storage.get_database(database_id).await?;
        let target = self.target(caller, database.sandbox_id).await?;
        let engine: DatabaseEngine = database.engine.parse()?;

        self.databases
            .delete(&target.runtime_id, &database.name, engine, &database.db_user)
            .await?;
        self.storage.delete_database(database_id).await?;

        self.record_activity(caller, "delete_database", &database.name)
            .await;
        info!(database_id = database_id, name = %database.name, "Database deleted");
        Ok(())
    }

    // ========================================================================
    // CRON JOBS
    // ========================================================================

    pub async fn create_cron_job(
        &self,
        caller: Caller,
        sandbox_id: i64,
        request: CreateCronJobRequest,
    ) -> Result<CronJob> {
        crate::resources::cron::validate_schedule(&request.schedule)?;

        let target = self.target(caller, sandbox_id).await?;
        let job = self
            .storage
            .create_cron_job(NewCronJob {
                sandbox_id,
                owner_id: target.sandbox.owner_id,
                name: request.name.clone(),
                command: request.command.clone(),
                schedule: request.schedule.clone(),
            })
            .await?;

        if let Err(e) = self
            .cron
            .create(&target.runtime_id, &request.name, &request.command, &request.schedule)
            .await
        {
            self.discard("cron job", job.id, self.storage.delete_cron_job(job.id).await);
            return Err(e.into());
        }

        self.record_activity(caller, "create_cron_job", &request.name)
            .await;
        info!(sandbox_id = sandbox_id, job_id = job.id, name = %request.name, "Cron job created");
        Ok(job)
    }

    pub async fn toggle_cron_job(&self, caller: Caller, job_id: i64, active: bool) -> Result<CronJob> {
        let job = self.storage.get_cron_job(job_id).await?;
        let target = self.target(caller, job.sandbox_id).await?;

        self.cron.toggle(&target.runtime_id, &job.name, active).await?;
        self.storage.set_cron_job_active(job_id, active).await?;

        let action = if active { "enable_cron_job" } else { "disable_cron_job" };
        self.record_activity(caller, action, &job.name).await;
        Ok(self.storage.get_cron_job(job_id).await?)
    }

    pub async fn delete_cron_job(&self, caller: Caller, job_id: i64) -> Result<()> {
        let job = self.storage.get_cron_job(job_id).await?;
        let target = self.target(caller, job.sandbox_id).await?;

        self.cron.delete(&target.runtime_id, &job.name).await?;
        self.storage.delete_cron_job(job_id).await?;

        self.record_activity(caller, "delete_cron_job", &job.name).await;
        info!(job_id = job_id, name = %job.name, "Cron job deleted");
        Ok(())
    }

    // ========================================================================
    // FILES
    // ========================================================================

    pub async fn list_files(
        &self,
        caller: Caller,
        sandbox_id: i64,
        path: &str,
    ) -> Result<Vec<FileEntry>> {
        let target = self.target(caller, sandbox_id).await?;
        Ok(self.files.list_directory(&target.runtime_id, path).await?)
    }

    pub async fn read_file(&self, caller: Caller, sandbox_id: i64, path: &str) -> Result<String> {
        let target = self.target(caller, sandbox_id).await?;
        Ok(self.files.read_file(&target.runtime_id, path).await?)
    }

    pub async fn fetch_file(&self, caller: Caller, sandbox_id: i64, path: &str) -> Result<Vec<u8>> {
        let target = self.target(caller, sandbox_id).await?;
        Ok(self.files.fetch_file(&target.runtime_id, path).await?)
    }

    pub async fn write_file(
        &self,
        caller: Caller,
        sandbox_id: i64,
        path: &str,
        contents: &[u8],
    ) -> Result<()> {
        let target = self.target(caller, sandbox_id).await?;
        self.files
            .write_file(&target.runtime_id, path, contents)
            .await?;
        self.record_activity(caller, "write_file", path).await;
        Ok(())
    }

    pub async fn create_directory(&self, caller: Caller, sandbox_id: i64, path: &str) -> Result<()> {
        let target = self.target(caller, sandbox_id).await?;
        self.files.create_directory(&target.runtime_id, path).await?;
        self.record_activity(caller, "create_directory", path).await;
        Ok(())
    }

    pub async fn delete_path(&self, caller: Caller, sandbox_id: i64, path: &str) -> Result<()> {
        let target = self.target(caller, sandbox_id).await?;
        self.files.delete_path(&target.runtime_id, path).await?;
        self.record_activity(caller, "delete_path", path).await;
        Ok(())
    }

    /// Download `url` into `destination_dir` inside the sandbox, returning the file name
    pub async fn download_url(
        &self,
        caller: Caller,
        sandbox_id: i64,
        url: &str,
        destination_dir: &str,
    ) -> Result<String> {
        let target = self.target(caller, sandbox_id).await?;
        let name = self
            .files
            .download_url(&target.runtime_id, url, destination_dir)
            .await?;
        self.record_activity(caller, "download_url", url).await;
        Ok(name)
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    /// Lock the sandbox, then check ownership and that it is running
    async fn target(&self, caller: Caller, sandbox_id: i64) -> Result<Target> {
        let guard = self.locks.lock(sandbox_id).await;

        let sandbox = match self.storage.get_sandbox(sandbox_id).await {
            Ok(sandbox) => sandbox,
            Err(StorageError::NotFound(_)) => return Err(HostingError::SandboxNotFound(sandbox_id)),
            Err(e) => return Err(e.into()),
        };
        if !caller.can_manage(&sandbox) {
            return Err(HostingError::Forbidden {
                sandbox_id,
                caller: caller.account_id,
            });
        }

        match (&sandbox.status, &sandbox.runtime_id) {
            (SandboxStatus::Running, Some(runtime_id)) => Ok(Target {
                runtime_id: runtime_id.clone(),
                sandbox,
                _guard: guard,
            }),
            _ => Err(HostingError::NotRunning {
                sandbox_id,
                status: sandbox.status,
            }),
        }
    }

    /// Drop a row whose provisioning failed
    fn discard(&self, kind: &str, id: i64, result: std::result::Result<(), StorageError>) {
        if let Err(e) = result {
            error!(kind = %kind, id = id, error = %e, "Failed to remove row after provisioning failure");
        }
    }

    async fn record_activity(&self, caller: Caller, action: &str, details: &str) {
        if let Err(e) = self
            .storage
            .log_activity(caller.account_id, action, Some(details))
            .await
        {
            warn!(action = %action, error = %e, "Failed to record activity");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::{CreateSandboxRequest, ManagerConfig, SandboxManager};
    use crate::runtime::fake::FakeRuntime;
    use crate::storage::{test_pool, NewAccount, Resources};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    struct Harness {
        manager: Arc<SandboxManager>,
        hosting: HostingManager,
        runtime: Arc<FakeRuntime>,
        storage: Arc<SandboxStorage>,
        owner: Caller,
    }

    async fn harness() -> Harness {
        let pool = test_pool().await;
        let storage = Arc::new(SandboxStorage::new(pool.clone()));
        let runtime = Arc::new(FakeRuntime::new());
        let manager = Arc::new(SandboxManager::new(
            storage.clone(),
            runtime.clone(),
            ManagerConfig::default(),
        ));
        let hosting = HostingManager::new(
            storage.clone(),
            manager.executor().clone(),
            SettingsManager::new(pool),
            manager.sandbox_locks(),
        );

        let account = storage
            .create_account(NewAccount {
                username: "alice".to_string(),
                is_admin: false,
                limits: Resources {
                    cpu: 2,
                    memory_mb: 2048,
                    disk_mb: 10240,
                },
            })
            .await
            .unwrap();

        Harness {
            manager,
            hosting,
            runtime,
            storage,
            owner: Caller::account(account.id),
        }
    }

    async fn running_sandbox(h: &Harness, name: &str, template: &str) -> Sandbox {
        let sandbox = h
            .manager
            .create_sandbox(CreateSandboxRequest {
                name: name.to_string(),
                template: template.to_string(),
                owner_id: h.owner.account_id,
                resources: Resources {
                    cpu: 1,
                    memory_mb: 512,
                    disk_mb: 1024,
                },
            })
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), h.manager.wait_for_provisioning())
            .await
            .expect("provisioning did not settle");
        let sandbox = h.storage.get_sandbox(sandbox.id).await.unwrap();
        assert_eq!(sandbox.status, SandboxStatus::Running);
        sandbox
    }

    fn site_request(domain: &str) -> CreateSiteRequest {
        CreateSiteRequest {
            domain: domain.to_string(),
            server: None,
            php_version: None,
        }
    }

    #[tokio::test]
    async fn test_create_site_uses_template_web_server() {
        let h = harness().await;
        let sandbox = running_sandbox(&h, "web1", "apache").await;

        let site = h
            .hosting
            .create_site(h.owner, sandbox.id, site_request("Example.com"))
            .await
            .unwrap();

        assert_eq!(site.domain, "example.com");
        assert_eq!(site.server_type, "apache");
        assert_eq!(site.document_root, "/var/www/example.com");
        let runtime_id = sandbox.runtime_id.unwrap();
        assert!(h
            .runtime
            .file(&runtime_id, "/etc/apache2/sites-available/example.com.conf")
            .is_some());
        assert!(h.runtime.exec_calls().contains(&"a2ensite example.com.conf".to_string()));
    }

    #[tokio::test]
    async fn test_site_blocks_sandbox_delete_until_removed() {
        let h = harness().await;
        let sandbox = running_sandbox(&h, "web1", "nginx").await;
        let site = h
            .hosting
            .create_site(h.owner, sandbox.id, site_request("example.com"))
            .await
            .unwrap();

        let err = h
            .manager
            .delete_sandbox(sandbox.id, h.owner)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            crate::manager::ManagerError::HasDependents { sites: 1, .. }
        ));

        h.hosting.delete_site(h.owner, site.id).await.unwrap();
        h.manager.delete_sandbox(sandbox.id, h.owner).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_provisioning_removes_row() {
        let h = harness().await;
        let sandbox = running_sandbox(&h, "web1", "nginx").await;
        h.runtime.respond("ln -s", 1, "", "ln: failed to create symbolic link");

        let result = h
            .hosting
            .create_site(h.owner, sandbox.id, site_request("example.com"))
            .await;

        assert!(matches!(result, Err(HostingError::Resource(_))));
        assert!(h.storage.list_sites(sandbox.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_domain_is_rejected() {
        let h = harness().await;
        let sandbox = running_sandbox(&h, "web1", "nginx").await;
        h.hosting
            .create_site(h.owner, sandbox.id, site_request("example.com"))
            .await
            .unwrap();

        let err = h
            .hosting
            .create_site(h.owner, sandbox.id, site_request("example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, HostingError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_requires_running_sandbox() {
        let h = harness().await;
        let sandbox = running_sandbox(&h, "web1", "nginx").await;
        h.manager.stop_sandbox(sandbox.id, h.owner).await.unwrap();

        let err = h
            .hosting
            .create_site(h.owner, sandbox.id, site_request("example.com"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HostingError::NotRunning {
                status: SandboxStatus::Stopped,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_other_accounts_are_forbidden() {
        let h = harness().await;
        let sandbox = running_sandbox(&h, "web1", "nginx").await;
        let mallory = h
            .storage
            .create_account(NewAccount {
                username: "mallory".to_string(),
                is_admin: false,
                limits: Resources::default(),
            })
            .await
            .unwrap();

        let err = h
            .hosting
            .create_cron_job(
                Caller::account(mallory.id),
                sandbox.id,
                CreateCronJobRequest {
                    name: "backup".to_string(),
                    command: "backup.sh".to_string(),
                    schedule: "0 3 * * *".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HostingError::Forbidden { .. }));

        let err = h
            .hosting
            .create_site(h.owner, 9999, site_request("example.com"))
            .await
            .unwrap_err();
        assert!(matches!(err, HostingError::SandboxNotFound(9999)));
    }

    #[tokio::test]
    async fn test_file_operations_go_through_owned_running_sandbox() {
        let h = harness().await;
        let sandbox = running_sandbox(&h, "web1", "nginx").await;
        let runtime_id = sandbox.runtime_id.clone().unwrap();

        h.hosting
            .write_file(h.owner, sandbox.id, "/var/www/notes.txt", b"remember")
            .await
            .unwrap();
        assert_eq!(
            h.runtime.file(&runtime_id, "/var/www/notes.txt").unwrap(),
            b"remember".to_vec()
        );
        let fetched = h
            .hosting
            .fetch_file(h.owner, sandbox.id, "/var/www/notes.txt")
            .await
            .unwrap();
        assert_eq!(fetched, b"remember".to_vec());

        h.hosting
            .delete_path(h.owner, sandbox.id, "/var/www/notes.txt")
            .await
            .unwrap();
        assert!(h
            .runtime
            .exec_calls()
            .contains(&"rm -rf /var/www/notes.txt".to_string()));

        let err = h
            .hosting
            .delete_path(h.owner, sandbox.id, "/")
            .await
            .unwrap_err();
        assert!(matches!(err, HostingError::File(FileError::InvalidPath(_))));

        let activity = h
            .storage
            .list_activity(h.owner.account_id, 10)
            .await
            .unwrap();
        assert!(activity.iter().any(|entry| entry.action == "write_file"));
    }

    #[tokio::test]
    async fn test_file_operations_check_owner_and_status() {
        let h = harness().await;
        let sandbox = running_sandbox(&h, "web1", "nginx").await;
        let mallory = h
            .storage
            .create_account(NewAccount {
                username: "mallory".to_string(),
                is_admin: false,
                limits: Resources::default(),
            })
            .await
            .unwrap();
        let execs_before = h.runtime.exec_calls().len();

        let err = h
            .hosting
            .read_file(Caller::account(mallory.id), sandbox.id, "/etc/passwd")
            .await
            .unwrap_err();
        assert!(matches!(err, HostingError::Forbidden { .. }));
        assert_eq!(h.runtime.exec_calls().len(), execs_before);

        h.manager.stop_sandbox(sandbox.id, h.owner).await.unwrap();
        let err = h
            .hosting
            .list_files(h.owner, sandbox.id, "/var/www")
            .await
            .unwrap_err();
        assert!(matches!(err, HostingError::NotRunning { .. }));
    }

    #[tokio::test]
    async fn test_database_password_is_returned_not_stored() {
        let h = harness().await;
        let sandbox = running_sandbox(&h, "web1", "nginx").await;

        let created = h
            .hosting
            .create_database(
                h.owner,
                sandbox.id,
                CreateDatabaseRequest {
                    name: "shop".to_string(),
                    engine: DatabaseEngine::Mysql,
                    user: None,
                    remote_access: false,
                },
            )
            .await
            .unwrap();

        assert_eq!(created.password.len(), 16);
        assert_eq!(created.database.db_user, "shop");
        let stored = serde_json::to_string(&h.storage.get_database(created.database.id).await.unwrap())
            .unwrap();
        assert!(!stored.contains(&created.password));

        h.hosting
            .delete_database(h.owner, created.database.id)
            .await
            .unwrap();
        assert!(h.storage.list_databases(sandbox.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cron_job_lifecycle() {
        let h = harness().await;
        let sandbox = running_sandbox(&h, "web1", "nginx").await;

        let job = h
            .hosting
            .create_cron_job(
                h.owner,
                sandbox.id,
                CreateCronJobRequest {
                    name: "backup".to_string(),
                    command: "backup.sh".to_string(),
                    schedule: "0 3 * * *".to_string(),
                },
            )
            .await
            .unwrap();
        assert!(job.active);

        h.runtime.respond(
            "cat /etc/cron.d/sbpanel-backup",
            0,
            "0 3 * * * root backup.sh # SBPanel Job: backup\n",
            "",
        );
        let job = h.hosting.toggle_cron_job(h.owner, job.id, false).await.unwrap();
        assert!(!job.active);

        h.hosting.delete_cron_job(h.owner, job.id).await.unwrap();
        assert!(h.storage.list_cron_jobs(sandbox.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_schedule_is_rejected_before_persisting() {
        let h = harness().await;
        let sandbox = running_sandbox(&h, "web1", "nginx").await;

        let err = h
            .hosting
            .create_cron_job(
                h.owner,
                sandbox.id,
                CreateCronJobRequest {
                    name: "bad".to_string(),
                    command: "true".to_string(),
                    schedule: "every day".to_string(),
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, HostingError::Resource(ResourceError::Invalid { .. })));
        assert!(h.storage.list_cron_jobs(sandbox.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_request_certificate_enables_tls() {
        let h = harness().await;
        let sandbox = running_sandbox(&h, "web1", "nginx").await;
        let site = h
            .hosting
            .create_site(h.owner, sandbox.id, site_request("example.com"))
            .await
            .unwrap();

        let site = h.hosting.request_certificate(h.owner, site.id).await.unwrap();

        assert!(site.ssl_enabled);
        assert!(site.ssl_expires_at.is_some());
        let vhost = h
            .runtime
            .file(
                sandbox.runtime_id.as_deref().unwrap(),
                "/etc/nginx/sites-available/example.com",
            )
            .unwrap();
        assert!(String::from_utf8(vhost).unwrap().contains("listen 443 ssl;"));
        assert!(h
            .runtime
            .exec_calls()
            .iter()
            .any(|c| c.ends_with("--register-unsafely-without-email")));
    }
}
