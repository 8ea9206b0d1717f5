// ABOUTME: Storage layer for accounts, sandboxes, services and hosted resources
// ABOUTME: Provides CRUD and compare-and-swap status updates over SQLite

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::fmt;
use thiserror::Error;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid status: {0}")]
    InvalidStatus(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("Sandbox {sandbox_id} still has {sites} site(s) and {databases} database(s)")]
    HasDependents {
        sandbox_id: i64,
        sites: i64,
        databases: i64,
    },
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Open a pool against `url` and apply pending migrations
pub async fn connect(url: &str, max_connections: u32) -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;
    MIGRATOR.run(&pool).await?;
    Ok(pool)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SandboxStatus {
    Creating,
    Running,
    Stopped,
    ErrorCreatingBase,
    ErrorProvisioning,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::ErrorCreatingBase => "error_creating_base",
            Self::ErrorProvisioning => "error_provisioning",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "creating" => Ok(Self::Creating),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "error_creating_base" => Ok(Self::ErrorCreatingBase),
            "error_provisioning" => Ok(Self::ErrorProvisioning),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::ErrorCreatingBase | Self::ErrorProvisioning)
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Running,
    Stopped,
    Failed,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }
}

/// CPU cores, memory and disk, used for limits, usage and requests alike
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resources {
    pub cpu: i64,
    pub memory_mb: i64,
    pub disk_mb: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub username: String,
    pub is_admin: bool,
    pub limits: Resources,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub is_admin: bool,
    pub limits: Resources,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub id: i64,
    pub name: String,
    pub owner_id: i64,
    /// Deterministic name of the runtime instance
    pub runtime_name: String,
    /// Runtime-assigned id, the join key for every runtime call
    pub runtime_id: Option<String>,
    pub template: String,
    pub status: SandboxStatus,
    pub address: Option<String>,
    pub resources: Resources,
    pub status_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewSandbox {
    pub name: String,
    pub owner_id: i64,
    pub runtime_name: String,
    pub template: String,
    pub resources: Resources,
}

/// How a status transition treats the stored address
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AddressUpdate {
    #[default]
    Keep,
    Clear,
    Set(String),
}

impl From<Option<String>> for AddressUpdate {
    fn from(address: Option<String>) -> Self {
        match address {
            Some(address) => AddressUpdate::Set(address),
            None => AddressUpdate::Clear,
        }
    }
}

/// Conditional status change: applied only while the record is still in `from`
#[derive(Debug, Clone)]
pub struct Transition {
    pub from: SandboxStatus,
    pub to: SandboxStatus,
    pub address: AddressUpdate,
    pub message: Option<String>,
}

impl Transition {
    pub fn new(from: SandboxStatus, to: SandboxStatus) -> Self {
        Self {
            from,
            to,
            address: AddressUpdate::Keep,
            message: None,
        }
    }

    pub fn address(mut self, address: impl Into<AddressUpdate>) -> Self {
        self.address = address.into();
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    pub id: i64,
    pub sandbox_id: i64,
    pub name: String,
    pub service_type: String,
    pub status: ServiceStatus,
    pub auto_start: bool,
    pub port: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct NewService {
    pub name: String,
    pub service_type: String,
    pub status: ServiceStatus,
    pub port: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: i64,
    pub sandbox_id: i64,
    pub owner_id: i64,
    pub domain: String,
    pub server_type: String,
    pub php_version: String,
    pub document_root: String,
    pub ssl_enabled: bool,
    pub ssl_expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewSite {
    pub sandbox_id: i64,
    pub owner_id: i64,
    pub domain: String,
    pub server_type: String,
    pub php_version: String,
    pub document_root: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseRecord {
    pub id: i64,
    pub sandbox_id: i64,
    pub owner_id: i64,
    pub name: String,
    pub engine: String,
    pub db_user: String,
    pub remote_access: bool,
}

#[derive(Debug, Clone)]
pub struct NewDatabase {
    pub sandbox_id: i64,
    pub owner_id: i64,
    pub name: String,
    pub engine: String,
    pub db_user: String,
    pub remote_access: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: i64,
    pub sandbox_id: i64,
    pub owner_id: i64,
    pub name: String,
    pub command: String,
    pub schedule: String,
    pub active: bool,
}

#[derive(Debug, Clone)]
pub struct NewCronJob {
    pub sandbox_id: i64,
    pub owner_id: i64,
    pub name: String,
    pub command: String,
    pub schedule: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub id: i64,
    pub account_id: i64,
    pub action: String,
    pub details: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A runtime instance whose record is gone but whose removal failed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationTask {
    pub id: i64,
    pub runtime_id: String,
    pub sandbox_id: i64,
    pub operation: String,
    pub last_error: String,
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
}

/// Resources that block deletion of a sandbox
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dependents {
    pub sites: i64,
    pub databases: i64,
}

impl Dependents {
    pub fn is_empty(&self) -> bool {
        self.sites == 0 && self.databases == 0
    }
}

const SANDBOX_COLUMNS: &str = "id, name, owner_id, runtime_name, runtime_id, template, status, \
     address, cpu, memory_mb, disk_mb, status_message, created_at, updated_at";

pub struct SandboxStorage {
    pool: SqlitePool,
}

impl SandboxStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ========================================================================
    // ACCOUNT OPERATIONS
    // ========================================================================

    pub async fn create_account(&self, account: NewAccount) -> Result<Account> {
        let id: i64 = sqlx::query(
            r#"
            INSERT INTO accounts (username, is_admin, cpu_limit, memory_limit_mb, disk_limit_mb)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING id
            "#,
        )
        .bind(&account.username)
        .bind(account.is_admin)
        .bind(account.limits.cpu)
        .bind(account.limits.memory_mb)
        .bind(account.limits.disk_mb)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| unique_violation(e, format!("account {}", account.username)))?
        .try_get(0)?;

        self.get_account(id).await
    }

    pub async fn get_account(&self, id: i64) -> Result<Account> {
        let row = sqlx::query(
            r#"
            SELECT id, username, is_admin, cpu_limit, memory_limit_mb, disk_limit_mb, created_at
            FROM accounts
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_account(row),
            None => Err(StorageError::NotFound(format!("account {}", id))),
        }
    }

    pub async fn set_account_limits(&self, id: i64, limits: Resources) -> Result<()> {
        let result = sqlx::query(
            "UPDATE accounts SET cpu_limit = ?1, memory_limit_mb = ?2, disk_limit_mb = ?3 WHERE id = ?4",
        )
        .bind(limits.cpu)
        .bind(limits.memory_mb)
        .bind(limits.disk_mb)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("account {}", id)));
        }

        Ok(())
    }

    // ========================================================================
    // SANDBOX OPERATIONS
    // ========================================================================

    /// Insert a placeholder record in `creating` state and return it with its generated id
    pub async fn insert_sandbox(&self, sandbox: NewSandbox) -> Result<Sandbox> {
        let now = Utc::now().to_rfc3339();

        let id: i64 = sqlx::query(
            r#"
            INSERT INTO sandboxes (
                name, owner_id, runtime_name, template, status,
                cpu, memory_mb, disk_mb, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            RETURNING id
            "#,
        )
        .bind(&sandbox.name)
        .bind(sandbox.owner_id)
        .bind(&sandbox.runtime_name)
        .bind(&sandbox.template)
        .bind(SandboxStatus::Creating.as_str())
        .bind(sandbox.resources.cpu)
        .bind(sandbox.resources.memory_mb)
        .bind(sandbox.resources.disk_mb)
        .bind(&now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| unique_violation(e, format!("sandbox {}", sandbox.name)))?
        .try_get(0)?;

        self.get_sandbox(id).await
    }

    pub async fn get_sandbox(&self, id: i64) -> Result<Sandbox> {
        let query = format!("SELECT {} FROM sandboxes WHERE id = ?1", SANDBOX_COLUMNS);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_sandbox(row),
            None => Err(StorageError::NotFound(format!("sandbox {}", id))),
        }
    }

    pub async fn find_sandbox_by_name(&self, owner_id: i64, name: &str) -> Result<Option<Sandbox>> {
        let query = format!(
            "SELECT {} FROM sandboxes WHERE owner_id = ?1 AND name = ?2",
            SANDBOX_COLUMNS
        );
        let row = sqlx::query(&query)
            .bind(owner_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_sandbox).transpose()
    }

    pub async fn find_sandbox_by_runtime_id(&self, runtime_id: &str) -> Result<Option<Sandbox>> {
        let query = format!("SELECT {} FROM sandboxes WHERE runtime_id = ?1", SANDBOX_COLUMNS);
        let row = sqlx::query(&query)
            .bind(runtime_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(row_to_sandbox).transpose()
    }

    pub async fn list_sandboxes(
        &self,
        owner_id: Option<i64>,
        status: Option<SandboxStatus>,
    ) -> Result<Vec<Sandbox>> {
        let mut query = format!("SELECT {} FROM sandboxes WHERE 1=1", SANDBOX_COLUMNS);

        if owner_id.is_some() {
            query.push_str(" AND owner_id = ?");
        }
        if status.is_some() {
            query.push_str(" AND status = ?");
        }
        query.push_str(" ORDER BY id");

        let mut q = sqlx::query(&query);
        if let Some(owner_id) = owner_id {
            q = q.bind(owner_id);
        }
        if let Some(status) = status {
            q = q.bind(status.as_str());
        }

        let rows = q.fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_sandbox).collect()
    }

    /// Sum of the allocations of every sandbox the owner has, whatever its status
    pub async fn usage_for_owner(&self, owner_id: i64) -> Result<Resources> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(cpu), 0) AS cpu,
                   COALESCE(SUM(memory_mb), 0) AS memory_mb,
                   COALESCE(SUM(disk_mb), 0) AS disk_mb
            FROM sandboxes
            WHERE owner_id = ?1
            "#,
        )
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Resources {
            cpu: row.try_get("cpu")?,
            memory_mb: row.try_get("memory_mb")?,
            disk_mb: row.try_get("disk_mb")?,
        })
    }

    /// Record the runtime instance backing a sandbox that is still `creating`
    pub async fn attach_runtime(
        &self,
        id: i64,
        runtime_id: &str,
        address: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET runtime_id = ?1, address = ?2, updated_at = ?3
            WHERE id = ?4 AND status = 'creating'
            "#,
        )
        .bind(runtime_id)
        .bind(address)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| unique_violation(e, format!("runtime id {}", runtime_id)))?;

        if result.rows_affected() == 0 {
            let current = self.get_sandbox(id).await?;
            return Err(StorageError::InvalidStatus(format!(
                "sandbox {} is {}, expected creating",
                id, current.status
            )));
        }

        Ok(())
    }

    /// Apply `transition` only if the record is still in `transition.from`
    ///
    /// Returns `Ok(false)` when the record exists but has moved to another
    /// status and `NotFound` when the record is gone.
    pub async fn transition(&self, id: i64, transition: &Transition) -> Result<bool> {
        let mut query =
            String::from("UPDATE sandboxes SET status = ?, status_message = ?, updated_at = ?");
        match transition.address {
            AddressUpdate::Keep => {}
            AddressUpdate::Clear | AddressUpdate::Set(_) => query.push_str(", address = ?"),
        }
        query.push_str(" WHERE id = ? AND status = ?");

        let mut q = sqlx::query(&query)
            .bind(transition.to.as_str())
            .bind(transition.message.as_deref())
            .bind(Utc::now().to_rfc3339());
        match &transition.address {
            AddressUpdate::Keep => {}
            AddressUpdate::Clear => q = q.bind(None::<String>),
            AddressUpdate::Set(address) => q = q.bind(address.clone()),
        }

        let result = q
            .bind(id)
            .bind(transition.from.as_str())
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            // Distinguish a lost race from a deleted record
            self.get_sandbox(id).await?;
            return Ok(false);
        }

        Ok(true)
    }

    /// Move a provisioned sandbox to `running` and record its services atomically
    ///
    /// Returns `Ok(false)` without writing anything when the record is no longer
    /// `creating` on `runtime_id`.
    pub async fn complete_provisioning(
        &self,
        id: i64,
        runtime_id: &str,
        address: Option<&str>,
        services: &[NewService],
    ) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE sandboxes
            SET status = 'running', status_message = NULL, address = ?1, updated_at = ?2
            WHERE id = ?3 AND status = 'creating' AND runtime_id = ?4
            "#,
        )
        .bind(address)
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .bind(runtime_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for service in services {
            sqlx::query(
                r#"
                INSERT INTO services (sandbox_id, name, service_type, status, auto_start, port)
                VALUES (?1, ?2, ?3, ?4, 1, ?5)
                ON CONFLICT (sandbox_id, name) DO UPDATE SET status = excluded.status
                "#,
            )
            .bind(id)
            .bind(&service.name)
            .bind(&service.service_type)
            .bind(service.status.as_str())
            .bind(service.port)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    pub async fn count_dependents(&self, id: i64) -> Result<Dependents> {
        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM sites WHERE sandbox_id = ?1) AS sites,
                   (SELECT COUNT(*) FROM databases WHERE sandbox_id = ?1) AS databases
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Dependents {
            sites: row.try_get("sites")?,
            databases: row.try_get("databases")?,
        })
    }

    /// Delete a sandbox's services, jobs and record in one transaction
    ///
    /// Dependents are re-checked inside the transaction, so a site created after
    /// an earlier check still blocks the delete.
    pub async fn delete_sandbox(&self, id: i64) -> Result<Sandbox> {
        let mut tx = self.pool.begin().await?;

        let query = format!("SELECT {} FROM sandboxes WHERE id = ?1", SANDBOX_COLUMNS);
        let sandbox = match sqlx::query(&query)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
        {
            Some(row) => row_to_sandbox(row)?,
            None => return Err(StorageError::NotFound(format!("sandbox {}", id))),
        };

        let row = sqlx::query(
            r#"
            SELECT (SELECT COUNT(*) FROM sites WHERE sandbox_id = ?1) AS sites,
                   (SELECT COUNT(*) FROM databases WHERE sandbox_id = ?1) AS databases
            "#,
        )
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
        let dependents = Dependents {
            sites: row.try_get("sites")?,
            databases: row.try_get("databases")?,
        };
        if !dependents.is_empty() {
            tx.rollback().await?;
            return Err(StorageError::HasDependents {
                sandbox_id: id,
                sites: dependents.sites,
                databases: dependents.databases,
            });
        }

        sqlx::query("DELETE FROM services WHERE sandbox_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM cron_jobs WHERE sandbox_id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM sandboxes WHERE id = ?1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(sandbox)
    }

    // ========================================================================
    // SERVICE OPERATIONS
    // ========================================================================

    pub async fn list_services(&self, sandbox_id: i64) -> Result<Vec<Service>> {
        let rows = sqlx::query(
            r#"
            SELECT id, sandbox_id, name, service_type, status, auto_start, port
            FROM services
            WHERE sandbox_id = ?1
            ORDER BY id
            "#,
        )
        .bind(sandbox_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_service).collect()
    }

    pub async fn get_service(&self, id: i64) -> Result<Service> {
        let row = sqlx::query(
            r#"
            SELECT id, sandbox_id, name, service_type, status, auto_start, port
            FROM services
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_service(row),
            None => Err(StorageError::NotFound(format!("service {}", id))),
        }
    }

    pub async fn set_service_status(&self, id: i64, status: ServiceStatus) -> Result<()> {
        let result = sqlx::query("UPDATE services SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("service {}", id)));
        }

        Ok(())
    }

    pub async fn set_service_auto_start(&self, id: i64, auto_start: bool) -> Result<()> {
        let result = sqlx::query("UPDATE services SET auto_start = ?1 WHERE id = ?2")
            .bind(auto_start)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("service {}", id)));
        }

        Ok(())
    }

    /// Mark every service of a sandbox stopped, returning how many rows changed
    pub async fn mark_services_stopped(&self, sandbox_id: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE services SET status = 'stopped' WHERE sandbox_id = ?1 AND status != 'stopped'",
        )
        .bind(sandbox_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ========================================================================
    // SITE OPERATIONS
    // ========================================================================

    pub async fn create_site(&self, site: NewSite) -> Result<Site> {
        let id: i64 = sqlx::query(
            r#"
            INSERT INTO sites (sandbox_id, owner_id, domain, server_type, php_version, document_root)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            RETURNING id
            "#,
        )
        .bind(site.sandbox_id)
        .bind(site.owner_id)
        .bind(&site.domain)
        .bind(&site.server_type)
        .bind(&site.php_version)
        .bind(&site.document_root)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| unique_violation(e, format!("site {}", site.domain)))?
        .try_get(0)?;

        self.get_site(id).await
    }

    pub async fn get_site(&self, id: i64) -> Result<Site> {
        let row = sqlx::query(
            r#"
            SELECT id, sandbox_id, owner_id, domain, server_type, php_version, document_root,
                   ssl_enabled, ssl_expires_at
            FROM sites
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_site(row),
            None => Err(StorageError::NotFound(format!("site {}", id))),
        }
    }

    pub async fn list_sites(&self, sandbox_id: i64) -> Result<Vec<Site>> {
        let rows = sqlx::query(
            r#"
            SELECT id, sandbox_id, owner_id, domain, server_type, php_version, document_root,
                   ssl_enabled, ssl_expires_at
            FROM sites
            WHERE sandbox_id = ?1
            ORDER BY domain
            "#,
        )
        .bind(sandbox_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_site).collect()
    }

    pub async fn set_site_certificate(&self, id: i64, expires_at: DateTime<Utc>) -> Result<()> {
        let result =
            sqlx::query("UPDATE sites SET ssl_enabled = 1, ssl_expires_at = ?1 WHERE id = ?2")
                .bind(expires_at.to_rfc3339())
                .bind(id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("site {}", id)));
        }

        Ok(())
    }

    pub async fn delete_site(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM sites WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("site {}", id)));
        }

        Ok(())
    }

    // ========================================================================
    // DATABASE OPERATIONS
    // ========================================================================

    pub async fn create_database(&self, database: NewDatabase) -> Result<DatabaseRecord> {
        let id: i64 = sqlx::query(
            r#"
            INSERT INTO databases (sandbox_id, owner_id, name, engine, db_user, remote_access)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            RETURNING id
            "#,
        )
        .bind(database.sandbox_id)
        .bind(database.owner_id)
        .bind(&database.name)
        .bind(&database.engine)
        .bind(&database.db_user)
        .bind(database.remote_access)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| unique_violation(e, format!("database {}", database.name)))?
        .try_get(0)?;

        self.get_database(id).await
    }

    pub async fn get_database(&self, id: i64) -> Result<DatabaseRecord> {
        let row = sqlx::query(
            r#"
            SELECT id, sandbox_id, owner_id, name, engine, db_user, remote_access
            FROM databases
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_database(row),
            None => Err(StorageError::NotFound(format!("database {}", id))),
        }
    }

    pub async fn list_databases(&self, sandbox_id: i64) -> Result<Vec<DatabaseRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, sandbox_id, owner_id, name, engine, db_user, remote_access
            FROM databases
            WHERE sandbox_id = ?1
            ORDER BY name
            "#,
        )
        .bind(sandbox_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_database).collect()
    }

    pub async fn delete_database(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM databases WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("database {}", id)));
        }

        Ok(())
    }

    // ========================================================================
    // CRON JOB OPERATIONS
    // ========================================================================

    pub async fn create_cron_job(&self, job: NewCronJob) -> Result<CronJob> {
        let id: i64 = sqlx::query(
            r#"
            INSERT INTO cron_jobs (sandbox_id, owner_id, name, command, schedule)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING id
            "#,
        )
        .bind(job.sandbox_id)
        .bind(job.owner_id)
        .bind(&job.name)
        .bind(&job.command)
        .bind(&job.schedule)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| unique_violation(e, format!("cron job {}", job.name)))?
        .try_get(0)?;

        self.get_cron_job(id).await
    }

    pub async fn get_cron_job(&self, id: i64) -> Result<CronJob> {
        let row = sqlx::query(
            r#"
            SELECT id, sandbox_id, owner_id, name, command, schedule, active
            FROM cron_jobs
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_cron_job(row),
            None => Err(StorageError::NotFound(format!("cron job {}", id))),
        }
    }

    pub async fn list_cron_jobs(&self, sandbox_id: i64) -> Result<Vec<CronJob>> {
        let rows = sqlx::query(
            r#"
            SELECT id, sandbox_id, owner_id, name, command, schedule, active
            FROM cron_jobs
            WHERE sandbox_id = ?1
            ORDER BY name
            "#,
        )
        .bind(sandbox_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_cron_job).collect()
    }

    pub async fn set_cron_job_active(&self, id: i64, active: bool) -> Result<()> {
        let result = sqlx::query("UPDATE cron_jobs SET active = ?1 WHERE id = ?2")
            .bind(active)
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("cron job {}", id)));
        }

        Ok(())
    }

    pub async fn delete_cron_job(&self, id: i64) -> Result<()> {
        let result = sqlx::query("DELETE FROM cron_jobs WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("cron job {}", id)));
        }

        Ok(())
    }

    // ========================================================================
    // ACTIVITY LOG
    // ========================================================================

    pub async fn log_activity(
        &self,
        account_id: i64,
        action: &str,
        details: Option<&str>,
    ) -> Result<()> {
        sqlx::query("INSERT INTO activity_logs (account_id, action, details) VALUES (?1, ?2, ?3)")
            .bind(account_id)
            .bind(action)
            .bind(details)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn list_activity(&self, account_id: i64, limit: i64) -> Result<Vec<ActivityEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, account_id, action, details, created_at
            FROM activity_logs
            WHERE account_id = ?1
            ORDER BY id DESC
            LIMIT ?2
            "#,
        )
        .bind(account_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<ActivityEntry> {
                Ok(ActivityEntry {
                    id: row.try_get("id")?,
                    account_id: row.try_get("account_id")?,
                    action: row.try_get("action")?,
                    details: row.try_get("details")?,
                    created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
                })
            })
            .collect()
    }

    // ========================================================================
    // RECONCILIATION TASKS
    // ========================================================================

    pub async fn record_reconciliation(
        &self,
        runtime_id: &str,
        sandbox_id: i64,
        operation: &str,
        error: &str,
    ) -> Result<i64> {
        let id: i64 = sqlx::query(
            r#"
            INSERT INTO reconciliation_tasks (runtime_id, sandbox_id, operation, last_error)
            VALUES (?1, ?2, ?3, ?4)
            RETURNING id
            "#,
        )
        .bind(runtime_id)
        .bind(sandbox_id)
        .bind(operation)
        .bind(error)
        .fetch_one(&self.pool)
        .await?
        .try_get(0)?;

        Ok(id)
    }

    pub async fn list_pending_reconciliations(&self) -> Result<Vec<ReconciliationTask>> {
        let rows = sqlx::query(
            r#"
            SELECT id, runtime_id, sandbox_id, operation, last_error, attempts, created_at
            FROM reconciliation_tasks
            WHERE resolved_at IS NULL
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<ReconciliationTask> {
                Ok(ReconciliationTask {
                    id: row.try_get("id")?,
                    runtime_id: row.try_get("runtime_id")?,
                    sandbox_id: row.try_get("sandbox_id")?,
                    operation: row.try_get("operation")?,
                    last_error: row.try_get("last_error")?,
                    attempts: row.try_get("attempts")?,
                    created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
                })
            })
            .collect()
    }

    pub async fn resolve_reconciliation(&self, id: i64) -> Result<()> {
        sqlx::query("UPDATE reconciliation_tasks SET resolved_at = ?1 WHERE id = ?2")
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn record_reconciliation_attempt(&self, id: i64, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE reconciliation_tasks SET attempts = attempts + 1, last_error = ?1 WHERE id = ?2",
        )
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

// ========================================================================
// HELPER FUNCTIONS
// ========================================================================

fn unique_violation(err: sqlx::Error, what: String) -> StorageError {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            StorageError::Conflict(what)
        }
        _ => StorageError::Database(err),
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidTimestamp(format!("{}: {}", value, e)))
}

fn row_to_account(row: SqliteRow) -> Result<Account> {
    Ok(Account {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        is_admin: row.try_get("is_admin")?,
        limits: Resources {
            cpu: row.try_get("cpu_limit")?,
            memory_mb: row.try_get("memory_limit_mb")?,
            disk_mb: row.try_get("disk_limit_mb")?,
        },
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
    })
}

fn row_to_sandbox(row: SqliteRow) -> Result<Sandbox> {
    Ok(Sandbox {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        owner_id: row.try_get("owner_id")?,
        runtime_name: row.try_get("runtime_name")?,
        runtime_id: row.try_get("runtime_id")?,
        template: row.try_get("template")?,
        status: SandboxStatus::from_str(&row.try_get::<String, _>("status")?)?,
        address: row.try_get("address")?,
        resources: Resources {
            cpu: row.try_get("cpu")?,
            memory_mb: row.try_get("memory_mb")?,
            disk_mb: row.try_get("disk_mb")?,
        },
        status_message: row.try_get("status_message")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        updated_at: parse_timestamp(&row.try_get::<String, _>("updated_at")?)?,
    })
}

fn row_to_service(row: SqliteRow) -> Result<Service> {
    Ok(Service {
        id: row.try_get("id")?,
        sandbox_id: row.try_get("sandbox_id")?,
        name: row.try_get("name")?,
        service_type: row.try_get("service_type")?,
        status: ServiceStatus::from_str(&row.try_get::<String, _>("status")?)?,
        auto_start: row.try_get("auto_start")?,
        port: row.try_get("port")?,
    })
}

fn row_to_site(row: SqliteRow) -> Result<Site> {
    Ok(Site {
        id: row.try_get("id")?,
        sandbox_id: row.try_get("sandbox_id")?,
        owner_id: row.try_get("owner_id")?,
        domain: row.try_get("domain")?,
        server_type: row.try_get("server_type")?,
        php_version: row.try_get("php_version")?,
        document_root: row.try_get("document_root")?,
        ssl_enabled: row.try_get("ssl_enabled")?,
        ssl_expires_at: row
            .try_get::<Option<String>, _>("ssl_expires_at")?
            .map(|s| parse_timestamp(&s))
            .transpose()?,
    })
}

fn row_to_database(row: SqliteRow) -> Result<DatabaseRecord> {
    Ok(DatabaseRecord {
        id: row.try_get("id")?,
        sandbox_id: row.try_get("sandbox_id")?,
        owner_id: row.try_get("owner_id")?,
        name: row.try_get("name")?,
        engine: row.try_get("engine")?,
        db_user: row.try_get("db_user")?,
        remote_access: row.try_get("remote_access")?,
    })
}

fn row_to_cron_job(row: SqliteRow) -> Result<CronJob> {
    Ok(CronJob {
        id: row.try_get("id")?,
        sandbox_id: row.try_get("sandbox_id")?,
        owner_id: row.try_get("owner_id")?,
        name: row.try_get("name")?,
        command: row.try_get("command")?,
        schedule: row.try_get("schedule")?,
        active: row.try_get("active")?,
    })
}

/// In-memory database with migrations applied, for tests across the crate
#[cfg(test)]
pub(crate) async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory database");
    MIGRATOR
        .run(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup() -> (SandboxStorage, Account) {
        let storage = SandboxStorage::new(test_pool().await);
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
        (storage, account)
    }

    fn new_sandbox(owner_id: i64, name: &str) -> NewSandbox {
        NewSandbox {
            name: name.to_string(),
            owner_id,
            runtime_name: format!("sbpanel-u{}-{}", owner_id, name),
            template: "nginx".to_string(),
            resources: Resources {
                cpu: 1,
                memory_mb: 512,
                disk_mb: 1024,
            },
        }
    }

    #[tokio::test]
    async fn test_insert_sandbox_starts_creating() {
        let (storage, account) = setup().await;

        let sandbox = storage
            .insert_sandbox(new_sandbox(account.id, "web1"))
            .await
            .unwrap();

        assert!(sandbox.id > 0);
        assert_eq!(sandbox.status, SandboxStatus::Creating);
        assert!(sandbox.runtime_id.is_none());
        assert!(sandbox.address.is_none());
    }

    #[tokio::test]
    async fn test_duplicate_name_per_owner_is_conflict() {
        let (storage, account) = setup().await;
        storage
            .insert_sandbox(new_sandbox(account.id, "web1"))
            .await
            .unwrap();

        let err = storage
            .insert_sandbox(new_sandbox(account.id, "web1"))
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_usage_sums_all_sandboxes() {
        let (storage, account) = setup().await;
        assert_eq!(
            storage.usage_for_owner(account.id).await.unwrap(),
            Resources::default()
        );

        storage
            .insert_sandbox(new_sandbox(account.id, "a"))
            .await
            .unwrap();
        storage
            .insert_sandbox(new_sandbox(account.id, "b"))
            .await
            .unwrap();

        let usage = storage.usage_for_owner(account.id).await.unwrap();
        assert_eq!(usage.cpu, 2);
        assert_eq!(usage.memory_mb, 1024);
        assert_eq!(usage.disk_mb, 2048);
    }

    #[tokio::test]
    async fn test_transition_is_compare_and_swap() {
        let (storage, account) = setup().await;
        let sandbox = storage
            .insert_sandbox(new_sandbox(account.id, "web1"))
            .await
            .unwrap();

        let to_error = Transition::new(SandboxStatus::Creating, SandboxStatus::ErrorProvisioning)
            .message("apt-get failed");
        assert!(storage.transition(sandbox.id, &to_error).await.unwrap());

        // Second attempt from the same expected status loses
        assert!(!storage.transition(sandbox.id, &to_error).await.unwrap());

        let stored = storage.get_sandbox(sandbox.id).await.unwrap();
        assert_eq!(stored.status, SandboxStatus::ErrorProvisioning);
        assert_eq!(stored.status_message.as_deref(), Some("apt-get failed"));
    }

    #[tokio::test]
    async fn test_transition_on_missing_record_is_not_found() {
        let (storage, _) = setup().await;

        let err = storage
            .transition(
                99,
                &Transition::new(SandboxStatus::Running, SandboxStatus::Stopped),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_transition_address_updates() {
        let (storage, account) = setup().await;
        let sandbox = storage
            .insert_sandbox(new_sandbox(account.id, "web1"))
            .await
            .unwrap();
        storage
            .attach_runtime(sandbox.id, "rt1", Some("172.17.0.2"))
            .await
            .unwrap();

        let stop = Transition::new(SandboxStatus::Creating, SandboxStatus::Stopped)
            .address(AddressUpdate::Clear);
        storage.transition(sandbox.id, &stop).await.unwrap();
        assert!(storage.get_sandbox(sandbox.id).await.unwrap().address.is_none());

        let start = Transition::new(SandboxStatus::Stopped, SandboxStatus::Running)
            .address(Some("172.17.0.9".to_string()));
        storage.transition(sandbox.id, &start).await.unwrap();
        assert_eq!(
            storage.get_sandbox(sandbox.id).await.unwrap().address.as_deref(),
            Some("172.17.0.9")
        );
    }

    #[tokio::test]
    async fn test_complete_provisioning_requires_creating_and_matching_runtime() {
        let (storage, account) = setup().await;
        let sandbox = storage
            .insert_sandbox(new_sandbox(account.id, "web1"))
            .await
            .unwrap();
        storage
            .attach_runtime(sandbox.id, "rt1", None)
            .await
            .unwrap();
        let services = vec![NewService {
            name: "nginx".to_string(),
            service_type: "web".to_string(),
            status: ServiceStatus::Running,
            port: Some(80),
        }];

        let wrong_runtime = storage
            .complete_provisioning(sandbox.id, "rt-other", Some("10.0.0.2"), &services)
            .await
            .unwrap();
        assert!(!wrong_runtime);
        assert!(storage.list_services(sandbox.id).await.unwrap().is_empty());

        let applied = storage
            .complete_provisioning(sandbox.id, "rt1", Some("10.0.0.2"), &services)
            .await
            .unwrap();
        assert!(applied);

        let stored = storage.get_sandbox(sandbox.id).await.unwrap();
        assert_eq!(stored.status, SandboxStatus::Running);
        assert_eq!(stored.address.as_deref(), Some("10.0.0.2"));
        assert_eq!(storage.list_services(sandbox.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_service_auto_start_and_bulk_stop() {
        let (storage, account) = setup().await;
        let sandbox = storage
            .insert_sandbox(new_sandbox(account.id, "web1"))
            .await
            .unwrap();
        storage.attach_runtime(sandbox.id, "rt1", None).await.unwrap();
        let services = ["nginx", "cron"].map(|name| NewService {
            name: name.to_string(),
            service_type: "web".to_string(),
            status: ServiceStatus::Running,
            port: None,
        });
        storage
            .complete_provisioning(sandbox.id, "rt1", None, &services)
            .await
            .unwrap();

        let nginx = storage.list_services(sandbox.id).await.unwrap()[0].clone();
        assert!(nginx.auto_start);
        storage.set_service_auto_start(nginx.id, false).await.unwrap();
        assert!(!storage.get_service(nginx.id).await.unwrap().auto_start);

        assert_eq!(storage.mark_services_stopped(sandbox.id).await.unwrap(), 2);
        assert_eq!(storage.mark_services_stopped(sandbox.id).await.unwrap(), 0);
        assert!(storage
            .list_services(sandbox.id)
            .await
            .unwrap()
            .iter()
            .all(|s| s.status == ServiceStatus::Stopped));

        assert!(matches!(
            storage.set_service_auto_start(999, true).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_sandbox_blocked_by_dependents() {
        let (storage, account) = setup().await;
        let sandbox = storage
            .insert_sandbox(new_sandbox(account.id, "web1"))
            .await
            .unwrap();
        let site = storage
            .create_site(NewSite {
                sandbox_id: sandbox.id,
                owner_id: account.id,
                domain: "example.com".to_string(),
                server_type: "nginx".to_string(),
                php_version: "7.4".to_string(),
                document_root: "/var/www/example.com".to_string(),
            })
            .await
            .unwrap();

        let err = storage.delete_sandbox(sandbox.id).await.unwrap_err();
        assert!(matches!(
            err,
            StorageError::HasDependents {
                sites: 1,
                databases: 0,
                ..
            }
        ));
        assert!(storage.get_sandbox(sandbox.id).await.is_ok());

        storage.delete_site(site.id).await.unwrap();
        let deleted = storage.delete_sandbox(sandbox.id).await.unwrap();
        assert_eq!(deleted.id, sandbox.id);
        assert!(matches!(
            storage.get_sandbox(sandbox.id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reconciliation_lifecycle() {
        let (storage, _) = setup().await;

        let id = storage
            .record_reconciliation("rt9", 4, "remove", "connection refused")
            .await
            .unwrap();
        storage
            .record_reconciliation_attempt(id, "still refused")
            .await
            .unwrap();

        let pending = storage.list_pending_reconciliations().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 2);
        assert_eq!(pending[0].last_error, "still refused");

        storage.resolve_reconciliation(id).await.unwrap();
        assert!(storage
            .list_pending_reconciliations()
            .await
            .unwrap()
            .is_empty());
    }
}
