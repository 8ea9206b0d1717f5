// ABOUTME: MySQL and MariaDB provisioning inside a sandbox
// ABOUTME: Creates databases and users with generated passwords and toggles remote access

use super::{ResourceError, Result};
use crate::executor::CommandExecutor;
use crate::files::FileManager;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

const PASSWORD_LENGTH: usize = 16;
const MAX_IDENTIFIER_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseEngine {
    Mysql,
    Mariadb,
}

impl DatabaseEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Mariadb => "mariadb",
        }
    }

    pub fn package(&self) -> &'static str {
        match self {
            Self::Mysql => "mysql-server",
            Self::Mariadb => "mariadb-server",
        }
    }

    pub fn service(&self) -> &'static str {
        match self {
            Self::Mysql => "mysql",
            Self::Mariadb => "mariadb",
        }
    }

    /// Server config file holding `bind-address`
    pub fn config_path(&self) -> &'static str {
        match self {
            Self::Mysql => "/etc/mysql/mysql.conf.d/mysqld.cnf",
            Self::Mariadb => "/etc/mysql/mariadb.conf.d/50-server.cnf",
        }
    }
}

impl fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DatabaseEngine {
    type Err = ResourceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mysql" => Ok(Self::Mysql),
            "mariadb" => Ok(Self::Mariadb),
            other => Err(ResourceError::invalid(
                "engine",
                format!("unsupported database engine '{}'", other),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSpec {
    pub name: String,
    pub engine: DatabaseEngine,
    pub user: String,
    pub remote_access: bool,
}

/// 16 random alphanumerics, safe to embed in a quoted SQL literal
pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

pub fn validate_identifier(field: &'static str, value: &str) -> Result<()> {
    if value.is_empty() || value.len() > MAX_IDENTIFIER_LEN {
        return Err(ResourceError::invalid(
            field,
            format!("must be 1 to {} characters", MAX_IDENTIFIER_LEN),
        ));
    }
    if !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ResourceError::invalid(
            field,
            "may only contain letters, digits and '_'",
        ));
    }
    Ok(())
}

fn create_sql(spec: &DatabaseSpec, password: &str) -> String {
    let DatabaseSpec { name, user, .. } = spec;
    let mut sql = format!(
        "CREATE DATABASE IF NOT EXISTS `{name}`; \
         CREATE USER '{user}'@'localhost' IDENTIFIED BY '{password}'; \
         GRANT ALL PRIVILEGES ON `{name}`.* TO '{user}'@'localhost';"
    );
    if spec.remote_access {
        sql.push_str(&format!(
            " CREATE USER '{user}'@'%' IDENTIFIED BY '{password}'; \
             GRANT ALL PRIVILEGES ON `{name}`.* TO '{user}'@'%';"
        ));
    }
    sql.push_str(" FLUSH PRIVILEGES;");
    sql
}

fn drop_sql(name: &str, user: &str) -> String {
    format!(
        "DROP DATABASE IF EXISTS `{name}`; \
         DROP USER IF EXISTS '{user}'@'localhost'; \
         DROP USER IF EXISTS '{user}'@'%'; \
         FLUSH PRIVILEGES;"
    )
}

/// Point every `bind-address` directive at all interfaces
pub fn open_bind_address(config: &str) -> Option<String> {
    let mut changed = false;
    let lines: Vec<String> = config
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.starts_with("bind-address") && !trimmed.ends_with("0.0.0.0") {
                changed = true;
                "bind-address            = 0.0.0.0".to_string()
            } else {
                line.to_string()
            }
        })
        .collect();

    changed.then(|| lines.join("\n") + "\n")
}

#[derive(Clone)]
pub struct DatabaseProvisioner {
    executor: CommandExecutor,
    files: FileManager,
}

impl DatabaseProvisioner {
    pub fn new(executor: CommandExecutor) -> Self {
        Self {
            files: FileManager::new(executor.clone()),
            executor,
        }
    }

    /// Create the database and its user, returning the generated password
    ///
    /// The password is handed back exactly once; nothing stores it.
    pub async fn create(&self, runtime_id: &str, spec: &DatabaseSpec) -> Result<String> {
        validate_identifier("database name", &spec.name)?;
        validate_identifier("database user", &spec.user)?;

        self.ensure_server(runtime_id, spec.engine).await?;

        let password = generate_password();
        self.executor
            .run(runtime_id, &["mysql", "-e", create_sql(spec, &password).as_str()])
            .await?;

        if spec.remote_access {
            self.configure_remote_access(runtime_id, spec.engine).await?;
        }

        info!(
            runtime_id = %runtime_id,
            database = %spec.name,
            engine = %spec.engine,
            remote_access = spec.remote_access,
            "Database created"
        );
        Ok(password)
    }

    pub async fn delete(
        &self,
        runtime_id: &str,
        name: &str,
        engine: DatabaseEngine,
        user: &str,
    ) -> Result<()> {
        validate_identifier("database name", name)?;
        validate_identifier("database user", user)?;

        self.executor.start_service(runtime_id, engine.service()).await;
        self.executor
            .run(runtime_id, &["mysql", "-e", drop_sql(name, user).as_str()])
            .await?;

        info!(runtime_id = %runtime_id, database = %name, "Database dropped");
        Ok(())
    }

    async fn ensure_server(&self, runtime_id: &str, engine: DatabaseEngine) -> Result<()> {
        self.executor
            .ensure_packages(runtime_id, &[engine.package()])
            .await?;
        if !self
            .executor
            .start_service(runtime_id, engine.service())
            .await
            .applied()
        {
            warn!(runtime_id = %runtime_id, engine = %engine, "Database server may not be running");
        }
        Ok(())
    }

    async fn configure_remote_access(&self, runtime_id: &str, engine: DatabaseEngine) -> Result<()> {
        let config = self.files.read_file(runtime_id, engine.config_path()).await?;

        match open_bind_address(&config) {
            Some(updated) => {
                self.files
                    .write_file(runtime_id, engine.config_path(), updated.as_bytes())
                    .await?;
                self.executor
                    .restart_service(runtime_id, engine.service())
                    .await;
            }
            None => info!(runtime_id = %runtime_id, engine = %engine, "Remote access already enabled"),
        }
        Ok(())
    }
}
