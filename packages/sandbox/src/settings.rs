// ABOUTME: Panel-wide settings stored as key/value rows in SQLite
// ABOUTME: Exposes typed accessors for the ACME contact and default account limits

use crate::storage::{Resources, StorageError};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::{debug, warn};

pub const SSL_EMAIL: &str = "ssl_email";
pub const DEFAULT_CPU_LIMIT: &str = "default_cpu_limit";
pub const DEFAULT_MEMORY_LIMIT_MB: &str = "default_memory_limit_mb";
pub const DEFAULT_DISK_LIMIT_MB: &str = "default_disk_limit_mb";

const FALLBACK_LIMITS: Resources = Resources {
    cpu: 1,
    memory_mb: 1024,
    disk_mb: 10240,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemSetting {
    pub key: String,
    pub value: String,
    pub description: Option<String>,
    pub updated_at: String,
}

#[derive(Clone)]
pub struct SettingsManager {
    pool: SqlitePool,
}

impl SettingsManager {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<SystemSetting>, StorageError> {
        debug!(key = %key, "Fetching setting");

        let row = sqlx::query(
            "SELECT key, value, description, updated_at FROM system_settings WHERE key = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| -> Result<SystemSetting, StorageError> {
            Ok(SystemSetting {
                key: row.try_get("key")?,
                value: row.try_get("value")?,
                description: row.try_get("description")?,
                updated_at: row.try_get("updated_at")?,
            })
        })
        .transpose()
    }

    pub async fn list(&self) -> Result<Vec<SystemSetting>, StorageError> {
        let rows = sqlx::query(
            "SELECT key, value, description, updated_at FROM system_settings ORDER BY key",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<SystemSetting, StorageError> {
                Ok(SystemSetting {
                    key: row.try_get("key")?,
                    value: row.try_get("value")?,
                    description: row.try_get("description")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    /// Insert or overwrite a setting
    pub async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        debug!(key = %key, "Writing setting");

        sqlx::query(
            r#"
            INSERT INTO system_settings (key, value, updated_at)
            VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
            ON CONFLICT (key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Update a setting with optimistic locking
    ///
    /// The write only applies if the row still carries the `updated_at` the
    /// caller loaded; otherwise someone else changed it first.
    pub async fn update(&self, setting: &SystemSetting) -> Result<(), StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE system_settings
            SET value = ?1, updated_at = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
            WHERE key = ?2 AND updated_at = ?3
            "#,
        )
        .bind(&setting.value)
        .bind(&setting.key)
        .bind(&setting.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!(
                "setting {} was modified concurrently",
                setting.key
            )));
        }

        Ok(())
    }

    /// Validate and store an operator change to one of the known settings
    ///
    /// Existing rows go through the optimistic `update`, so a concurrent change
    /// surfaces as a conflict instead of being overwritten.
    pub async fn change(&self, key: &str, value: &str) -> Result<SystemSetting, StorageError> {
        let value = value.trim();
        validate_setting(key, value)?;

        match self.get(key).await? {
            Some(mut setting) => {
                setting.value = value.to_string();
                self.update(&setting).await?;
            }
            None => self.set(key, value).await?,
        }

        self.get(key)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("setting {}", key)))
    }

    /// Contact e-mail for certificate requests, if one is configured
    pub async fn ssl_email(&self) -> Result<Option<String>, StorageError> {
        Ok(self
            .get(SSL_EMAIL)
            .await?
            .map(|s| s.value.trim().to_string())
            .filter(|v| !v.is_empty()))
    }

    /// Limits granted to newly created accounts
    pub async fn default_limits(&self) -> Result<Resources, StorageError> {
        Ok(Resources {
            cpu: self.int_or(DEFAULT_CPU_LIMIT, FALLBACK_LIMITS.cpu).await?,
            memory_mb: self
                .int_or(DEFAULT_MEMORY_LIMIT_MB, FALLBACK_LIMITS.memory_mb)
                .await?,
            disk_mb: self
                .int_or(DEFAULT_DISK_LIMIT_MB, FALLBACK_LIMITS.disk_mb)
                .await?,
        })
    }

    async fn int_or(&self, key: &str, fallback: i64) -> Result<i64, StorageError> {
        let Some(setting) = self.get(key).await? else {
            return Ok(fallback);
        };

        match setting.value.trim().parse::<i64>() {
            Ok(value) if value > 0 => Ok(value),
            _ => {
                warn!(key = %key, value = %setting.value, "Ignoring invalid numeric setting");
                Ok(fallback)
            }
        }
    }
}

/// Check a value against the rules of a known setting key
pub fn validate_setting(key: &str, value: &str) -> Result<(), StorageError> {
    match key {
        SSL_EMAIL => {
            // Empty clears the contact; certbot then registers without e-mail
            if value.is_empty() || is_plausible_email(value) {
                Ok(())
            } else {
                Err(StorageError::Validation(format!(
                    "{} must be an e-mail address, got '{}'",
                    key, value
                )))
            }
        }
        DEFAULT_CPU_LIMIT | DEFAULT_MEMORY_LIMIT_MB | DEFAULT_DISK_LIMIT_MB => {
            match value.parse::<i64>() {
                Ok(number) if number > 0 => Ok(()),
                _ => Err(StorageError::Validation(format!(
                    "{} must be a positive whole number, got '{}'",
                    key, value
                ))),
            }
        }
        _ => Err(StorageError::Validation(format!("Unknown setting: {}", key))),
    }
}

fn is_plausible_email(value: &str) -> bool {
    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !value.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_pool;
    use rstest::rstest;

    #[tokio::test]
    async fn test_seeded_defaults() {
        let settings = SettingsManager::new(test_pool().await);

        assert_eq!(settings.ssl_email().await.unwrap(), None);
        assert_eq!(settings.default_limits().await.unwrap(), FALLBACK_LIMITS);
        assert_eq!(settings.list().await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_set_and_read_back() {
        let settings = SettingsManager::new(test_pool().await);

        settings.set(SSL_EMAIL, "ops@example.com").await.unwrap();
        settings.set(DEFAULT_CPU_LIMIT, "4").await.unwrap();

        assert_eq!(
            settings.ssl_email().await.unwrap().as_deref(),
            Some("ops@example.com")
        );
        assert_eq!(settings.default_limits().await.unwrap().cpu, 4);
    }

    #[tokio::test]
    async fn test_invalid_number_falls_back() {
        let settings = SettingsManager::new(test_pool().await);
        settings.set(DEFAULT_MEMORY_LIMIT_MB, "lots").await.unwrap();

        assert_eq!(
            settings.default_limits().await.unwrap().memory_mb,
            FALLBACK_LIMITS.memory_mb
        );
    }

    #[tokio::test]
    async fn test_change_validates_and_persists() {
        let settings = SettingsManager::new(test_pool().await);

        let changed = settings.change(DEFAULT_DISK_LIMIT_MB, " 20480 ").await.unwrap();
        assert_eq!(changed.value, "20480");
        assert_eq!(settings.default_limits().await.unwrap().disk_mb, 20480);

        settings.change(SSL_EMAIL, "ops@example.com").await.unwrap();
        assert_eq!(
            settings.ssl_email().await.unwrap().as_deref(),
            Some("ops@example.com")
        );
        settings.change(SSL_EMAIL, "").await.unwrap();
        assert_eq!(settings.ssl_email().await.unwrap(), None);
    }

    #[rstest]
    #[case(DEFAULT_CPU_LIMIT, "0")]
    #[case(DEFAULT_CPU_LIMIT, "-2")]
    #[case(DEFAULT_MEMORY_LIMIT_MB, "lots")]
    #[case(SSL_EMAIL, "not-an-email")]
    #[case(SSL_EMAIL, "ops@localhost")]
    #[case("theme", "dark")]
    fn test_validate_setting_rejects(#[case] key: &str, #[case] value: &str) {
        assert!(matches!(
            validate_setting(key, value),
            Err(StorageError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_change_rejects_invalid_value_without_writing() {
        let settings = SettingsManager::new(test_pool().await);

        let err = settings.change(DEFAULT_CPU_LIMIT, "zero").await.unwrap_err();

        assert!(matches!(err, StorageError::Validation(_)));
        assert_eq!(settings.default_limits().await.unwrap(), FALLBACK_LIMITS);
    }

    #[tokio::test]
    async fn test_optimistic_update_detects_concurrent_write() {
        let settings = SettingsManager::new(test_pool().await);
        let mut loaded = settings.get(SSL_EMAIL).await.unwrap().unwrap();

        settings.set(SSL_EMAIL, "first@example.com").await.unwrap();

        loaded.value = "second@example.com".to_string();
        let err = settings.update(&loaded).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }
}
