// ABOUTME: Scheduled job management through files in /etc/cron.d
// ABOUTME: One file per job, toggled by commenting the marked line

use super::{ResourceError, Result};
use crate::executor::{CommandExecutor, ExecOptions};
use crate::files::{FileError, FileManager};
use crate::templates::CRON_SERVICE;
use tracing::{info, warn};

pub const CRON_DIR: &str = "/etc/cron.d";
const FILE_PREFIX: &str = "sbpanel-";
const MARKER: &str = "# SBPanel Job:";

pub fn safe_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

pub fn cron_path(name: &str) -> String {
    format!("{}/{}{}", CRON_DIR, FILE_PREFIX, safe_name(name))
}

/// A schedule has exactly five fields of digits, names and `*/,-`
pub fn validate_schedule(schedule: &str) -> Result<()> {
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(ResourceError::invalid(
            "schedule",
            format!("expected 5 fields, found {}", fields.len()),
        ));
    }

    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '*' | '/' | ',' | '-');
    if let Some(field) = fields.iter().find(|f| !f.chars().all(allowed)) {
        return Err(ResourceError::invalid(
            "schedule",
            format!("invalid field '{}'", field),
        ));
    }

    Ok(())
}

pub fn cron_line(name: &str, command: &str, schedule: &str) -> String {
    format!(
        "{} root {} {} {}\n",
        schedule.split_whitespace().collect::<Vec<_>>().join(" "),
        command,
        MARKER,
        name
    )
}

/// Comment or uncomment the job's marked line; `None` when nothing changes
pub fn toggle_lines(content: &str, name: &str, active: bool) -> Option<String> {
    let marker = format!("{} {}", MARKER, name);
    let mut changed = false;

    let lines: Vec<String> = content
        .lines()
        .map(|line| {
            if !line.contains(&marker) {
                return line.to_string();
            }
            let trimmed = line.trim_start();
            match (active, trimmed.starts_with('#')) {
                (true, true) => {
                    changed = true;
                    trimmed.trim_start_matches('#').trim_start().to_string()
                }
                (false, false) => {
                    changed = true;
                    format!("#{}", line)
                }
                _ => line.to_string(),
            }
        })
        .collect();

    changed.then(|| lines.join("\n") + "\n")
}

#[derive(Clone)]
pub struct CronProvisioner {
    executor: CommandExecutor,
    files: FileManager,
}

impl CronProvisioner {
    pub fn new(executor: CommandExecutor) -> Self {
        Self {
            files: FileManager::new(executor.clone()),
            executor,
        }
    }

    pub async fn create(
        &self,
        runtime_id: &str,
        name: &str,
        command: &str,
        schedule: &str,
    ) -> Result<String> {
        if name.trim().is_empty() || name.contains('\n') {
            return Err(ResourceError::invalid("name", "must be a single non-empty line"));
        }
        if command.trim().is_empty() || command.contains('\n') {
            return Err(ResourceError::invalid("command", "must be a single non-empty line"));
        }
        validate_schedule(schedule)?;

        let path = cron_path(name);
        self.files
            .write_file(runtime_id, &path, cron_line(name, command, schedule).as_bytes())
            .await?;
        self.executor
            .run(runtime_id, &["chmod", "0644", path.as_str()])
            .await?;
        self.executor
            .run(runtime_id, &["chown", "root:root", path.as_str()])
            .await?;
        self.executor
            .restart_service(runtime_id, CRON_SERVICE.name)
            .await;

        info!(runtime_id = %runtime_id, job = %name, path = %path, "Cron job installed");
        Ok(path)
    }

    /// Enable or disable a job, returning whether its file changed
    pub async fn toggle(&self, runtime_id: &str, name: &str, active: bool) -> Result<bool> {
        let path = cron_path(name);
        let content = match self.files.read_file(runtime_id, &path).await {
            Ok(content) => content,
            Err(FileError::NotFound(_)) if !active => {
                info!(runtime_id = %runtime_id, job = %name, "Cron file missing, job already inactive");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let Some(updated) = toggle_lines(&content, name, active) else {
            if !content.contains(&format!("{} {}", MARKER, name)) {
                warn!(runtime_id = %runtime_id, job = %name, path = %path, "Cron job marker not found");
            }
            return Ok(false);
        };

        self.files
            .write_file(runtime_id, &path, updated.as_bytes())
            .await?;
        self.executor
            .restart_service(runtime_id, CRON_SERVICE.name)
            .await;
        info!(runtime_id = %runtime_id, job = %name, active, "Cron job toggled");
        Ok(true)
    }

    pub async fn delete(&self, runtime_id: &str, name: &str) -> Result<()> {
        let path = cron_path(name);
        self.executor
            .exec(runtime_id, &["rm", "-f", path.as_str()], ExecOptions::lenient())
            .await?;
        self.executor
            .restart_service(runtime_id, CRON_SERVICE.name)
            .await;
        info!(runtime_id = %runtime_id, job = %name, "Cron job removed");
        Ok(())
    }
}
