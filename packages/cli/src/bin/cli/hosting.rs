// ABOUTME: Website, database and cron job commands for a running sandbox
// ABOUTME: Database passwords are printed once at creation and never again

use super::utils;
use anyhow::Result;
use clap::Subcommand;
use colored::*;
use sbpanel_cli::Panel;
use sbpanel_sandbox::resources::DatabaseEngine;
use sbpanel_sandbox::{
    CreateCronJobRequest, CreateDatabaseRequest, CreateSiteRequest, WebServer,
};

fn parse_server(value: &str) -> Result<WebServer, String> {
    value.parse()
}

fn parse_engine(value: &str) -> Result<DatabaseEngine, String> {
    value.parse().map_err(|e: sbpanel_sandbox::resources::ResourceError| e.to_string())
}

#[derive(Subcommand)]
pub enum SiteCommands {
    /// Create a website in a sandbox
    Create {
        sandbox_id: i64,
        domain: String,
        /// nginx or apache; defaults to the sandbox template's server
        #[arg(long, value_parser = parse_server)]
        server: Option<WebServer>,
        /// Serve PHP through this FPM version
        #[arg(long)]
        php: Option<String>,
    },
    /// List websites in a sandbox
    List { sandbox_id: i64 },
    Delete { id: i64 },
    /// Request a Let's Encrypt certificate and enable HTTPS
    Certificate { id: i64 },
}

#[derive(Subcommand)]
pub enum DatabaseCommands {
    Create {
        sandbox_id: i64,
        name: String,
        #[arg(long, default_value = "mysql", value_parser = parse_engine)]
        engine: DatabaseEngine,
        /// Database user; defaults to the database name
        #[arg(long)]
        user: Option<String>,
        /// Allow connections from outside the sandbox
        #[arg(long)]
        remote: bool,
    },
    List { sandbox_id: i64 },
    Delete { id: i64 },
}

#[derive(Subcommand)]
pub enum CronCommands {
    Create {
        sandbox_id: i64,
        name: String,
        /// Five-field schedule, e.g. "0 3 * * *"
        schedule: String,
        command: String,
    },
    List { sandbox_id: i64 },
    Enable { id: i64 },
    Disable { id: i64 },
    Delete { id: i64 },
}

pub async fn handle_site(panel: &Panel, account: Option<i64>, command: SiteCommands) -> Result<()> {
    let caller = panel.caller(account).await?;

    match command {
        SiteCommands::Create {
            sandbox_id,
            domain,
            server,
            php,
        } => {
            let site = panel
                .hosting
                .create_site(
                    caller,
                    sandbox_id,
                    CreateSiteRequest {
                        domain,
                        server,
                        php_version: php,
                    },
                )
                .await?;
            utils::success(format!(
                "Created {} (id {}) serving {}",
                site.domain.bold(),
                site.id,
                site.document_root
            ));
        }
        SiteCommands::List { sandbox_id } => {
            panel.manager.get_sandbox_status(sandbox_id, caller).await?;
            let sites = panel.storage.list_sites(sandbox_id).await?;
            let mut table = utils::table(vec!["ID", "Domain", "Server", "PHP", "HTTPS", "Expires"]);
            for site in &sites {
                table.add_row(vec![
                    site.id.to_string(),
                    site.domain.clone(),
                    site.server_type.clone(),
                    utils::or_dash(Some(site.php_version.as_str()).filter(|v| !v.is_empty())),
                    if site.ssl_enabled { "yes" } else { "no" }.to_string(),
                    site.ssl_expires_at
                        .map(|at| at.format("%Y-%m-%d").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                ]);
            }
            println!("{}", table);
        }
        SiteCommands::Delete { id } => {
            panel.hosting.delete_site(caller, id).await?;
            utils::success(format!("Deleted site {}", id));
        }
        SiteCommands::Certificate { id } => {
            let site = panel.hosting.request_certificate(caller, id).await?;
            utils::success(format!(
                "HTTPS enabled for {}, certificate valid until {}",
                site.domain.bold(),
                site.ssl_expires_at
                    .map(|at| at.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "-".to_string())
            ));
        }
    }
    Ok(())
}

pub async fn handle_database(
    panel: &Panel,
    account: Option<i64>,
    command: DatabaseCommands,
) -> Result<()> {
    let caller = panel.caller(account).await?;

    match command {
        DatabaseCommands::Create {
            sandbox_id,
            name,
            engine,
            user,
            remote,
        } => {
            let created = panel
                .hosting
                .create_database(
                    caller,
                    sandbox_id,
                    CreateDatabaseRequest {
                        name,
                        engine,
                        user,
                        remote_access: remote,
                    },
                )
                .await?;
            utils::success(format!(
                "Created {} database {} (id {})",
                created.database.engine,
                created.database.name.bold(),
                created.database.id
            ));
            println!("  User:     {}", created.database.db_user);
            println!("  Password: {}", created.password.yellow());
            println!("{}", "The password is not stored and will not be shown again.".dimmed());
        }
        DatabaseCommands::List { sandbox_id } => {
            panel.manager.get_sandbox_status(sandbox_id, caller).await?;
            let databases = panel.storage.list_databases(sandbox_id).await?;
            let mut table = utils::table(vec!["ID", "Name", "Engine", "User", "Remote"]);
            for database in &databases {
                table.add_row(vec![
                    database.id.to_string(),
                    database.name.clone(),
                    database.engine.clone(),
                    database.db_user.clone(),
                    if database.remote_access { "yes" } else { "no" }.to_string(),
                ]);
            }
            println!("{}", table);
        }
        DatabaseCommands::Delete { id } => {
            panel.hosting.delete_database(caller, id).await?;
            utils::success(format!("Deleted database {}", id));
        }
    }
    Ok(())
}

pub async fn handle_cron(panel: &Panel, account: Option<i64>, command: CronCommands) -> Result<()> {
    let caller = panel.caller(account).await?;

    match command {
        CronCommands::Create {
            sandbox_id,
            name,
            schedule,
            command,
        } => {
            let job = panel
                .hosting
                .create_cron_job(
                    caller,
                    sandbox_id,
                    CreateCronJobRequest {
                        name,
                        command,
                        schedule,
                    },
                )
                .await?;
            utils::success(format!("Scheduled {} (id {})", job.name.bold(), job.id));
        }
        CronCommands::List { sandbox_id } => {
            panel.manager.get_sandbox_status(sandbox_id, caller).await?;
            let jobs = panel.storage.list_cron_jobs(sandbox_id).await?;
            let mut table = utils::table(vec!["ID", "Name", "Schedule", "Command", "Active"]);
            for job in &jobs {
                table.add_row(vec![
                    job.id.to_string(),
                    job.name.clone(),
                    job.schedule.clone(),
                    job.command.clone(),
                    if job.active { "yes" } else { "no" }.to_string(),
                ]);
            }
            println!("{}", table);
        }
        CronCommands::Enable { id } => {
            let job = panel.hosting.toggle_cron_job(caller, id, true).await?;
            utils::success(format!("Enabled {}", job.name.bold()));
        }
        CronCommands::Disable { id } => {
            let job = panel.hosting.toggle_cron_job(caller, id, false).await?;
            utils::success(format!("Disabled {}", job.name.bold()));
        }
        CronCommands::Delete { id } => {
            panel.hosting.delete_cron_job(caller, id).await?;
            utils::success(format!("Deleted cron job {}", id));
        }
    }
    Ok(())
}
