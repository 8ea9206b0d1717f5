// ABOUTME: Account commands for creating hosting accounts, adjusting limits and showing quota use
// ABOUTME: Limits default to the system settings when not given

use super::utils;
use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use sbpanel_cli::Panel;
use sbpanel_sandbox::storage::{NewAccount, Resources};

const RECENT_ACTIVITY: i64 = 10;

#[derive(Subcommand)]
pub enum AccountCommands {
    /// Create an account
    Create {
        username: String,
        /// Grant administrator rights
        #[arg(long)]
        admin: bool,
        /// CPU core limit
        #[arg(long)]
        cpu: Option<i64>,
        /// Memory limit in MB
        #[arg(long)]
        memory_mb: Option<i64>,
        /// Disk limit in MB
        #[arg(long)]
        disk_mb: Option<i64>,
    },
    /// Change an account's resource limits (admin only)
    Limits {
        id: i64,
        /// CPU core limit
        #[arg(long)]
        cpu: Option<i64>,
        /// Memory limit in MB
        #[arg(long)]
        memory_mb: Option<i64>,
        /// Disk limit in MB
        #[arg(long)]
        disk_mb: Option<i64>,
    },
    /// Show an account with its usage and recent activity
    Show { id: i64 },
}

pub async fn handle(panel: &Panel, account: Option<i64>, command: AccountCommands) -> Result<()> {
    match command {
        AccountCommands::Create {
            username,
            admin,
            cpu,
            memory_mb,
            disk_mb,
        } => {
            let defaults = panel.settings.default_limits().await?;
            let limits = Resources {
                cpu: cpu.unwrap_or(defaults.cpu),
                memory_mb: memory_mb.unwrap_or(defaults.memory_mb),
                disk_mb: disk_mb.unwrap_or(defaults.disk_mb),
            };

            let account = panel
                .storage
                .create_account(NewAccount {
                    username: username.clone(),
                    is_admin: admin,
                    limits,
                })
                .await
                .with_context(|| format!("Failed to create account {}", username))?;

            utils::success(format!(
                "Created account {} (id {})",
                account.username.bold(),
                account.id
            ));
            Ok(())
        }
        AccountCommands::Limits {
            id,
            cpu,
            memory_mb,
            disk_mb,
        } => {
            let caller = panel.caller(account).await?;
            let current = panel
                .storage
                .get_account(id)
                .await
                .with_context(|| format!("Account {} not found", id))?
                .limits;
            let limits = Resources {
                cpu: cpu.unwrap_or(current.cpu),
                memory_mb: memory_mb.unwrap_or(current.memory_mb),
                disk_mb: disk_mb.unwrap_or(current.disk_mb),
            };

            let updated = panel.manager.set_account_limits(id, limits, caller).await?;
            utils::success(format!(
                "Limits for {}: {}",
                updated.username.bold(),
                utils::resources(&updated.limits)
            ));
            Ok(())
        }
        AccountCommands::Show { id } => show(panel, id).await,
    }
}

async fn show(panel: &Panel, id: i64) -> Result<()> {
    let account = panel
        .storage
        .get_account(id)
        .await
        .with_context(|| format!("Account {} not found", id))?;
    let usage = panel.storage.usage_for_owner(id).await?;

    println!("{}", format!("Account {}", account.username).blue().bold());
    println!("  ID:      {}", account.id);
    println!("  Admin:   {}", if account.is_admin { "yes" } else { "no" });
    println!("  Limits:  {}", utils::resources(&account.limits));
    println!("  Used:    {}", utils::resources(&usage));
    println!("  Created: {}", account.created_at.format("%Y-%m-%d %H:%M"));

    let activity = panel.storage.list_activity(id, RECENT_ACTIVITY).await?;
    if activity.is_empty() {
        return Ok(());
    }

    println!();
    let mut table = utils::table(vec!["When", "Action", "Details"]);
    for entry in &activity {
        table.add_row(vec![
            entry.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
            entry.action.clone(),
            utils::or_dash(entry.details.as_deref()),
        ]);
    }
    println!("{}", table);
    Ok(())
}
