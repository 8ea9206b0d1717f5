// ABOUTME: Sandbox lifecycle commands: create, inspect, start, stop, restart, delete and retry
// ABOUTME: Also hosts the admin reconcile command

use super::utils;
use anyhow::{bail, Result};
use clap::Subcommand;
use colored::*;
use sbpanel_cli::Panel;
use sbpanel_sandbox::storage::{Resources, Sandbox};
use sbpanel_sandbox::{CreateSandboxRequest, SandboxStatus, SandboxView};

fn parse_status(value: &str) -> Result<SandboxStatus, String> {
    SandboxStatus::from_str(value).map_err(|e| e.to_string())
}

#[derive(Subcommand)]
pub enum SandboxCommands {
    /// Create a sandbox and queue its provisioning
    Create {
        name: String,
        /// Software template: nginx, apache or mixed
        #[arg(long, default_value = "nginx")]
        template: String,
        #[arg(long, default_value = "1")]
        cpu: i64,
        #[arg(long, default_value = "512")]
        memory_mb: i64,
        #[arg(long, default_value = "5120")]
        disk_mb: i64,
        /// Create on behalf of another account (admin only)
        #[arg(long)]
        owner: Option<i64>,
        /// Wait for provisioning and report the final status
        #[arg(long)]
        wait: bool,
    },
    /// List sandboxes visible to the caller
    List {
        #[arg(long, value_parser = parse_status)]
        status: Option<SandboxStatus>,
    },
    /// Show a sandbox with its live runtime state and services
    Status { id: i64 },
    Start { id: i64 },
    Stop { id: i64 },
    Restart { id: i64 },
    /// Delete a sandbox and its runtime instance
    Delete { id: i64 },
    /// Retry provisioning of a sandbox in error_provisioning
    Retry {
        id: i64,
        #[arg(long)]
        wait: bool,
    },
}

pub async fn handle(panel: &Panel, account: Option<i64>, command: SandboxCommands) -> Result<()> {
    let caller = panel.caller(account).await?;

    match command {
        SandboxCommands::Create {
            name,
            template,
            cpu,
            memory_mb,
            disk_mb,
            owner,
            wait,
        } => {
            let owner_id = match owner {
                Some(owner) if owner != caller.account_id && !caller.is_admin => {
                    bail!("Only administrators can create sandboxes for other accounts")
                }
                Some(owner) => owner,
                None => caller.account_id,
            };

            let sandbox = panel
                .manager
                .create_sandbox(CreateSandboxRequest {
                    name,
                    template,
                    owner_id,
                    resources: Resources {
                        cpu,
                        memory_mb,
                        disk_mb,
                    },
                })
                .await?;
            utils::success(format!(
                "Created sandbox {} (id {}), provisioning queued",
                sandbox.name.bold(),
                sandbox.id
            ));

            if wait {
                await_provisioning(panel, sandbox.id, caller).await?;
            }
            Ok(())
        }
        SandboxCommands::List { status } => {
            let sandboxes = panel.manager.list_sandboxes(caller, status).await?;
            print_list(&sandboxes);
            Ok(())
        }
        SandboxCommands::Status { id } => {
            let view = panel.manager.get_sandbox_status(id, caller).await?;
            print_view(panel, &view).await
        }
        SandboxCommands::Start { id } => {
            let sandbox = panel.manager.start_sandbox(id, caller).await?;
            utils::success(format!("Started {}", sandbox.name.bold()));
            Ok(())
        }
        SandboxCommands::Stop { id } => {
            let sandbox = panel.manager.stop_sandbox(id, caller).await?;
            utils::success(format!("Stopped {}", sandbox.name.bold()));
            Ok(())
        }
        SandboxCommands::Restart { id } => {
            let sandbox = panel.manager.restart_sandbox(id, caller).await?;
            utils::success(format!("Restarted {}", sandbox.name.bold()));
            Ok(())
        }
        SandboxCommands::Delete { id } => {
            let report = panel.manager.delete_sandbox(id, caller).await?;
            utils::success(format!("Deleted sandbox {}", report.sandbox_id));
            if let Some(task) = report.reconciliation_task {
                println!(
                    "{} Runtime instance {} could not be removed, queued as reconciliation task {}",
                    "!".yellow().bold(),
                    utils::or_dash(report.runtime_id.as_deref()),
                    task
                );
            }
            Ok(())
        }
        SandboxCommands::Retry { id, wait } => {
            let sandbox = panel.manager.retry_provisioning(id, caller).await?;
            utils::success(format!("Provisioning of {} queued again", sandbox.name.bold()));
            if wait {
                await_provisioning(panel, id, caller).await?;
            }
            Ok(())
        }
    }
}

pub async fn reconcile(panel: &Panel, account: Option<i64>) -> Result<()> {
    let caller = panel.caller(account).await?;
    let report = panel.manager.reconcile(caller).await?;

    println!("{}", "Reconciliation".blue().bold());
    println!("  Cleanup tasks resolved: {}", report.tasks_resolved);
    println!("  Cleanup tasks pending:  {}", report.tasks_pending);
    println!("  Orphans removed:        {}", report.orphans_removed.len());
    for runtime_id in &report.orphans_removed {
        println!("    {}", runtime_id);
    }
    if !report.orphan_failures.is_empty() {
        println!(
            "  {} {}",
            "Orphans left behind:".red(),
            report.orphan_failures.join(", ")
        );
    }
    Ok(())
}

async fn await_provisioning(
    panel: &Panel,
    id: i64,
    caller: sbpanel_sandbox::Caller,
) -> Result<()> {
    println!("{}", "Waiting for provisioning...".dimmed());
    panel.manager.wait_for_provisioning().await;

    let view = panel.manager.get_sandbox_status(id, caller).await?;
    let sandbox = &view.sandbox;
    match sandbox.status {
        SandboxStatus::Running => {
            utils::success(format!(
                "{} is running at {}",
                sandbox.name.bold(),
                utils::or_dash(sandbox.address.as_deref())
            ));
            Ok(())
        }
        status => bail!(
            "Sandbox {} ended in {}: {}",
            sandbox.name,
            status,
            utils::or_dash(sandbox.status_message.as_deref())
        ),
    }
}

fn print_list(sandboxes: &[Sandbox]) {
    if sandboxes.is_empty() {
        println!("{}", "No sandboxes found".yellow());
        return;
    }

    let mut table = utils::table(vec![
        "ID", "Name", "Owner", "Template", "Status", "Address", "Resources",
    ]);
    for sandbox in sandboxes {
        table.add_row(vec![
            sandbox.id.to_string(),
            sandbox.name.clone(),
            sandbox.owner_id.to_string(),
            sandbox.template.clone(),
            utils::status(sandbox.status).to_string(),
            utils::or_dash(sandbox.address.as_deref()),
            utils::resources(&sandbox.resources),
        ]);
    }
    println!("{}", table);
    println!("Total: {} sandboxes", sandboxes.len().to_string().cyan());
}

async fn print_view(panel: &Panel, view: &SandboxView) -> Result<()> {
    let sandbox = &view.sandbox;
    println!("{}", format!("Sandbox {}", sandbox.name).blue().bold());
    println!("  ID:         {}", sandbox.id);
    println!("  Owner:      {}", sandbox.owner_id);
    println!("  Template:   {}", sandbox.template);
    println!("  Status:     {}", utils::status(sandbox.status));
    println!(
        "  Live state: {}",
        view.live_state.map(|s| s.as_str()).unwrap_or("missing")
    );
    if view.drift {
        println!(
            "  {}",
            "Record says running but the runtime disagrees".yellow()
        );
    }
    println!("  Address:    {}", utils::or_dash(sandbox.address.as_deref()));
    println!("  Runtime:    {}", utils::or_dash(sandbox.runtime_id.as_deref()));
    println!("  Resources:  {}", utils::resources(&sandbox.resources));
    if let Some(message) = &sandbox.status_message {
        println!("  Message:    {}", message.red());
    }

    let services = panel.storage.list_services(sandbox.id).await?;
    if services.is_empty() {
        return Ok(());
    }

    println!();
    let mut table = utils::table(vec!["ID", "Service", "Type", "Status", "Auto-start", "Port"]);
    for service in &services {
        table.add_row(vec![
            service.id.to_string(),
            service.name.clone(),
            service.service_type.clone(),
            service.status.as_str().to_string(),
            if service.auto_start { "yes" } else { "no" }.to_string(),
            service
                .port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
        ]);
    }
    println!("{}", table);
    Ok(())
}
