// ABOUTME: Service commands controlling one service in a sandbox and its auto-start flag
// ABOUTME: The recorded status follows the outcome of the init system call

use super::utils;
use anyhow::Result;
use clap::Subcommand;
use colored::*;
use sbpanel_cli::Panel;
use sbpanel_sandbox::ServiceAction;

#[derive(Subcommand)]
pub enum ServiceCommands {
    Start { id: i64 },
    Stop { id: i64 },
    Restart { id: i64 },
    /// Toggle whether the service starts when its sandbox boots
    Autostart { id: i64 },
}

pub async fn handle(panel: &Panel, account: Option<i64>, command: ServiceCommands) -> Result<()> {
    let caller = panel.caller(account).await?;
    let (id, action) = match command {
        ServiceCommands::Start { id } => (id, ServiceAction::Start),
        ServiceCommands::Stop { id } => (id, ServiceAction::Stop),
        ServiceCommands::Restart { id } => (id, ServiceAction::Restart),
        ServiceCommands::Autostart { id } => {
            let service = panel.manager.toggle_auto_start(id, caller).await?;
            let state = if service.auto_start { "enabled" } else { "disabled" };
            utils::success(format!("Auto-start {} for {}", state, service.name.bold()));
            return Ok(());
        }
    };

    let service = panel.manager.control_service(id, caller, action).await?;
    utils::success(format!(
        "{} {}: now {}",
        action,
        service.name.bold(),
        service.status.as_str()
    ));
    Ok(())
}
