// ABOUTME: Settings commands listing and changing panel-wide settings
// ABOUTME: Changes are validated per key and refused on concurrent modification

use super::utils;
use anyhow::{ensure, Result};
use clap::Subcommand;
use colored::*;
use sbpanel_cli::Panel;

#[derive(Subcommand)]
pub enum SettingsCommands {
    /// List all settings
    List,
    /// Change one setting
    Set { key: String, value: String },
}

pub async fn handle(panel: &Panel, account: Option<i64>, command: SettingsCommands) -> Result<()> {
    let caller = panel.caller(account).await?;
    ensure!(caller.is_admin, "Settings can only be managed by an administrator");

    match command {
        SettingsCommands::List => {
            let settings = panel.settings.list().await?;
            let mut table = utils::table(vec!["Key", "Value", "Description", "Updated"]);
            for setting in &settings {
                table.add_row(vec![
                    setting.key.clone(),
                    if setting.value.is_empty() {
                        "-".to_string()
                    } else {
                        setting.value.clone()
                    },
                    utils::or_dash(setting.description.as_deref()),
                    setting.updated_at.clone(),
                ]);
            }
            println!("{}", table);
        }
        SettingsCommands::Set { key, value } => {
            let setting = panel.settings.change(&key, &value).await?;
            let shown = if setting.value.is_empty() {
                "(empty)"
            } else {
                setting.value.as_str()
            };
            utils::success(format!("{} = {}", setting.key.bold(), shown));
        }
    }
    Ok(())
}
