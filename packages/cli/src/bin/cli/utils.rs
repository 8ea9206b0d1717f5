// ABOUTME: Shared output helpers for the sbpanel commands
// ABOUTME: Table construction and colored status rendering

use colored::*;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, ContentArrangement, Table};
use sbpanel_sandbox::storage::Resources;
use sbpanel_sandbox::SandboxStatus;

pub fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

pub fn status(status: SandboxStatus) -> ColoredString {
    match status {
        SandboxStatus::Running => status.as_str().green(),
        SandboxStatus::Creating => status.as_str().cyan(),
        SandboxStatus::Stopped => status.as_str().yellow(),
        SandboxStatus::ErrorCreatingBase | SandboxStatus::ErrorProvisioning => {
            status.as_str().red()
        }
    }
}

pub fn resources(resources: &Resources) -> String {
    format!(
        "{} CPU / {} MB RAM / {} MB disk",
        resources.cpu, resources.memory_mb, resources.disk_mb
    )
}

pub fn or_dash(value: Option<&str>) -> String {
    value.unwrap_or("-").to_string()
}

pub fn success(message: impl AsRef<str>) {
    println!("{} {}", "✓".green().bold(), message.as_ref());
}
