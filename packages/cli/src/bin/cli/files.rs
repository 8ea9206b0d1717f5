// ABOUTME: File commands browsing and editing the filesystem of a running sandbox
// ABOUTME: Uploads and fetches move bytes between the local machine and the sandbox

use super::utils;
use anyhow::{Context, Result};
use clap::Subcommand;
use colored::*;
use sbpanel_cli::Panel;
use sbpanel_sandbox::files::FileKind;
use std::io::Write;
use std::path::PathBuf;

const DEFAULT_DOWNLOAD_DIR: &str = "/var/www/html";

#[derive(Subcommand)]
pub enum FileCommands {
    /// List a directory
    Ls { sandbox_id: i64, path: String },
    /// Print a text file
    Cat { sandbox_id: i64, path: String },
    /// Copy a local file into the sandbox
    Put {
        sandbox_id: i64,
        local: PathBuf,
        path: String,
    },
    /// Copy a file out of the sandbox; prints to stdout without --output
    Fetch {
        sandbox_id: i64,
        path: String,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Create a directory and its parents
    Mkdir { sandbox_id: i64, path: String },
    /// Delete a file or directory recursively
    Rm { sandbox_id: i64, path: String },
    /// Download a URL into a sandbox directory
    Download {
        sandbox_id: i64,
        url: String,
        #[arg(long, default_value = DEFAULT_DOWNLOAD_DIR)]
        dir: String,
    },
}

fn kind(kind: FileKind) -> ColoredString {
    match kind {
        FileKind::Directory => "dir".blue(),
        FileKind::Symlink => "link".cyan(),
        FileKind::File => "file".normal(),
        FileKind::Other => "other".dimmed(),
    }
}

pub async fn handle(panel: &Panel, account: Option<i64>, command: FileCommands) -> Result<()> {
    let caller = panel.caller(account).await?;

    match command {
        FileCommands::Ls { sandbox_id, path } => {
            let entries = panel.hosting.list_files(caller, sandbox_id, &path).await?;
            let mut table = utils::table(vec!["Name", "Type", "Size", "Mode", "Owner", "Modified"]);
            for entry in &entries {
                let name = match &entry.target {
                    Some(target) => format!("{} -> {}", entry.name, target),
                    None => entry.name.clone(),
                };
                table.add_row(vec![
                    name,
                    kind(entry.kind).to_string(),
                    entry.size.to_string(),
                    entry.permissions.clone(),
                    format!("{}:{}", entry.owner, entry.group),
                    entry
                        .modified
                        .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| "-".to_string()),
                ]);
            }
            println!("{}", table);
        }
        FileCommands::Cat { sandbox_id, path } => {
            let contents = panel.hosting.read_file(caller, sandbox_id, &path).await?;
            print!("{}", contents);
        }
        FileCommands::Put {
            sandbox_id,
            local,
            path,
        } => {
            let contents = std::fs::read(&local)
                .with_context(|| format!("Failed to read {}", local.display()))?;
            panel
                .hosting
                .write_file(caller, sandbox_id, &path, &contents)
                .await?;
            utils::success(format!("Wrote {} bytes to {}", contents.len(), path.bold()));
        }
        FileCommands::Fetch {
            sandbox_id,
            path,
            output,
        } => {
            let contents = panel.hosting.fetch_file(caller, sandbox_id, &path).await?;
            match output {
                Some(output) => {
                    std::fs::write(&output, &contents)
                        .with_context(|| format!("Failed to write {}", output.display()))?;
                    utils::success(format!(
                        "Saved {} bytes to {}",
                        contents.len(),
                        output.display()
                    ));
                }
                None => std::io::stdout()
                    .write_all(&contents)
                    .context("Failed to write to stdout")?,
            }
        }
        FileCommands::Mkdir { sandbox_id, path } => {
            panel
                .hosting
                .create_directory(caller, sandbox_id, &path)
                .await?;
            utils::success(format!("Created {}", path.bold()));
        }
        FileCommands::Rm { sandbox_id, path } => {
            panel.hosting.delete_path(caller, sandbox_id, &path).await?;
            utils::success(format!("Deleted {}", path.bold()));
        }
        FileCommands::Download {
            sandbox_id,
            url,
            dir,
        } => {
            let name = panel
                .hosting
                .download_url(caller, sandbox_id, &url, &dir)
                .await?;
            utils::success(format!("Downloaded {} into {}", name.bold(), dir));
        }
    }
    Ok(())
}
