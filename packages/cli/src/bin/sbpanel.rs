// ABOUTME: Entry point of the sbpanel command-line tool
// ABOUTME: Parses arguments, sets up logging and dispatches to the command modules

use clap::{Parser, Subcommand};
use colored::*;
use sbpanel_cli::{Config, Panel};
use sbpanel_config::constants;
use std::process;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::account::AccountCommands;
use cli::files::FileCommands;
use cli::hosting::{CronCommands, DatabaseCommands, SiteCommands};
use cli::sandbox::SandboxCommands;
use cli::service::ServiceCommands;
use cli::settings::SettingsCommands;

#[derive(Parser)]
#[command(name = "sbpanel")]
#[command(about = "SBPanel - sandboxed hosting control panel")]
#[command(version)]
struct Cli {
    /// Account id to act as
    #[arg(long = "as", global = true, env = constants::SBPANEL_ACCOUNT)]
    account: Option<i64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage hosting accounts
    #[command(subcommand)]
    Account(AccountCommands),
    /// Manage sandboxes
    #[command(subcommand)]
    Sandbox(SandboxCommands),
    /// Control services running inside a sandbox
    #[command(subcommand)]
    Service(ServiceCommands),
    /// Manage websites
    #[command(subcommand)]
    Site(SiteCommands),
    /// Manage databases
    #[command(subcommand)]
    Database(DatabaseCommands),
    /// Manage scheduled jobs
    #[command(subcommand)]
    Cron(CronCommands),
    /// Browse and edit files inside a sandbox
    #[command(subcommand)]
    File(FileCommands),
    /// View or change panel-wide settings (admin only)
    #[command(subcommand)]
    Settings(SettingsCommands),
    /// Retry failed runtime cleanups and remove orphaned instances (admin only)
    Reconcile,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .compact()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::from_env()?;
    let panel = Panel::open(&config).await?;

    let result = match cli.command {
        Commands::Account(command) => cli::account::handle(&panel, cli.account, command).await,
        Commands::Sandbox(command) => cli::sandbox::handle(&panel, cli.account, command).await,
        Commands::Service(command) => cli::service::handle(&panel, cli.account, command).await,
        Commands::Site(command) => cli::hosting::handle_site(&panel, cli.account, command).await,
        Commands::Database(command) => {
            cli::hosting::handle_database(&panel, cli.account, command).await
        }
        Commands::Cron(command) => cli::hosting::handle_cron(&panel, cli.account, command).await,
        Commands::File(command) => cli::files::handle(&panel, cli.account, command).await,
        Commands::Settings(command) => cli::settings::handle(&panel, cli.account, command).await,
        Commands::Reconcile => cli::sandbox::reconcile(&panel, cli.account).await,
    };

    panel.close().await;
    result
}
