use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::DateFormatArg;

#[derive(Parser)]
#[command(name = "collatio", about = "CSV bank statement import and reconciliation", version)]
struct Cli {
    /// Path to the ledger database (defaults to the platform data directory).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage accounts.
    Accounts {
        #[command(subcommand)]
        command: AccountsCommand,
    },
    /// Detect the dialect and column mapping of a CSV file without importing.
    Detect {
        file: PathBuf,
    },
    /// Import a CSV bank statement into an account.
    Import {
        file: PathBuf,
        /// Name of the account to import into.
        #[arg(long)]
        account: String,
        /// Field separator override (`,`, `;`, `tab`, or any literal string).
        #[arg(long)]
        delimiter: Option<String>,
        /// Treat the first line as data, not headers.
        #[arg(long)]
        no_header: bool,
        /// Date layout override.
        #[arg(long, value_enum)]
        date_format: Option<DateFormatArg>,
        /// TOML file with import rules.
        #[arg(long)]
        rules: Option<PathBuf>,
        /// Parse, map and flag only; write nothing.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
enum AccountsCommand {
    /// Create an account.
    Add { name: String },
    /// List accounts with their balances.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Accounts { command } => match command {
            AccountsCommand::Add { name } => commands::accounts_add(cli.db, &name).await,
            AccountsCommand::List => commands::accounts_list(cli.db).await,
        },
        Command::Detect { file } => commands::detect(&file).await,
        Command::Import {
            file,
            account,
            delimiter,
            no_header,
            date_format,
            rules,
            dry_run,
        } => {
            commands::import(commands::ImportArgs {
                db: cli.db,
                file,
                account,
                delimiter,
                no_header,
                date_format,
                rules,
                dry_run,
            })
            .await
        }
    }
}
