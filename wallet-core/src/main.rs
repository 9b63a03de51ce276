//! Wallet Core CLI
//!
//! Command-line front end for the wallet engine.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wallet_core::commands::{self, Context};
use wallet_core::WalletConfig;

#[derive(Parser)]
#[command(name = "wallet-core")]
#[command(about = "Self-custodial Bitcoin wallet with encrypted cloud backup")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Wallet data directory (cache, preferences, config)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Configuration file (defaults to config.toml in the data directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new wallet
    Init {
        /// Recover from existing mnemonic
        #[arg(long)]
        recover: bool,
    },

    /// Check wallet balance
    Balance {
        /// Show the balance in the preferred fiat currency
        #[arg(long)]
        fiat: bool,
    },

    /// Show transaction history
    History {
        /// Account: all, N, hd:N, imported:N
        #[arg(short, long)]
        account: Option<String>,

        /// Maximum number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Manage accounts
    Accounts {
        #[command(subcommand)]
        action: AccountAction,
    },

    /// Import an address
    Import {
        address: String,

        #[arg(short, long)]
        label: Option<String>,

        /// Prompt for the private key (otherwise watch-only)
        #[arg(long)]
        with_key: bool,
    },

    /// Payment requests with contacts
    Requests {
        #[command(subcommand)]
        action: RequestAction,
    },

    /// Pull the latest wallet from the server
    Pull,

    /// Change the wallet password
    Password,
}

#[derive(Subcommand)]
enum AccountAction {
    /// List accounts
    List {
        /// Include archived accounts
        #[arg(long)]
        all: bool,
    },
    /// Add an HD account
    Add { label: String },
    /// Rename an account
    Label { account: String, label: String },
    /// Archive an account (or restore it)
    Archive {
        account: String,
        #[arg(long)]
        restore: bool,
    },
}

#[derive(Subcommand)]
enum RequestAction {
    /// List payment requests
    List,
    /// Pick the account that receives a payment
    ChooseAccount {
        id: String,
        /// Position among active accounts, starting at 0
        position: usize,
    },
    /// Delete a request
    Delete {
        id: String,
        /// Skip confirmation prompt
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let data_dir = cli.data_dir.unwrap_or_else(WalletConfig::default_dir);
    let ctx = Context::load(data_dir, cli.config.as_deref())?;

    match cli.command {
        Commands::Init { recover } => commands::init::run(&ctx, recover).await,
        Commands::Balance { fiat } => commands::balance::run(&ctx, fiat).await,
        Commands::History { account, limit } => {
            commands::history::run(&ctx, account.as_deref(), limit).await
        }
        Commands::Accounts { action } => match action {
            AccountAction::List { all } => commands::accounts::list(&ctx, all).await,
            AccountAction::Add { label } => commands::accounts::add(&ctx, &label).await,
            AccountAction::Label { account, label } => {
                commands::accounts::label(&ctx, &account, &label).await
            }
            AccountAction::Archive { account, restore } => {
                commands::accounts::archive(&ctx, &account, restore).await
            }
        },
        Commands::Import {
            address,
            label,
            with_key,
        } => commands::import::run(&ctx, &address, label.as_deref(), with_key).await,
        Commands::Requests { action } => match action {
            RequestAction::List => commands::requests::list(&ctx).await,
            RequestAction::ChooseAccount { id, position } => {
                commands::requests::choose_account(&ctx, &id, position).await
            }
            RequestAction::Delete { id, yes } => commands::requests::delete(&ctx, &id, yes).await,
        },
        Commands::Pull => commands::sync::run(&ctx).await,
        Commands::Password => commands::password::run(&ctx).await,
    }
}
