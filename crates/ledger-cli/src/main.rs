//! Usage Ledger CLI
//!
//! Runs ledger operations against a JSON snapshot of grants.
//!
//! # Usage
//!
//! ```bash
//! ledgerctl --snapshot ledger.json track --customer cus_1 --feature messages --amount 5
//! ledgerctl --snapshot ledger.json --write credit --customer cus_1 --feature messages --amount 20 --kind adjustment
//! ledgerctl --snapshot ledger.json balance --customer cus_1 --format yaml
//! ledgerctl --snapshot ledger.json --at 1735689600000 sweep
//! ledgerctl --config ledger.toml config show
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use ledger_core::CreditKind;
use rust_decimal::Decimal;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod output;

#[derive(Parser)]
#[command(name = "ledgerctl")]
#[command(version)]
#[command(about = "Usage Ledger Command Line Interface", long_about = None)]
struct Cli {
    /// Grant snapshot to operate on
    #[arg(long, env = "LEDGER_SNAPSHOT", global = true)]
    snapshot: Option<PathBuf>,

    /// Write the snapshot back after a mutation
    #[arg(long, global = true)]
    write: bool,

    /// Ledger configuration file
    #[arg(long, env = "LEDGER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Pin the clock to this instant (unix millis)
    #[arg(long, global = true)]
    at: Option<i64>,

    /// Output format
    #[arg(long, short, default_value = "json", global = true)]
    format: output::OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record usage; a negative amount refunds
    Track {
        #[arg(long)]
        customer: String,
        #[arg(long)]
        feature: String,
        #[arg(long)]
        entity: Option<String>,
        #[arg(long, allow_hyphen_values = true)]
        amount: Decimal,
    },
    /// Credit a balance
    Credit {
        #[arg(long)]
        customer: String,
        #[arg(long)]
        feature: String,
        #[arg(long)]
        entity: Option<String>,
        #[arg(long)]
        amount: Decimal,
        #[arg(long, value_enum, default_value = "adjustment")]
        kind: CreditKindArg,
    },
    /// Move a balance to a target
    Set {
        #[arg(long)]
        customer: String,
        #[arg(long)]
        feature: String,
        #[arg(long)]
        entity: Option<String>,
        #[arg(long)]
        target: Decimal,
    },
    /// Show balances
    Balance {
        #[arg(long)]
        customer: String,
        /// Limit to one feature
        #[arg(long)]
        feature: Option<String>,
        #[arg(long)]
        entity: Option<String>,
    },
    /// Reset every grant whose cycle has ended
    Sweep,
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CreditKindArg {
    Refund,
    Adjustment,
}

impl From<CreditKindArg> for CreditKind {
    fn from(kind: CreditKindArg) -> Self {
        match kind {
            CreditKindArg::Refund => CreditKind::Refund,
            CreditKindArg::Adjustment => CreditKind::Adjustment,
        }
    }
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Write the default configuration to --config
    Init,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let ledger_config = config::load(cli.config.as_deref())?;

    let ctx = commands::Context {
        snapshot: cli.snapshot,
        write: cli.write,
        at: cli.at,
        config: ledger_config,
        format: cli.format,
    };

    match cli.command {
        Commands::Track {
            customer,
            feature,
            entity,
            amount,
        } => commands::usage::track(&ctx, &customer, &feature, entity.as_deref(), amount).await,
        Commands::Credit {
            customer,
            feature,
            entity,
            amount,
            kind,
        } => commands::usage::credit(&ctx, &customer, &feature, entity.as_deref(), amount, kind.into()).await,
        Commands::Set {
            customer,
            feature,
            entity,
            target,
        } => commands::usage::set(&ctx, &customer, &feature, entity.as_deref(), target).await,
        Commands::Balance {
            customer,
            feature,
            entity,
        } => commands::balance::handle(&ctx, &customer, feature.as_deref(), entity.as_deref()).await,
        Commands::Sweep => commands::sweep::handle(&ctx).await,
        Commands::Config { action } => commands::config::handle(action, cli.config.as_deref(), &ctx),
    }
}
