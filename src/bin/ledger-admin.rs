//! Operational CLI for the credit ledger: balances, grants, history,
//! reversals, reconciliation, and pricing configuration.

use clap::{Parser, Subcommand};

use credit_ledger::{
    CreditLedger, DayRange, LedgerConfig, Page, PricingConfig, ReversalOutcome,
    VendorPricingTable,
};

#[derive(Parser)]
#[command(name = "ledger-admin", about = "Credit ledger administration")]
struct Cli {
    /// Path to a TOML ledger configuration; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,
    /// Path to a vendor pricing JSON table.
    #[arg(long, global = true)]
    vendor_pricing: Option<std::path::PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the ledger database and schema.
    Init,
    /// Print a user's current credit balance.
    Balance { user_id: String },
    /// Grant credits to a user.
    Grant {
        user_id: String,
        amount: u64,
        /// Idempotency key; rerunning with the same id credits once.
        #[arg(long)]
        grant_id: String,
        #[arg(long, default_value = "manual")]
        source: String,
        #[arg(long)]
        actor: Option<String>,
    },
    /// Show a user's deduction history, newest first.
    History {
        user_id: String,
        #[arg(long, default_value_t = 50)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Show a user's daily usage summaries.
    Summary {
        user_id: String,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        until: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Reverse a deduction, crediting the amount back.
    Reverse {
        deduction_id: i64,
        #[arg(long)]
        reason: String,
        #[arg(long)]
        actor: String,
    },
    /// Verify the ledger invariants for a user; freezes on violation.
    Reconcile { user_id: String },
    /// Unfreeze a balance after manual review.
    Unfreeze { user_id: String },
    /// Add a pricing configuration row.
    PricingAdd {
        #[arg(long)]
        tier: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        model: Option<String>,
        /// Margin multiplier in basis points (10000 = 1.0x).
        multiplier_bps: u32,
        #[arg(long)]
        effective_from_ms: Option<i64>,
        #[arg(long)]
        effective_until_ms: Option<i64>,
    },
    /// List pricing configuration rows.
    PricingList,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => LedgerConfig::load(path)?,
        None => LedgerConfig::default(),
    };
    let vendor_pricing = match &cli.vendor_pricing {
        Some(path) => VendorPricingTable::from_json_str(&std::fs::read_to_string(path)?)?,
        None => VendorPricingTable::new(),
    };
    let ledger = CreditLedger::open(config, vendor_pricing).await?;

    match cli.command {
        Command::Init => {
            println!("ledger initialized at {}", ledger.store().path().display());
        }
        Command::Balance { user_id } => {
            println!("{}", ledger.current_balance(&user_id).await?);
        }
        Command::Grant {
            user_id,
            amount,
            grant_id,
            source,
            actor,
        } => {
            let balance = ledger
                .grant_credits(&user_id, &grant_id, amount, &source, actor.as_deref())
                .await?;
            println!("granted {amount} credits to {user_id}, balance {balance}");
        }
        Command::History {
            user_id,
            limit,
            offset,
        } => {
            let records = ledger
                .deduction_history(&user_id, Page { limit, offset })
                .await?;
            for record in records {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Command::Summary {
            user_id,
            from,
            until,
            limit,
        } => {
            let records = ledger
                .daily_summaries(&user_id, DayRange { from, until }, Page::first(limit))
                .await?;
            for record in records {
                println!("{}", serde_json::to_string(&record)?);
            }
        }
        Command::Reverse {
            deduction_id,
            reason,
            actor,
        } => match ledger.reverse_deduction(deduction_id, &reason, &actor).await? {
            ReversalOutcome::Reversed {
                amount,
                balance_after,
                ..
            } => println!("reversed {amount} credits, balance {balance_after}"),
            ReversalOutcome::AlreadyReversed { .. } => {
                println!("deduction {deduction_id} already reversed");
            }
        },
        Command::Reconcile { user_id } => {
            let report = ledger.reconcile_user(&user_id).await?;
            println!("{}", serde_json::to_string(&report)?);
        }
        Command::Unfreeze { user_id } => {
            ledger.store().set_frozen(&user_id, false).await?;
            println!("unfroze balance for {user_id}");
        }
        Command::PricingAdd {
            tier,
            provider,
            model,
            multiplier_bps,
            effective_from_ms,
            effective_until_ms,
        } => {
            let id = ledger
                .store()
                .insert_pricing_config(PricingConfig {
                    id: 0,
                    tier,
                    provider_id: provider,
                    model_id: model,
                    multiplier_bps,
                    effective_from_ms: effective_from_ms.unwrap_or(0),
                    effective_until_ms,
                    active: true,
                })
                .await?;
            ledger.reload_pricing().await?;
            println!("added pricing config {id}");
        }
        Command::PricingList => {
            for config in ledger.store().load_pricing_configs().await? {
                println!("{}", serde_json::to_string(&config)?);
            }
        }
    }
    Ok(())
}
