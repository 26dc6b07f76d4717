//! Credit/billing ledger engine for metered LLM inference usage.
//!
//! Converts provider usage payloads into atomic, auditable credit
//! deductions: a priority-cascade pricing resolver, a vendor-cost
//! calculator, an atomic deduction coordinator over SQLite, additive
//! reversals, and daily aggregates maintained inside the deduction
//! transaction itself. No overdraft is ever persisted, the ledger is
//! append-only, and a completed user-facing request is never failed by a
//! billing error.

pub mod config;
pub mod coordinator;
pub mod costing;
mod error;
pub mod pricing;
pub mod records;
pub mod store;
pub mod summary;
pub mod usage;

pub use config::LedgerConfig;
pub use coordinator::{CreditCheck, CreditEstimate, CreditLedger};
pub use costing::{
    credit_value_usd_micros, credits_to_deduct, estimate_credits_upper_bound, gross_margin_pct,
    vendor_cost_usd_micros, VendorPricing, VendorPricingError, VendorPricingTable,
};
pub use error::{LedgerError, Result};
pub use pricing::{PricingConfig, PricingResolver, PricingSource, ResolvedPricing};
pub use records::{
    AllocationRecord, BalanceRecord, DailySummaryRecord, DayRange, DeductionReceipt,
    DeductionRecord, DeductionStatus, Page, ReversalOutcome, UsageRecord,
};
pub use store::{DeductionArgs, ReconcileReport, SqliteLedgerStore, UsageDraft};
pub use summary::day_key;
pub use usage::{normalize_usage, NormalizedUsage, ProviderFamily};
