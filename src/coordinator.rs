//! Deduction transaction coordinator. `CreditLedger` composes the pricing
//! resolver, the cost calculator, and the SQLite store through explicit
//! constructor injection (no globals), bounds every store call with the
//! configured transaction timeout, and owns the estimate -> validate ->
//! charge pipeline.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::config::LedgerConfig;
use crate::costing::{
    credit_value_usd_micros, credits_to_deduct, estimate_credits_upper_bound,
    vendor_cost_usd_micros, VendorPricingTable,
};
use crate::error::{LedgerError, Result};
use crate::pricing::{PricingResolver, PricingSource, ResolvedPricing};
use crate::records::{
    DailySummaryRecord, DayRange, DeductionReceipt, DeductionRecord, Page, ReversalOutcome,
};
use crate::store::{DeductionArgs, ReconcileReport, SqliteLedgerStore, UsageDraft};
use crate::usage::{normalize_usage, NormalizedUsage};

/// Pre-flight upper-bound estimate. Only the post-call actual amount is ever
/// debited; this exists so insufficient funds can be rejected before a vendor
/// call is made.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreditEstimate {
    pub credits: u64,
    pub vendor_cost_usd_micros: u64,
    pub multiplier_bps: u32,
    pub pricing_source: PricingSource,
    /// False when the model has no vendor pricing entry; the estimate is
    /// then zero and callers should treat it as unknown rather than free.
    pub vendor_pricing_known: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreditCheck {
    pub sufficient: bool,
    pub current_balance: i64,
    pub shortfall: u64,
    pub suggestions: Vec<String>,
}

pub struct CreditLedger {
    config: LedgerConfig,
    store: SqliteLedgerStore,
    pricing: RwLock<PricingResolver>,
    vendor_pricing: VendorPricingTable,
}

impl CreditLedger {
    /// Composes a ledger from already-built parts, in dependency order:
    /// leaves (resolver, vendor pricing) first, then the store they feed.
    pub fn new(
        config: LedgerConfig,
        store: SqliteLedgerStore,
        pricing: PricingResolver,
        vendor_pricing: VendorPricingTable,
    ) -> Self {
        Self {
            config,
            store,
            pricing: RwLock::new(pricing),
            vendor_pricing,
        }
    }

    /// Opens the database, initializes the schema, and loads the pricing
    /// configuration snapshot.
    pub async fn open(config: LedgerConfig, vendor_pricing: VendorPricingTable) -> Result<Self> {
        config.validate()?;
        let store = SqliteLedgerStore::from_config(&config);
        store.init().await?;
        let configs = store.load_pricing_configs().await?;
        let pricing = PricingResolver::new(configs, config.default_multiplier_bps);
        Ok(Self::new(config, store, pricing, vendor_pricing))
    }

    pub fn store(&self) -> &SqliteLedgerStore {
        &self.store
    }

    /// Rebuilds the pricing snapshot from the store. Call after pricing
    /// configurations change; in-flight resolutions keep the old snapshot.
    pub async fn reload_pricing(&self) -> Result<()> {
        let configs = self.bounded(self.store.load_pricing_configs()).await?;
        let resolver = PricingResolver::new(configs, self.config.default_multiplier_bps);
        *self.pricing.write().await = resolver;
        Ok(())
    }

    /// Conservative upper-bound estimate for a planned request.
    pub async fn estimate_credits(
        &self,
        user_id: &str,
        tier: &str,
        model_id: &str,
        provider_id: &str,
        est_input_tokens: u64,
        est_output_tokens: u64,
    ) -> Result<CreditEstimate> {
        let resolved = self
            .resolve_pricing(tier, Some(provider_id), Some(model_id))
            .await;
        let usage = NormalizedUsage::new(est_input_tokens, est_output_tokens, 0);

        let (cost, known) = match self.vendor_pricing.pricing(model_id) {
            Some(pricing) => (vendor_cost_usd_micros(&usage, pricing), true),
            None => {
                tracing::warn!(user_id, model_id, "no vendor pricing for model, estimate is zero");
                (0, false)
            }
        };
        let credits = estimate_credits_upper_bound(
            cost,
            resolved.multiplier_bps,
            self.config.one_credit_usd_micros,
            self.config.estimate_margin_pct,
        );
        Ok(CreditEstimate {
            credits,
            vendor_cost_usd_micros: cost,
            multiplier_bps: resolved.multiplier_bps,
            pricing_source: resolved.source,
            vendor_pricing_known: known,
        })
    }

    /// Balance pre-check with actionable feedback for shortfalls.
    pub async fn validate_sufficient_credits(
        &self,
        user_id: &str,
        credits_needed: u64,
    ) -> Result<CreditCheck> {
        let current_balance = self.bounded(self.store.current_balance(user_id)).await?;
        let available = current_balance.max(0) as u64;
        if available >= credits_needed {
            return Ok(CreditCheck {
                sufficient: true,
                current_balance,
                shortfall: 0,
                suggestions: Vec::new(),
            });
        }
        let shortfall = credits_needed - available;
        Ok(CreditCheck {
            sufficient: false,
            current_balance,
            shortfall,
            suggestions: vec![
                format!("add at least {shortfall} credits to your balance"),
                "retry with a shorter prompt or a cheaper model".to_string(),
            ],
        })
    }

    /// Full post-inference pipeline: normalize the raw provider usage
    /// payload, price it, and commit the deduction atomically. When the
    /// payload shape is unrecognized, the caller's pre-flight estimate (an
    /// upper bound) is debited instead so billing never fails a completed
    /// request.
    #[allow(clippy::too_many_arguments)]
    pub async fn charge_request(
        &self,
        user_id: &str,
        tier: &str,
        request_id: &str,
        provider_id: &str,
        model_id: &str,
        raw_usage: &serde_json::Value,
        estimated_credits: Option<u64>,
        reason: &str,
    ) -> Result<DeductionReceipt> {
        let usage = normalize_usage(provider_id, raw_usage);
        let resolved = self
            .resolve_pricing(tier, Some(provider_id), Some(model_id))
            .await;

        let vendor_cost = match self.vendor_pricing.pricing(model_id) {
            Some(pricing) => vendor_cost_usd_micros(&usage, pricing),
            None => {
                tracing::warn!(user_id, model_id, "no vendor pricing for model, cost is zero");
                0
            }
        };

        let credits = if usage.recognized {
            credits_to_deduct(
                vendor_cost,
                resolved.multiplier_bps,
                self.config.one_credit_usd_micros,
            )
        } else {
            let fallback = estimated_credits.unwrap_or(0);
            tracing::warn!(
                user_id,
                request_id,
                fallback,
                "charging pre-flight estimate for unrecognized usage payload"
            );
            fallback
        };

        let credit_value = credit_value_usd_micros(vendor_cost, resolved.multiplier_bps);
        let draft = UsageDraft {
            provider_id: provider_id.to_string(),
            model_id: model_id.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            cached_input_tokens: usage.cached_input_tokens,
            vendor_cost_usd_micros: vendor_cost,
            multiplier_bps: resolved.multiplier_bps,
            margin_usd_micros: credit_value.saturating_sub(vendor_cost),
            usage_recognized: usage.recognized,
        };
        self.deduct_credits_atomically(user_id, credits, request_id, draft, reason)
            .await
    }

    /// Commits one deduction exactly once per `(user, request)`.
    pub async fn deduct_credits_atomically(
        &self,
        user_id: &str,
        credits_to_deduct: u64,
        request_id: &str,
        usage: UsageDraft,
        reason: &str,
    ) -> Result<DeductionReceipt> {
        let receipt = self
            .bounded(self.store.deduct_atomically(DeductionArgs {
                user_id: user_id.to_string(),
                request_id: request_id.to_string(),
                credits_to_deduct,
                reason: reason.to_string(),
                usage,
            }))
            .await?;
        tracing::info!(
            user_id,
            request_id,
            credits = receipt.credits_deducted,
            balance_after = receipt.balance_after,
            "deduction committed"
        );
        Ok(receipt)
    }

    pub async fn reverse_deduction(
        &self,
        deduction_id: i64,
        reason: &str,
        actor_id: &str,
    ) -> Result<ReversalOutcome> {
        let outcome = self
            .bounded(self.store.reverse_deduction(deduction_id, reason, actor_id))
            .await?;
        match &outcome {
            ReversalOutcome::Reversed {
                amount,
                balance_after,
                ..
            } => {
                tracing::info!(
                    deduction_id,
                    actor_id,
                    amount,
                    balance_after,
                    "deduction reversed"
                );
            }
            ReversalOutcome::AlreadyReversed { .. } => {
                tracing::info!(deduction_id, actor_id, "reversal no-op, already reversed");
            }
        }
        Ok(outcome)
    }

    pub async fn grant_credits(
        &self,
        user_id: &str,
        grant_id: &str,
        amount: u64,
        source: &str,
        granted_by: Option<&str>,
    ) -> Result<i64> {
        let balance = self
            .bounded(
                self.store
                    .grant_credits(user_id, grant_id, amount, source, granted_by),
            )
            .await?;
        tracing::info!(user_id, grant_id, amount, source, balance, "credits granted");
        Ok(balance)
    }

    pub async fn current_balance(&self, user_id: &str) -> Result<i64> {
        self.bounded(self.store.current_balance(user_id)).await
    }

    pub async fn deduction_history(
        &self,
        user_id: &str,
        page: Page,
    ) -> Result<Vec<DeductionRecord>> {
        self.bounded(self.store.deduction_history(user_id, page))
            .await
    }

    pub async fn daily_summaries(
        &self,
        user_id: &str,
        range: DayRange,
        page: Page,
    ) -> Result<Vec<DailySummaryRecord>> {
        self.bounded(self.store.daily_summaries(user_id, range, page))
            .await
    }

    pub async fn reconcile_user(&self, user_id: &str) -> Result<ReconcileReport> {
        self.bounded(self.store.reconcile_user(user_id)).await
    }

    pub fn default_page(&self) -> Page {
        Page::first(self.config.history_page_limit)
    }

    async fn resolve_pricing(
        &self,
        tier: &str,
        provider_id: Option<&str>,
        model_id: Option<&str>,
    ) -> ResolvedPricing {
        self.pricing
            .read()
            .await
            .resolve(tier, provider_id, model_id, crate::store::now_millis())
    }

    /// Bounds a store call with the configured total transaction budget.
    /// Elapsing is retryable: deductions are idempotent per request id.
    async fn bounded<T>(
        &self,
        operation: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let budget = Duration::from_millis(self.config.transaction_timeout_ms);
        match tokio::time::timeout(budget, operation).await {
            Ok(result) => result,
            Err(_) => Err(LedgerError::TransactionTimeout {
                elapsed_ms: self.config.transaction_timeout_ms,
            }),
        }
    }
}
