//! Margin-multiplier resolution over versioned pricing configurations.
//!
//! Resolution never fails: when nothing matches (including an unknown tier)
//! the configured system default applies, so pricing can never block a
//! deduction.

use serde::{Deserialize, Serialize};

use crate::costing::gross_margin_pct;

/// One versioned pricing configuration row. Scope is whichever of `tier`,
/// `provider_id`, `model_id` are set; a row is eligible for a lookup only if
/// every set field matches and `now` falls inside its effective window.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PricingConfig {
    pub id: i64,
    pub tier: Option<String>,
    pub provider_id: Option<String>,
    pub model_id: Option<String>,
    pub multiplier_bps: u32,
    pub effective_from_ms: i64,
    pub effective_until_ms: Option<i64>,
    pub active: bool,
}

impl PricingConfig {
    fn is_effective_at(&self, at_ms: i64) -> bool {
        if !self.active || at_ms < self.effective_from_ms {
            return false;
        }
        match self.effective_until_ms {
            Some(until) => at_ms < until,
            None => true,
        }
    }

    fn matches(&self, tier: &str, provider_id: Option<&str>, model_id: Option<&str>) -> bool {
        if let Some(row_tier) = &self.tier {
            if row_tier != tier {
                return false;
            }
        }
        if let Some(row_provider) = &self.provider_id {
            if provider_id != Some(row_provider.as_str()) {
                return false;
            }
        }
        if let Some(row_model) = &self.model_id {
            if model_id != Some(row_model.as_str()) {
                return false;
            }
        }
        true
    }

    /// Specificity rank: model-scoped beats provider-scoped beats
    /// tier-scoped, and any combination beats its parts, which yields the
    /// required order exact combo > model > provider > tier-default.
    fn specificity(&self) -> u8 {
        let mut rank = 0;
        if self.model_id.is_some() {
            rank += 4;
        }
        if self.provider_id.is_some() {
            rank += 2;
        }
        if self.tier.is_some() {
            rank += 1;
        }
        rank
    }

    fn source(&self) -> PricingSource {
        if self.tier.is_some() && self.provider_id.is_some() && self.model_id.is_some() {
            PricingSource::ExactCombination
        } else if self.model_id.is_some() {
            PricingSource::Model
        } else if self.provider_id.is_some() {
            PricingSource::Provider
        } else {
            PricingSource::Tier
        }
    }
}

/// Which cascade level produced the resolved multiplier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PricingSource {
    ExactCombination,
    Model,
    Provider,
    Tier,
    SystemDefault,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ResolvedPricing {
    pub multiplier_bps: u32,
    pub gross_margin_pct: f64,
    pub source: PricingSource,
}

/// In-memory snapshot of the pricing configuration store. Rebuilt from
/// `SqliteLedgerStore::load_pricing_configs` whenever configurations change;
/// holds no connection and no global state.
#[derive(Clone, Debug)]
pub struct PricingResolver {
    configs: Vec<PricingConfig>,
    default_multiplier_bps: u32,
}

impl PricingResolver {
    pub fn new(configs: Vec<PricingConfig>, default_multiplier_bps: u32) -> Self {
        Self {
            configs,
            default_multiplier_bps,
        }
    }

    pub fn empty(default_multiplier_bps: u32) -> Self {
        Self::new(Vec::new(), default_multiplier_bps)
    }

    /// Resolves the applicable multiplier: most specific eligible row wins,
    /// ties broken by most recent `effective_from`, then highest id.
    pub fn resolve(
        &self,
        tier: &str,
        provider_id: Option<&str>,
        model_id: Option<&str>,
        at_ms: i64,
    ) -> ResolvedPricing {
        let best = self
            .configs
            .iter()
            .filter(|row| row.is_effective_at(at_ms))
            .filter(|row| row.matches(tier, provider_id, model_id))
            .max_by_key(|row| (row.specificity(), row.effective_from_ms, row.id));

        match best {
            Some(row) => ResolvedPricing {
                multiplier_bps: row.multiplier_bps,
                gross_margin_pct: gross_margin_pct(row.multiplier_bps),
                source: row.source(),
            },
            None => self.system_default(),
        }
    }

    pub fn system_default(&self) -> ResolvedPricing {
        ResolvedPricing {
            multiplier_bps: self.default_multiplier_bps,
            gross_margin_pct: gross_margin_pct(self.default_multiplier_bps),
            source: PricingSource::SystemDefault,
        }
    }
}
