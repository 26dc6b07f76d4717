//! Vendor cost and credit arithmetic. All money is integer USD micros;
//! every division rounds up so the platform is never undercharged.

use std::collections::HashMap;

use thiserror::Error;

use crate::usage::NormalizedUsage;

/// Basis points denominator: 10_000 bps = 1.0x.
pub const BPS_SCALE: u64 = 10_000;

/// Per-model vendor pricing in USD micros per 1000 tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VendorPricing {
    pub input_usd_micros_per_1k: u64,
    pub output_usd_micros_per_1k: u64,
    pub cached_input_usd_micros_per_1k: Option<u64>,
}

#[derive(Clone, Debug, Default)]
pub struct VendorPricingTable {
    models: HashMap<String, VendorPricing>,
}

#[derive(Debug, Error)]
pub enum VendorPricingError {
    #[error("invalid vendor pricing json: expected object at root")]
    InvalidRoot,
    #[error("invalid vendor pricing entry for model {model}: expected object")]
    InvalidModelEntry { model: String },
    #[error("invalid vendor pricing entry for model {model}: missing input/output price")]
    MissingPrices { model: String },
    #[error("invalid vendor pricing entry for model {model}: invalid value for {field}")]
    InvalidPrice { model: String, field: &'static str },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl VendorPricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, model: impl Into<String>, pricing: VendorPricing) {
        self.models.insert(model.into(), pricing);
    }

    pub fn pricing(&self, model: &str) -> Option<&VendorPricing> {
        self.models.get(model)
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Loads a table from JSON of the form
    /// `{"model": {"input_usd_per_1k": 0.15, "output_usd_per_1k": 0.6,
    ///   "cached_input_usd_per_1k": 0.075}, ...}`.
    pub fn from_json_str(raw: &str) -> Result<Self, VendorPricingError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        let Some(root) = value.as_object() else {
            return Err(VendorPricingError::InvalidRoot);
        };

        let mut models = HashMap::new();
        for (model, entry) in root {
            let Some(obj) = entry.as_object() else {
                return Err(VendorPricingError::InvalidModelEntry {
                    model: model.clone(),
                });
            };

            let input = parse_usd_per_1k(obj, model, "input_usd_per_1k")?;
            let output = parse_usd_per_1k(obj, model, "output_usd_per_1k")?;
            let (Some(input), Some(output)) = (input, output) else {
                return Err(VendorPricingError::MissingPrices {
                    model: model.clone(),
                });
            };
            let cached = parse_usd_per_1k(obj, model, "cached_input_usd_per_1k")?;

            models.insert(
                model.clone(),
                VendorPricing {
                    input_usd_micros_per_1k: input,
                    output_usd_micros_per_1k: output,
                    cached_input_usd_micros_per_1k: cached,
                },
            );
        }
        Ok(Self { models })
    }
}

fn parse_usd_per_1k(
    obj: &serde_json::Map<String, serde_json::Value>,
    model: &str,
    field: &'static str,
) -> Result<Option<u64>, VendorPricingError> {
    let Some(value) = obj.get(field) else {
        return Ok(None);
    };
    let Some(usd) = value.as_f64() else {
        return Err(VendorPricingError::InvalidPrice {
            model: model.to_string(),
            field,
        });
    };
    if !usd.is_finite() || usd < 0.0 {
        return Err(VendorPricingError::InvalidPrice {
            model: model.to_string(),
            field,
        });
    }
    let micros = (usd * 1_000_000.0).round();
    let micros = if micros > u64::MAX as f64 {
        u64::MAX
    } else {
        micros as u64
    };
    Ok(Some(micros))
}

/// Vendor cost of a normalized usage triple, in USD micros. Cached input
/// tokens are billed at the cached rate (when one exists) and excluded from
/// the full-rate input count.
pub fn vendor_cost_usd_micros(usage: &NormalizedUsage, pricing: &VendorPricing) -> u64 {
    let cached_rate = pricing.cached_input_usd_micros_per_1k;
    let (full_input, cached_input) = match cached_rate {
        Some(_) => {
            let cached = usage.cached_input_tokens.min(usage.input_tokens);
            (usage.input_tokens - cached, cached)
        }
        None => (usage.input_tokens, 0),
    };

    let mut cost = per_1k_cost(full_input, pricing.input_usd_micros_per_1k);
    if let Some(rate) = cached_rate {
        cost = cost.saturating_add(per_1k_cost(cached_input, rate));
    }
    cost.saturating_add(per_1k_cost(
        usage.output_tokens,
        pricing.output_usd_micros_per_1k,
    ))
}

fn per_1k_cost(tokens: u64, usd_micros_per_1k: u64) -> u64 {
    let product = u128::from(tokens) * u128::from(usd_micros_per_1k);
    u64::try_from(product.div_ceil(1_000)).unwrap_or(u64::MAX)
}

/// User-facing credit value of a vendor cost after the margin multiplier.
pub fn credit_value_usd_micros(vendor_cost_usd_micros: u64, multiplier_bps: u32) -> u64 {
    let product = u128::from(vendor_cost_usd_micros) * u128::from(multiplier_bps);
    u64::try_from(product.div_ceil(u128::from(BPS_SCALE))).unwrap_or(u64::MAX)
}

/// Credits to deduct for a vendor cost. Always rounds toward the platform:
/// any positive credit value costs at least one credit.
pub fn credits_to_deduct(
    vendor_cost_usd_micros: u64,
    multiplier_bps: u32,
    one_credit_usd_micros: u64,
) -> u64 {
    let value = credit_value_usd_micros(vendor_cost_usd_micros, multiplier_bps);
    value.div_ceil(one_credit_usd_micros.max(1))
}

/// Pre-flight upper bound: the same conversion with a safety margin applied
/// on top of the credit value before ceiling to whole credits.
pub fn estimate_credits_upper_bound(
    vendor_cost_usd_micros: u64,
    multiplier_bps: u32,
    one_credit_usd_micros: u64,
    margin_pct: u32,
) -> u64 {
    let value = credit_value_usd_micros(vendor_cost_usd_micros, multiplier_bps);
    let padded = u128::from(value) * u128::from(100 + u64::from(margin_pct));
    let padded = u64::try_from(padded.div_ceil(100)).unwrap_or(u64::MAX);
    padded.div_ceil(one_credit_usd_micros.max(1))
}

/// Gross margin percentage implied by a multiplier, e.g. 15_000 bps -> 33.33.
pub fn gross_margin_pct(multiplier_bps: u32) -> f64 {
    if multiplier_bps == 0 {
        return 0.0;
    }
    (1.0 - BPS_SCALE as f64 / multiplier_bps as f64) * 100.0
}
