use serde::{Deserialize, Serialize};

/// Persisted status of a deduction record. A deduction either commits as
/// `Completed` inside its transaction or leaves no row at all; the only
/// later transition is `Completed` -> `Reversed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeductionStatus {
    Completed,
    Reversed,
}

impl DeductionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DeductionStatus::Completed => "completed",
            DeductionStatus::Reversed => "reversed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "completed" => Some(DeductionStatus::Completed),
            "reversed" => Some(DeductionStatus::Reversed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BalanceRecord {
    pub user_id: String,
    pub amount: i64,
    pub last_deduction_amount: Option<i64>,
    pub last_deduction_at_ms: Option<i64>,
    pub frozen: bool,
    pub updated_at_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: i64,
    pub user_id: String,
    pub request_id: String,
    pub provider_id: String,
    pub model_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_input_tokens: u64,
    pub vendor_cost_usd_micros: u64,
    pub multiplier_bps: u32,
    pub credits_deducted: i64,
    pub margin_usd_micros: u64,
    pub usage_recognized: bool,
    pub deduction_id: Option<i64>,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeductionRecord {
    pub id: i64,
    pub user_id: String,
    pub request_id: String,
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub reason: String,
    pub status: DeductionStatus,
    pub reversed_at_ms: Option<i64>,
    pub reversed_by: Option<String>,
    pub reversal_reason: Option<String>,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DailySummaryRecord {
    pub user_id: String,
    /// UTC day in `%Y-%m-%d` form.
    pub day: String,
    pub model_id: String,
    pub requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub credits_spent: i64,
    pub credits_reversed: i64,
    pub vendor_cost_usd_micros: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub id: i64,
    pub user_id: String,
    pub grant_id: String,
    pub amount: i64,
    pub source: String,
    pub granted_by: Option<String>,
    pub created_at_ms: i64,
}

/// Committed outcome of one atomic deduction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeductionReceipt {
    pub deduction_id: i64,
    pub usage_record_id: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub credits_deducted: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum ReversalOutcome {
    Reversed {
        deduction_id: i64,
        amount: i64,
        balance_after: i64,
    },
    /// Idempotency no-op: the record was already reversed.
    AlreadyReversed { deduction_id: i64 },
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Page {
    pub fn first(limit: u32) -> Self {
        Self { limit, offset: 0 }
    }
}

/// Inclusive range of UTC `%Y-%m-%d` day keys; `None` bounds are open.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DayRange {
    pub from: Option<String>,
    pub until: Option<String>,
}
