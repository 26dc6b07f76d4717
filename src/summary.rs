//! Daily aggregation helpers. Summaries are maintained inside the deduction
//! transaction itself (see `store::upsert_daily_summary`), never by a batch
//! job, so they can never lag the ledger.

use chrono::{DateTime, Utc};

/// UTC day key (`%Y-%m-%d`) for an epoch-millisecond timestamp. Out-of-range
/// timestamps clamp to the epoch day rather than panic.
pub fn day_key(ts_ms: i64) -> String {
    let day = DateTime::<Utc>::from_timestamp_millis(ts_ms)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
        .date_naive();
    day.format("%Y-%m-%d").to_string()
}

/// Additive delta folded into one `(user, day, model)` summary row.
#[derive(Clone, Debug, Default)]
pub struct SummaryDelta {
    pub requests: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub credits_spent: i64,
    pub credits_reversed: i64,
    pub vendor_cost_usd_micros: i64,
}
