//! SQLite ledger store. Every write runs inside one `BEGIN IMMEDIATE`
//! transaction on the blocking pool: the writer lock is taken up front with a
//! bounded `busy_timeout` wait, so the read-check-write sequence on a balance
//! row can never interleave with another worker's. SQLite transactions are
//! serializable, which is the isolation level the ledger requires.
//!
//! Helper functions each take the open `&rusqlite::Transaction` explicitly;
//! there is no ambient transaction context anywhere.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::config::{LedgerConfig, MAX_PAGE_LIMIT};
use crate::error::{LedgerError, Result};
use crate::pricing::PricingConfig;
use crate::records::{
    DailySummaryRecord, DayRange, DeductionReceipt, DeductionRecord, DeductionStatus, Page,
    ReversalOutcome,
};
use crate::summary::{SummaryDelta, day_key};

/// Usage bookkeeping captured alongside a deduction. Immutable once written.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UsageDraft {
    pub provider_id: String,
    pub model_id: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_input_tokens: u64,
    pub vendor_cost_usd_micros: u64,
    pub multiplier_bps: u32,
    pub margin_usd_micros: u64,
    pub usage_recognized: bool,
}

#[derive(Clone, Debug)]
pub struct DeductionArgs {
    pub user_id: String,
    pub request_id: String,
    pub credits_to_deduct: u64,
    pub reason: String,
    pub usage: UsageDraft,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub user_id: String,
    pub balance: i64,
    pub allocated: i64,
    pub deducted: i64,
    pub reversed: i64,
}

#[derive(Clone, Debug)]
pub struct SqliteLedgerStore {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteLedgerStore {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
        }
    }

    pub fn from_config(config: &LedgerConfig) -> Self {
        Self::new(
            config.db_path.clone(),
            Duration::from_millis(config.busy_timeout_ms),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<()> {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = open_connection(path, busy_timeout)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    /// Executes the deduction state machine exactly once per
    /// `(user, request)`: balance check, balance write, usage record,
    /// deduction record, cross-link, and daily summary, all in one
    /// transaction. A repeat call for an already-committed request id
    /// returns the original receipt instead of double-charging, which is
    /// what makes timed-out calls safely retryable.
    pub async fn deduct_atomically(&self, args: DeductionArgs) -> Result<DeductionReceipt> {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        let amount = credits_to_amount(args.credits_to_deduct)?;

        tokio::task::spawn_blocking(move || -> Result<DeductionReceipt> {
            let mut conn = open_connection(path, busy_timeout)?;
            init_schema(&conn)?;
            let now_ms = now_millis();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            if let Some(receipt) = find_receipt(&tx, &args.request_id)? {
                tracing::info!(
                    request_id = %args.request_id,
                    deduction_id = receipt.deduction_id,
                    "duplicate deduction request, returning committed receipt"
                );
                return Ok(receipt);
            }

            ensure_balance_row(&tx, &args.user_id, now_ms)?;
            let (balance_before, frozen) = read_balance_row(&tx, &args.user_id)?;
            if frozen {
                return Err(LedgerError::DataIntegrity {
                    user_id: args.user_id.clone(),
                    detail: "deductions halted pending manual review".to_string(),
                });
            }
            if balance_before < amount {
                return Err(LedgerError::InsufficientFunds {
                    balance: balance_before.max(0) as u64,
                    required: args.credits_to_deduct,
                    shortfall: (amount - balance_before.max(0)) as u64,
                });
            }

            let balance_after = balance_before - amount;
            tx.execute(
                "UPDATE balances
                 SET amount = ?2,
                     last_deduction_amount = ?3,
                     last_deduction_at_ms = ?4,
                     updated_at_ms = ?4
                 WHERE user_id = ?1",
                rusqlite::params![args.user_id, balance_after, amount, now_ms],
            )?;

            let usage_record_id = insert_usage_record(&tx, &args, amount, now_ms)?;
            let deduction_id = insert_deduction_record(
                &tx,
                &args.user_id,
                &args.request_id,
                amount,
                balance_before,
                balance_after,
                &args.reason,
                now_ms,
            )?;
            tx.execute(
                "UPDATE usage_records SET deduction_id = ?2 WHERE id = ?1",
                rusqlite::params![usage_record_id, deduction_id],
            )?;

            let delta = SummaryDelta {
                requests: 1,
                input_tokens: clamp_i64(args.usage.input_tokens),
                output_tokens: clamp_i64(args.usage.output_tokens),
                credits_spent: amount,
                credits_reversed: 0,
                vendor_cost_usd_micros: clamp_i64(args.usage.vendor_cost_usd_micros),
            };
            upsert_daily_summary(
                &tx,
                &args.user_id,
                &day_key(now_ms),
                &args.usage.model_id,
                &delta,
            )?;

            tx.commit()?;
            Ok(DeductionReceipt {
                deduction_id,
                usage_record_id,
                balance_before,
                balance_after,
                credits_deducted: amount,
            })
        })
        .await?
    }

    /// Additive reversal: credits the original amount back under the same
    /// locking discipline as the deduction and annotates the record. The
    /// record itself is never deleted; a second call is a no-op.
    pub async fn reverse_deduction(
        &self,
        deduction_id: i64,
        reason: &str,
        actor_id: &str,
    ) -> Result<ReversalOutcome> {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        let reason = reason.to_string();
        let actor_id = actor_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<ReversalOutcome> {
            let mut conn = open_connection(path, busy_timeout)?;
            init_schema(&conn)?;
            let now_ms = now_millis();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let row: Option<(String, i64, String)> = tx
                .query_row(
                    "SELECT user_id, amount, status FROM deduction_records WHERE id = ?1",
                    rusqlite::params![deduction_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;
            let Some((user_id, amount, status)) = row else {
                return Err(LedgerError::DeductionNotFound { deduction_id });
            };
            if DeductionStatus::parse(&status) == Some(DeductionStatus::Reversed) {
                return Ok(ReversalOutcome::AlreadyReversed { deduction_id });
            }

            ensure_balance_row(&tx, &user_id, now_ms)?;
            let (balance_before, _) = read_balance_row(&tx, &user_id)?;
            let balance_after = balance_before.saturating_add(amount);
            tx.execute(
                "UPDATE balances SET amount = ?2, updated_at_ms = ?3 WHERE user_id = ?1",
                rusqlite::params![user_id, balance_after, now_ms],
            )?;

            tx.execute(
                "UPDATE deduction_records
                 SET status = ?2, reversed_at_ms = ?3, reversed_by = ?4, reversal_reason = ?5
                 WHERE id = ?1",
                rusqlite::params![
                    deduction_id,
                    DeductionStatus::Reversed.as_str(),
                    now_ms,
                    actor_id,
                    reason
                ],
            )?;

            // The day-of-reversal summary absorbs the credit-back as an
            // additive delta; the original day's spent figures stay intact.
            let model_id: Option<String> = tx
                .query_row(
                    "SELECT model_id FROM usage_records WHERE deduction_id = ?1",
                    rusqlite::params![deduction_id],
                    |row| row.get(0),
                )
                .optional()?;
            let delta = SummaryDelta {
                credits_reversed: amount,
                ..SummaryDelta::default()
            };
            upsert_daily_summary(
                &tx,
                &user_id,
                &day_key(now_ms),
                model_id.as_deref().unwrap_or("unknown"),
                &delta,
            )?;

            tx.commit()?;
            Ok(ReversalOutcome::Reversed {
                deduction_id,
                amount,
                balance_after,
            })
        })
        .await?
    }

    /// Appends an allocation row and credits the balance in the same
    /// transaction, keeping grants and the balance in lockstep. Exactly
    /// once per grant id: a repeat call for an already-committed grant
    /// returns the current balance without crediting again, which is
    /// what makes timed-out grants safely retryable.
    pub async fn grant_credits(
        &self,
        user_id: &str,
        grant_id: &str,
        amount: u64,
        source: &str,
        granted_by: Option<&str>,
    ) -> Result<i64> {
        if amount == 0 {
            return Err(LedgerError::InvalidArgument(
                "grant amount must be positive".to_string(),
            ));
        }
        let amount = credits_to_amount(amount)?;
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        let user_id = user_id.to_string();
        let grant_id = grant_id.to_string();
        let source = source.to_string();
        let granted_by = granted_by.map(str::to_string);

        tokio::task::spawn_blocking(move || -> Result<i64> {
            let mut conn = open_connection(path, busy_timeout)?;
            init_schema(&conn)?;
            let now_ms = now_millis();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let existing: Option<i64> = tx
                .query_row(
                    "SELECT id FROM allocations WHERE grant_id = ?1",
                    rusqlite::params![grant_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(allocation_id) = existing {
                let (balance, _) = read_balance_row(&tx, &user_id)?;
                tracing::info!(
                    %grant_id,
                    allocation_id,
                    "duplicate grant, returning committed balance"
                );
                return Ok(balance);
            }

            ensure_balance_row(&tx, &user_id, now_ms)?;
            let (balance_before, _) = read_balance_row(&tx, &user_id)?;
            let balance_after = balance_before.saturating_add(amount);
            tx.execute(
                "UPDATE balances SET amount = ?2, updated_at_ms = ?3 WHERE user_id = ?1",
                rusqlite::params![user_id, balance_after, now_ms],
            )?;
            tx.execute(
                "INSERT INTO allocations (user_id, grant_id, amount, source, granted_by, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![user_id, grant_id, amount, source, granted_by, now_ms],
            )?;

            tx.commit()?;
            Ok(balance_after)
        })
        .await?
    }

    /// Usage record committed for a request id, if any.
    pub async fn usage_record_by_request(
        &self,
        request_id: &str,
    ) -> Result<Option<crate::records::UsageRecord>> {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        let request_id = request_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<crate::records::UsageRecord>> {
            let conn = open_connection(path, busy_timeout)?;
            init_schema(&conn)?;
            let record = conn
                .query_row(
                    "SELECT id, user_id, request_id, provider_id, model_id, input_tokens,
                            output_tokens, cached_input_tokens, vendor_cost_usd_micros,
                            multiplier_bps, credits_deducted, margin_usd_micros,
                            usage_recognized, deduction_id, created_at_ms
                     FROM usage_records
                     WHERE request_id = ?1",
                    rusqlite::params![request_id],
                    |row| {
                        Ok(crate::records::UsageRecord {
                            id: row.get(0)?,
                            user_id: row.get(1)?,
                            request_id: row.get(2)?,
                            provider_id: row.get(3)?,
                            model_id: row.get(4)?,
                            input_tokens: row.get::<_, i64>(5)?.max(0) as u64,
                            output_tokens: row.get::<_, i64>(6)?.max(0) as u64,
                            cached_input_tokens: row.get::<_, i64>(7)?.max(0) as u64,
                            vendor_cost_usd_micros: row.get::<_, i64>(8)?.max(0) as u64,
                            multiplier_bps: row.get::<_, i64>(9)?.clamp(0, i64::from(u32::MAX))
                                as u32,
                            credits_deducted: row.get(10)?,
                            margin_usd_micros: row.get::<_, i64>(11)?.max(0) as u64,
                            usage_recognized: row.get::<_, i64>(12)? != 0,
                            deduction_id: row.get(13)?,
                            created_at_ms: row.get(14)?,
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
        .await?
    }

    /// Full balance row, including the last-deduction bookkeeping fields.
    pub async fn balance(&self, user_id: &str) -> Result<Option<crate::records::BalanceRecord>> {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        let user_id = user_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<Option<crate::records::BalanceRecord>> {
            let conn = open_connection(path, busy_timeout)?;
            init_schema(&conn)?;
            let record = conn
                .query_row(
                    "SELECT user_id, amount, last_deduction_amount, last_deduction_at_ms,
                            frozen, updated_at_ms
                     FROM balances WHERE user_id = ?1",
                    rusqlite::params![user_id],
                    |row| {
                        Ok(crate::records::BalanceRecord {
                            user_id: row.get(0)?,
                            amount: row.get(1)?,
                            last_deduction_amount: row.get(2)?,
                            last_deduction_at_ms: row.get(3)?,
                            frozen: row.get::<_, i64>(4)? != 0,
                            updated_at_ms: row.get(5)?,
                        })
                    },
                )
                .optional()?;
            Ok(record)
        })
        .await?
    }

    /// Allocation history for a user, newest first.
    pub async fn allocations(
        &self,
        user_id: &str,
        page: Page,
    ) -> Result<Vec<crate::records::AllocationRecord>> {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        let user_id = user_id.to_string();
        let limit = i64::from(page.limit.clamp(1, MAX_PAGE_LIMIT));
        let offset = i64::from(page.offset);

        tokio::task::spawn_blocking(move || -> Result<Vec<crate::records::AllocationRecord>> {
            let conn = open_connection(path, busy_timeout)?;
            init_schema(&conn)?;
            let mut stmt = conn.prepare(
                "SELECT id, user_id, grant_id, amount, source, granted_by, created_at_ms
                 FROM allocations
                 WHERE user_id = ?1
                 ORDER BY id DESC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id, limit, offset], |row| {
                Ok(crate::records::AllocationRecord {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    grant_id: row.get(2)?,
                    amount: row.get(3)?,
                    source: row.get(4)?,
                    granted_by: row.get(5)?,
                    created_at_ms: row.get(6)?,
                })
            })?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?
    }

    /// Current credit balance; 0 for users with no balance row.
    pub async fn current_balance(&self, user_id: &str) -> Result<i64> {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        let user_id = user_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<i64> {
            let conn = open_connection(path, busy_timeout)?;
            init_schema(&conn)?;
            let amount: Option<i64> = conn
                .query_row(
                    "SELECT amount FROM balances WHERE user_id = ?1",
                    rusqlite::params![user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(amount.unwrap_or(0))
        })
        .await?
    }

    /// Deduction records for a user, newest first.
    pub async fn deduction_history(
        &self,
        user_id: &str,
        page: Page,
    ) -> Result<Vec<DeductionRecord>> {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        let user_id = user_id.to_string();
        let limit = i64::from(page.limit.clamp(1, MAX_PAGE_LIMIT));
        let offset = i64::from(page.offset);

        tokio::task::spawn_blocking(move || -> Result<Vec<DeductionRecord>> {
            let conn = open_connection(path, busy_timeout)?;
            init_schema(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT id, user_id, request_id, amount, balance_before, balance_after,
                        reason, status, reversed_at_ms, reversed_by, reversal_reason,
                        created_at_ms
                 FROM deduction_records
                 WHERE user_id = ?1
                 ORDER BY id DESC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(rusqlite::params![user_id, limit, offset], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, Option<i64>>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, Option<String>>(10)?,
                    row.get::<_, i64>(11)?,
                ))
            })?;

            let mut out = Vec::new();
            for row in rows {
                let (
                    id,
                    user_id,
                    request_id,
                    amount,
                    balance_before,
                    balance_after,
                    reason,
                    status,
                    reversed_at_ms,
                    reversed_by,
                    reversal_reason,
                    created_at_ms,
                ) = row?;
                let status = DeductionStatus::parse(&status).ok_or_else(|| {
                    LedgerError::DataIntegrity {
                        user_id: user_id.clone(),
                        detail: format!("deduction {id} has unknown status {status:?}"),
                    }
                })?;
                out.push(DeductionRecord {
                    id,
                    user_id,
                    request_id,
                    amount,
                    balance_before,
                    balance_after,
                    reason,
                    status,
                    reversed_at_ms,
                    reversed_by,
                    reversal_reason,
                    created_at_ms,
                });
            }
            Ok(out)
        })
        .await?
    }

    /// Read-optimized daily aggregates; never scans the underlying ledger.
    pub async fn daily_summaries(
        &self,
        user_id: &str,
        range: DayRange,
        page: Page,
    ) -> Result<Vec<DailySummaryRecord>> {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        let user_id = user_id.to_string();
        let limit = i64::from(page.limit.clamp(1, MAX_PAGE_LIMIT));
        let offset = i64::from(page.offset);
        let from = range.from.unwrap_or_else(|| "0000-00-00".to_string());
        let until = range.until.unwrap_or_else(|| "9999-99-99".to_string());

        tokio::task::spawn_blocking(move || -> Result<Vec<DailySummaryRecord>> {
            let conn = open_connection(path, busy_timeout)?;
            init_schema(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT user_id, day, model_id, requests, input_tokens, output_tokens,
                        credits_spent, credits_reversed, vendor_cost_usd_micros
                 FROM daily_summaries
                 WHERE user_id = ?1 AND day >= ?2 AND day <= ?3
                 ORDER BY day DESC, model_id
                 LIMIT ?4 OFFSET ?5",
            )?;
            let rows = stmt.query_map(
                rusqlite::params![user_id, from, until, limit, offset],
                |row| {
                    Ok(DailySummaryRecord {
                        user_id: row.get(0)?,
                        day: row.get(1)?,
                        model_id: row.get(2)?,
                        requests: row.get(3)?,
                        input_tokens: row.get(4)?,
                        output_tokens: row.get(5)?,
                        credits_spent: row.get(6)?,
                        credits_reversed: row.get(7)?,
                        vendor_cost_usd_micros: row.get(8)?,
                    })
                },
            )?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?
    }

    pub async fn load_pricing_configs(&self) -> Result<Vec<PricingConfig>> {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;

        tokio::task::spawn_blocking(move || -> Result<Vec<PricingConfig>> {
            let conn = open_connection(path, busy_timeout)?;
            init_schema(&conn)?;

            let mut stmt = conn.prepare(
                "SELECT id, tier, provider_id, model_id, multiplier_bps,
                        effective_from_ms, effective_until_ms, active
                 FROM pricing_configs
                 ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(PricingConfig {
                    id: row.get(0)?,
                    tier: row.get(1)?,
                    provider_id: row.get(2)?,
                    model_id: row.get(3)?,
                    multiplier_bps: row.get::<_, i64>(4)?.clamp(0, i64::from(u32::MAX)) as u32,
                    effective_from_ms: row.get(5)?,
                    effective_until_ms: row.get(6)?,
                    active: row.get::<_, i64>(7)? != 0,
                })
            })?;

            let mut out = Vec::new();
            for row in rows {
                out.push(row?);
            }
            Ok(out)
        })
        .await?
    }

    /// Inserts a new versioned pricing configuration and returns its id.
    pub async fn insert_pricing_config(&self, config: PricingConfig) -> Result<i64> {
        if config.multiplier_bps == 0 {
            return Err(LedgerError::InvalidArgument(
                "multiplier_bps must be positive".to_string(),
            ));
        }
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;

        tokio::task::spawn_blocking(move || -> Result<i64> {
            let conn = open_connection(path, busy_timeout)?;
            init_schema(&conn)?;
            conn.execute(
                "INSERT INTO pricing_configs
                     (tier, provider_id, model_id, multiplier_bps,
                      effective_from_ms, effective_until_ms, active, created_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    config.tier,
                    config.provider_id,
                    config.model_id,
                    i64::from(config.multiplier_bps),
                    config.effective_from_ms,
                    config.effective_until_ms,
                    config.active as i64,
                    now_millis()
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await?
    }

    /// Recomputes the ledger invariants for one user. On violation the
    /// balance is frozen (halting further deductions) and `DataIntegrity`
    /// is returned; nothing is ever auto-corrected.
    pub async fn reconcile_user(&self, user_id: &str) -> Result<ReconcileReport> {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        let user_id = user_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<ReconcileReport> {
            let mut conn = open_connection(path, busy_timeout)?;
            init_schema(&conn)?;
            let now_ms = now_millis();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let balance: i64 = tx
                .query_row(
                    "SELECT amount FROM balances WHERE user_id = ?1",
                    rusqlite::params![user_id],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0);
            let allocated: i64 = tx.query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM allocations WHERE user_id = ?1",
                rusqlite::params![user_id],
                |row| row.get(0),
            )?;
            let deducted: i64 = tx.query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM deduction_records WHERE user_id = ?1",
                rusqlite::params![user_id],
                |row| row.get(0),
            )?;
            let reversed: i64 = tx.query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM deduction_records
                 WHERE user_id = ?1 AND status = 'reversed'",
                rusqlite::params![user_id],
                |row| row.get(0),
            )?;
            let broken_row: Option<i64> = tx
                .query_row(
                    "SELECT id FROM deduction_records
                     WHERE user_id = ?1 AND balance_after != balance_before - amount
                     LIMIT 1",
                    rusqlite::params![user_id],
                    |row| row.get(0),
                )
                .optional()?;

            let expected = allocated - deducted + reversed;
            let detail = if let Some(id) = broken_row {
                Some(format!("deduction {id}: balance_after != balance_before - amount"))
            } else if balance != expected {
                Some(format!(
                    "balance {balance} != allocations - deductions + reversals ({expected})"
                ))
            } else if balance < 0 {
                Some(format!("negative balance {balance}"))
            } else {
                None
            };

            if let Some(detail) = detail {
                tx.execute(
                    "UPDATE balances SET frozen = 1, updated_at_ms = ?2 WHERE user_id = ?1",
                    rusqlite::params![user_id, now_ms],
                )?;
                tx.commit()?;
                tracing::error!(user_id = %user_id, %detail, "ledger integrity violation, balance frozen");
                return Err(LedgerError::DataIntegrity { user_id, detail });
            }

            tx.commit()?;
            Ok(ReconcileReport {
                user_id,
                balance,
                allocated,
                deducted,
                reversed,
            })
        })
        .await?
    }

    /// Manual-review escape hatch for a frozen balance.
    pub async fn set_frozen(&self, user_id: &str, frozen: bool) -> Result<()> {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        let user_id = user_id.to_string();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut conn = open_connection(path, busy_timeout)?;
            init_schema(&conn)?;
            let now_ms = now_millis();
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            ensure_balance_row(&tx, &user_id, now_ms)?;
            tx.execute(
                "UPDATE balances SET frozen = ?2, updated_at_ms = ?3 WHERE user_id = ?1",
                rusqlite::params![user_id, frozen as i64, now_ms],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }
}

fn insert_usage_record(
    tx: &rusqlite::Transaction<'_>,
    args: &DeductionArgs,
    amount: i64,
    now_ms: i64,
) -> Result<i64> {
    tx.execute(
        "INSERT INTO usage_records
             (user_id, request_id, provider_id, model_id, input_tokens, output_tokens,
              cached_input_tokens, vendor_cost_usd_micros, multiplier_bps,
              credits_deducted, margin_usd_micros, usage_recognized, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        rusqlite::params![
            args.user_id,
            args.request_id,
            args.usage.provider_id,
            args.usage.model_id,
            clamp_i64(args.usage.input_tokens),
            clamp_i64(args.usage.output_tokens),
            clamp_i64(args.usage.cached_input_tokens),
            clamp_i64(args.usage.vendor_cost_usd_micros),
            i64::from(args.usage.multiplier_bps),
            amount,
            clamp_i64(args.usage.margin_usd_micros),
            args.usage.usage_recognized as i64,
            now_ms
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

#[allow(clippy::too_many_arguments)]
fn insert_deduction_record(
    tx: &rusqlite::Transaction<'_>,
    user_id: &str,
    request_id: &str,
    amount: i64,
    balance_before: i64,
    balance_after: i64,
    reason: &str,
    now_ms: i64,
) -> Result<i64> {
    tx.execute(
        "INSERT INTO deduction_records
             (user_id, request_id, amount, balance_before, balance_after,
              reason, status, created_at_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            user_id,
            request_id,
            amount,
            balance_before,
            balance_after,
            reason,
            DeductionStatus::Completed.as_str(),
            now_ms
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

fn upsert_daily_summary(
    tx: &rusqlite::Transaction<'_>,
    user_id: &str,
    day: &str,
    model_id: &str,
    delta: &SummaryDelta,
) -> Result<()> {
    tx.execute(
        "INSERT INTO daily_summaries
             (user_id, day, model_id, requests, input_tokens, output_tokens,
              credits_spent, credits_reversed, vendor_cost_usd_micros)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(user_id, day, model_id) DO UPDATE SET
             requests = requests + excluded.requests,
             input_tokens = input_tokens + excluded.input_tokens,
             output_tokens = output_tokens + excluded.output_tokens,
             credits_spent = credits_spent + excluded.credits_spent,
             credits_reversed = credits_reversed + excluded.credits_reversed,
             vendor_cost_usd_micros = vendor_cost_usd_micros + excluded.vendor_cost_usd_micros",
        rusqlite::params![
            user_id,
            day,
            model_id,
            delta.requests,
            delta.input_tokens,
            delta.output_tokens,
            delta.credits_spent,
            delta.credits_reversed,
            delta.vendor_cost_usd_micros
        ],
    )?;
    Ok(())
}

fn ensure_balance_row(tx: &rusqlite::Transaction<'_>, user_id: &str, now_ms: i64) -> Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO balances (user_id, amount, frozen, updated_at_ms)
         VALUES (?1, 0, 0, ?2)",
        rusqlite::params![user_id, now_ms],
    )?;
    Ok(())
}

fn read_balance_row(tx: &rusqlite::Transaction<'_>, user_id: &str) -> Result<(i64, bool)> {
    let (amount, frozen): (i64, i64) = tx.query_row(
        "SELECT amount, frozen FROM balances WHERE user_id = ?1",
        rusqlite::params![user_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    Ok((amount, frozen != 0))
}

/// Reconstructs the receipt for an already-committed request, if any.
fn find_receipt(
    tx: &rusqlite::Transaction<'_>,
    request_id: &str,
) -> Result<Option<DeductionReceipt>> {
    let row: Option<(i64, Option<i64>)> = tx
        .query_row(
            "SELECT id, deduction_id FROM usage_records WHERE request_id = ?1",
            rusqlite::params![request_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((usage_record_id, deduction_id)) = row else {
        return Ok(None);
    };
    let Some(deduction_id) = deduction_id else {
        // Unlinked usage records cannot exist post-commit; treat as absent
        // so the caller surfaces it through reconciliation.
        return Ok(None);
    };
    let (amount, balance_before, balance_after): (i64, i64, i64) = tx.query_row(
        "SELECT amount, balance_before, balance_after FROM deduction_records WHERE id = ?1",
        rusqlite::params![deduction_id],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )?;
    Ok(Some(DeductionReceipt {
        deduction_id,
        usage_record_id,
        balance_before,
        balance_after,
        credits_deducted: amount,
    }))
}

fn init_schema(conn: &rusqlite::Connection) -> std::result::Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS balances (
            user_id TEXT PRIMARY KEY NOT NULL,
            amount INTEGER NOT NULL DEFAULT 0,
            last_deduction_amount INTEGER,
            last_deduction_at_ms INTEGER,
            frozen INTEGER NOT NULL DEFAULT 0,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS usage_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            request_id TEXT NOT NULL UNIQUE,
            provider_id TEXT NOT NULL,
            model_id TEXT NOT NULL,
            input_tokens INTEGER NOT NULL,
            output_tokens INTEGER NOT NULL,
            cached_input_tokens INTEGER NOT NULL,
            vendor_cost_usd_micros INTEGER NOT NULL,
            multiplier_bps INTEGER NOT NULL,
            credits_deducted INTEGER NOT NULL,
            margin_usd_micros INTEGER NOT NULL,
            usage_recognized INTEGER NOT NULL DEFAULT 1,
            deduction_id INTEGER,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_records_user_id
            ON usage_records(user_id, created_at_ms);

        CREATE TABLE IF NOT EXISTS deduction_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            request_id TEXT NOT NULL,
            amount INTEGER NOT NULL,
            balance_before INTEGER NOT NULL,
            balance_after INTEGER NOT NULL,
            reason TEXT NOT NULL,
            status TEXT NOT NULL,
            reversed_at_ms INTEGER,
            reversed_by TEXT,
            reversal_reason TEXT,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_deduction_records_user_id
            ON deduction_records(user_id, id);

        CREATE TABLE IF NOT EXISTS daily_summaries (
            user_id TEXT NOT NULL,
            day TEXT NOT NULL,
            model_id TEXT NOT NULL,
            requests INTEGER NOT NULL DEFAULT 0,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            credits_spent INTEGER NOT NULL DEFAULT 0,
            credits_reversed INTEGER NOT NULL DEFAULT 0,
            vendor_cost_usd_micros INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (user_id, day, model_id)
        );

        CREATE TABLE IF NOT EXISTS pricing_configs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tier TEXT,
            provider_id TEXT,
            model_id TEXT,
            multiplier_bps INTEGER NOT NULL,
            effective_from_ms INTEGER NOT NULL,
            effective_until_ms INTEGER,
            active INTEGER NOT NULL DEFAULT 1,
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS allocations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            grant_id TEXT NOT NULL UNIQUE,
            amount INTEGER NOT NULL,
            source TEXT NOT NULL,
            granted_by TEXT,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_allocations_user_id
            ON allocations(user_id);",
    )?;
    Ok(())
}

fn open_connection(
    path: PathBuf,
    busy_timeout: Duration,
) -> std::result::Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

pub(crate) fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

fn credits_to_amount(credits: u64) -> Result<i64> {
    i64::try_from(credits)
        .map_err(|_| LedgerError::InvalidArgument(format!("credit amount {credits} out of range")))
}

fn clamp_i64(value: u64) -> i64 {
    if value > i64::MAX as u64 {
        i64::MAX
    } else {
        value as i64
    }
}
