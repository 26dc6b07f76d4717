use std::time::Duration;

use credit_ledger::{
    CreditLedger, DeductionArgs, LedgerConfig, LedgerError, SqliteLedgerStore, UsageDraft,
    VendorPricingTable,
};

fn inference_usage() -> UsageDraft {
    UsageDraft {
        provider_id: "openai".to_string(),
        model_id: "gpt-4o".to_string(),
        input_tokens: 1_000,
        output_tokens: 500,
        cached_input_tokens: 0,
        vendor_cost_usd_micros: 1_250_000,
        multiplier_bps: 15_000,
        margin_usd_micros: 625_000,
        usage_recognized: true,
    }
}

/// N concurrent deductions of cost C against balance B with N*C > B must
/// yield exactly floor(B/C) successes; every other attempt fails with
/// InsufficientFunds and the balance never goes negative.
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_deductions_never_overdraft() {
    const BALANCE: u64 = 1_000;
    const COST: u64 = 200;
    const ATTEMPTS: usize = 10;

    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteLedgerStore::new(dir.path().join("ledger.sqlite"), Duration::from_secs(30));
    store.init().await.expect("init");
    store
        .grant_credits("u1", "grant-1", BALANCE, "subscription", None)
        .await
        .expect("grant");

    let mut handles = Vec::new();
    for i in 0..ATTEMPTS {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .deduct_atomically(DeductionArgs {
                    user_id: "u1".to_string(),
                    request_id: format!("req-{i}"),
                    credits_to_deduct: COST,
                    reason: "inference".to_string(),
                    usage: inference_usage(),
                })
                .await
        }));
    }

    let mut successes = 0usize;
    let mut insufficient = 0usize;
    for handle in handles {
        match handle.await.expect("join") {
            Ok(receipt) => {
                assert!(receipt.balance_after >= 0);
                assert_eq!(
                    receipt.balance_after,
                    receipt.balance_before - COST as i64
                );
                successes += 1;
            }
            Err(LedgerError::InsufficientFunds { balance, .. }) => {
                assert!((balance as i64) >= 0);
                insufficient += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(successes, (BALANCE / COST) as usize);
    assert_eq!(insufficient, ATTEMPTS - successes);
    assert_eq!(store.current_balance("u1").await.expect("balance"), 0);

    // Receipts chain: sorted by balance_before descending they tile the
    // balance without gaps, which is only possible under a total order.
    let history = store
        .deduction_history("u1", credit_ledger::Page::first(50))
        .await
        .expect("history");
    assert_eq!(history.len(), successes);
    let mut befores: Vec<i64> = history.iter().map(|r| r.balance_before).collect();
    befores.sort_unstable();
    assert_eq!(befores, vec![200, 400, 600, 800, 1_000]);

    let report = store.reconcile_user("u1").await.expect("reconcile");
    assert_eq!(report.balance, 0);
    assert_eq!(report.deducted, BALANCE as i64);
}

/// Concurrent retries of the same request id commit exactly one deduction.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_requests_charge_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteLedgerStore::new(dir.path().join("ledger.sqlite"), Duration::from_secs(30));
    store.init().await.expect("init");
    store
        .grant_credits("u1", "grant-1", 1_000, "subscription", None)
        .await
        .expect("grant");

    let mut handles = Vec::new();
    for _ in 0..6 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store
                .deduct_atomically(DeductionArgs {
                    user_id: "u1".to_string(),
                    request_id: "req-same".to_string(),
                    credits_to_deduct: 100,
                    reason: "inference".to_string(),
                    usage: inference_usage(),
                })
                .await
        }));
    }

    let mut deduction_ids = Vec::new();
    for handle in handles {
        let receipt = handle.await.expect("join").expect("deduct");
        deduction_ids.push(receipt.deduction_id);
    }
    deduction_ids.dedup();
    assert_eq!(deduction_ids.len(), 1);
    assert_eq!(store.current_balance("u1").await.expect("balance"), 900);
}

/// A timed-out grant may still commit in the background; retrying with
/// the same grant id must credit the user exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timed_out_grant_retries_credit_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("ledger.sqlite");

    let impatient = CreditLedger::open(
        LedgerConfig {
            db_path: db_path.clone(),
            transaction_timeout_ms: 0,
            ..LedgerConfig::default()
        },
        VendorPricingTable::new(),
    )
    .await
    .expect("ledger");

    let err = impatient
        .grant_credits("u1", "grant-retry", 500, "subscription", None)
        .await
        .expect_err("grant must time out");
    assert!(matches!(err, LedgerError::TransactionTimeout { .. }));
    assert!(err.is_retryable());

    // The retry races the still-running first attempt; the grant id
    // dedup lets at most one of them land.
    let patient = CreditLedger::open(
        LedgerConfig {
            db_path,
            ..LedgerConfig::default()
        },
        VendorPricingTable::new(),
    )
    .await
    .expect("ledger");
    patient
        .grant_credits("u1", "grant-retry", 500, "subscription", None)
        .await
        .expect("retry");

    // Let the detached first attempt finish before checking.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(patient.current_balance("u1").await.expect("balance"), 500);
    let allocations = patient
        .store()
        .allocations("u1", credit_ledger::Page::first(10))
        .await
        .expect("allocations");
    assert_eq!(allocations.len(), 1);
    assert_eq!(allocations[0].grant_id, "grant-retry");
}

/// A writer holding the database past the busy timeout surfaces as
/// LockTimeout instead of hanging.
#[tokio::test]
async fn contended_writer_reports_lock_timeout() {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("ledger.sqlite");
    let store = SqliteLedgerStore::new(db_path.clone(), Duration::from_millis(50));
    store.init().await.expect("init");

    let blocker = rusqlite::Connection::open(&db_path).expect("open");
    blocker
        .execute_batch("BEGIN IMMEDIATE;")
        .expect("hold write lock");

    let err = store
        .grant_credits("u1", "grant-1", 100, "subscription", None)
        .await
        .expect_err("writer is blocked");
    assert!(matches!(err, LedgerError::LockTimeout));

    blocker.execute_batch("ROLLBACK;").expect("release");
    let balance = store
        .grant_credits("u1", "grant-1", 100, "subscription", None)
        .await
        .expect("grant after release");
    assert_eq!(balance, 100);
}
