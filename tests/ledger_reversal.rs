use std::time::Duration;

use credit_ledger::{
    DayRange, DeductionArgs, DeductionStatus, LedgerError, Page, ReversalOutcome,
    SqliteLedgerStore, UsageDraft,
};

fn store_at(dir: &tempfile::TempDir) -> SqliteLedgerStore {
    SqliteLedgerStore::new(dir.path().join("ledger.sqlite"), Duration::from_secs(5))
}

fn inference_usage() -> UsageDraft {
    UsageDraft {
        provider_id: "anthropic".to_string(),
        model_id: "claude-sonnet".to_string(),
        input_tokens: 8_000,
        output_tokens: 1_200,
        cached_input_tokens: 500,
        vendor_cost_usd_micros: 3_050_000,
        multiplier_bps: 15_000,
        margin_usd_micros: 1_525_000,
        usage_recognized: true,
    }
}

#[tokio::test]
async fn reversal_restores_balance_and_annotates_the_record() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store_at(&dir);
    store.init().await.expect("init");
    store
        .grant_credits("u1", "grant-1", 1_500, "subscription", None)
        .await
        .expect("grant");

    let receipt = store
        .deduct_atomically(DeductionArgs {
            user_id: "u1".to_string(),
            request_id: "req-1".to_string(),
            credits_to_deduct: 458,
            reason: "inference".to_string(),
            usage: inference_usage(),
        })
        .await
        .expect("deduct");
    assert_eq!(store.current_balance("u1").await.expect("balance"), 1_042);

    let outcome = store
        .reverse_deduction(receipt.deduction_id, "billing dispute", "admin-7")
        .await
        .expect("reverse");
    match outcome {
        ReversalOutcome::Reversed {
            deduction_id,
            amount,
            balance_after,
        } => {
            assert_eq!(deduction_id, receipt.deduction_id);
            assert_eq!(amount, 458);
            assert_eq!(balance_after, 1_500);
        }
        other => panic!("expected reversal, got {other:?}"),
    }
    assert_eq!(store.current_balance("u1").await.expect("balance"), 1_500);

    // The original record survives, transitioned and annotated.
    let history = store
        .deduction_history("u1", Page::first(10))
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
    let record = &history[0];
    assert_eq!(record.status, DeductionStatus::Reversed);
    assert_eq!(record.reversed_by.as_deref(), Some("admin-7"));
    assert_eq!(record.reversal_reason.as_deref(), Some("billing dispute"));
    assert!(record.reversed_at_ms.is_some());
    // The financial figures of the original deduction are untouched.
    assert_eq!(record.amount, 458);
    assert_eq!(record.balance_before, 1_500);
    assert_eq!(record.balance_after, 1_042);

    // The reversal lands in the summary as an additive delta.
    let summaries = store
        .daily_summaries("u1", DayRange::default(), Page::first(10))
        .await
        .expect("summaries");
    let summary = summaries
        .iter()
        .find(|s| s.model_id == "claude-sonnet")
        .expect("summary");
    assert_eq!(summary.credits_spent, 458);
    assert_eq!(summary.credits_reversed, 458);
}

#[tokio::test]
async fn second_reversal_is_a_no_op() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store_at(&dir);
    store.init().await.expect("init");
    store
        .grant_credits("u1", "grant-1", 500, "subscription", None)
        .await
        .expect("grant");

    let receipt = store
        .deduct_atomically(DeductionArgs {
            user_id: "u1".to_string(),
            request_id: "req-1".to_string(),
            credits_to_deduct: 200,
            reason: "inference".to_string(),
            usage: inference_usage(),
        })
        .await
        .expect("deduct");

    store
        .reverse_deduction(receipt.deduction_id, "dispute", "admin-1")
        .await
        .expect("first reversal");
    assert_eq!(store.current_balance("u1").await.expect("balance"), 500);

    let outcome = store
        .reverse_deduction(receipt.deduction_id, "dispute again", "admin-2")
        .await
        .expect("second reversal");
    assert!(matches!(
        outcome,
        ReversalOutcome::AlreadyReversed { deduction_id } if deduction_id == receipt.deduction_id
    ));
    // No double credit.
    assert_eq!(store.current_balance("u1").await.expect("balance"), 500);

    // Original annotation is preserved.
    let history = store
        .deduction_history("u1", Page::first(10))
        .await
        .expect("history");
    assert_eq!(history[0].reversed_by.as_deref(), Some("admin-1"));
}

#[tokio::test]
async fn reversing_an_unknown_deduction_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store_at(&dir);
    store.init().await.expect("init");

    let err = store.reverse_deduction(12345, "dispute", "admin-1").await;
    assert!(matches!(
        err,
        Err(LedgerError::DeductionNotFound { deduction_id: 12345 })
    ));
}

#[tokio::test]
async fn reconcile_accepts_a_ledger_with_reversals() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store_at(&dir);
    store.init().await.expect("init");
    store
        .grant_credits("u1", "grant-1", 1_000, "subscription", None)
        .await
        .expect("grant");

    let receipt = store
        .deduct_atomically(DeductionArgs {
            user_id: "u1".to_string(),
            request_id: "req-1".to_string(),
            credits_to_deduct: 300,
            reason: "inference".to_string(),
            usage: inference_usage(),
        })
        .await
        .expect("deduct");
    store
        .deduct_atomically(DeductionArgs {
            user_id: "u1".to_string(),
            request_id: "req-2".to_string(),
            credits_to_deduct: 100,
            reason: "inference".to_string(),
            usage: inference_usage(),
        })
        .await
        .expect("deduct 2");
    store
        .reverse_deduction(receipt.deduction_id, "dispute", "admin-1")
        .await
        .expect("reverse");

    let report = store.reconcile_user("u1").await.expect("reconcile");
    assert_eq!(report.balance, 900);
    assert_eq!(report.allocated, 1_000);
    assert_eq!(report.deducted, 400);
    assert_eq!(report.reversed, 300);

    // The grant is on record as an append-only allocation.
    let allocations = store
        .allocations("u1", Page::first(10))
        .await
        .expect("allocations");
    assert_eq!(allocations.len(), 1);
    assert_eq!(allocations[0].amount, 1_000);
    assert_eq!(allocations[0].source, "subscription");
}
