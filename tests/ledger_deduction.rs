use std::time::Duration;

use credit_ledger::{
    DayRange, DeductionArgs, DeductionStatus, LedgerError, Page, SqliteLedgerStore, UsageDraft,
};

fn store_at(dir: &tempfile::TempDir) -> SqliteLedgerStore {
    SqliteLedgerStore::new(dir.path().join("ledger.sqlite"), Duration::from_secs(5))
}

fn inference_usage() -> UsageDraft {
    UsageDraft {
        provider_id: "openai".to_string(),
        model_id: "gpt-4o".to_string(),
        input_tokens: 12_000,
        output_tokens: 3_000,
        cached_input_tokens: 0,
        vendor_cost_usd_micros: 3_050_000,
        multiplier_bps: 15_000,
        margin_usd_micros: 1_525_000,
        usage_recognized: true,
    }
}

#[tokio::test]
async fn deduction_writes_linked_records_and_summary() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store_at(&dir);
    store.init().await.expect("init");

    store
        .grant_credits("u1", "grant-1", 1_500, "subscription", Some("admin-1"))
        .await
        .expect("grant");
    assert_eq!(store.current_balance("u1").await.expect("balance"), 1_500);

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

    assert_eq!(receipt.balance_before, 1_500);
    assert_eq!(receipt.balance_after, 1_042);
    assert_eq!(receipt.credits_deducted, 458);
    assert_eq!(store.current_balance("u1").await.expect("balance"), 1_042);

    // The deduction record carries the before/after pair.
    let history = store
        .deduction_history("u1", Page::first(10))
        .await
        .expect("history");
    assert_eq!(history.len(), 1);
    let record = &history[0];
    assert_eq!(record.id, receipt.deduction_id);
    assert_eq!(record.balance_before, 1_500);
    assert_eq!(record.balance_after, 1_042);
    assert_eq!(record.balance_after, record.balance_before - record.amount);
    assert_eq!(record.status, DeductionStatus::Completed);

    // Last-deduction bookkeeping on the balance row.
    let balance = store
        .balance("u1")
        .await
        .expect("balance row")
        .expect("row exists");
    assert_eq!(balance.amount, 1_042);
    assert_eq!(balance.last_deduction_amount, Some(458));
    assert!(balance.last_deduction_at_ms.is_some());
    assert!(!balance.frozen);

    // The usage record exists and is cross-linked 1:1.
    let usage = store
        .usage_record_by_request("req-1")
        .await
        .expect("usage lookup")
        .expect("usage record");
    assert_eq!(usage.deduction_id, Some(receipt.deduction_id));
    assert_eq!(usage.credits_deducted, 458);
    assert_eq!(usage.input_tokens, 12_000);
    assert!(usage.usage_recognized);

    // The daily summary reflects the additive delta for that model/day.
    let summaries = store
        .daily_summaries("u1", DayRange::default(), Page::first(10))
        .await
        .expect("summaries");
    assert_eq!(summaries.len(), 1);
    let summary = &summaries[0];
    assert_eq!(summary.model_id, "gpt-4o");
    assert_eq!(summary.requests, 1);
    assert_eq!(summary.credits_spent, 458);
    assert_eq!(summary.input_tokens, 12_000);
    assert_eq!(summary.output_tokens, 3_000);
}

#[tokio::test]
async fn summaries_accumulate_additively_per_model() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store_at(&dir);
    store.init().await.expect("init");
    store
        .grant_credits("u1", "grant-1", 10_000, "subscription", None)
        .await
        .expect("grant");

    for (request_id, model, credits) in [
        ("req-1", "gpt-4o", 100u64),
        ("req-2", "gpt-4o", 50),
        ("req-3", "gpt-4o-mini", 5),
    ] {
        let mut usage = inference_usage();
        usage.model_id = model.to_string();
        store
            .deduct_atomically(DeductionArgs {
                user_id: "u1".to_string(),
                request_id: request_id.to_string(),
                credits_to_deduct: credits,
                reason: "inference".to_string(),
                usage,
            })
            .await
            .expect("deduct");
    }

    let summaries = store
        .daily_summaries("u1", DayRange::default(), Page::first(10))
        .await
        .expect("summaries");
    assert_eq!(summaries.len(), 2);
    let big = summaries
        .iter()
        .find(|s| s.model_id == "gpt-4o")
        .expect("gpt-4o summary");
    assert_eq!(big.requests, 2);
    assert_eq!(big.credits_spent, 150);
    let small = summaries
        .iter()
        .find(|s| s.model_id == "gpt-4o-mini")
        .expect("mini summary");
    assert_eq!(small.requests, 1);
    assert_eq!(small.credits_spent, 5);
}

#[tokio::test]
async fn history_pages_newest_first() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store_at(&dir);
    store.init().await.expect("init");
    store
        .grant_credits("u1", "grant-1", 1_000, "subscription", None)
        .await
        .expect("grant");

    for i in 0..5 {
        store
            .deduct_atomically(DeductionArgs {
                user_id: "u1".to_string(),
                request_id: format!("req-{i}"),
                credits_to_deduct: 10,
                reason: "inference".to_string(),
                usage: inference_usage(),
            })
            .await
            .expect("deduct");
    }

    let first_page = store
        .deduction_history("u1", Page { limit: 2, offset: 0 })
        .await
        .expect("page 1");
    assert_eq!(first_page.len(), 2);
    assert_eq!(first_page[0].request_id, "req-4");
    assert_eq!(first_page[1].request_id, "req-3");

    let second_page = store
        .deduction_history("u1", Page { limit: 2, offset: 2 })
        .await
        .expect("page 2");
    assert_eq!(second_page[0].request_id, "req-2");
}

#[tokio::test]
async fn overdraft_is_rejected_at_exact_boundary() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = store_at(&dir);
    store.init().await.expect("init");
    store
        .grant_credits("u1", "grant-1", 100, "subscription", None)
        .await
        .expect("grant");

    // Exactly the balance succeeds.
    store
        .deduct_atomically(DeductionArgs {
            user_id: "u1".to_string(),
            request_id: "req-1".to_string(),
            credits_to_deduct: 100,
            reason: "inference".to_string(),
            usage: inference_usage(),
        })
        .await
        .expect("deduct to zero");
    assert_eq!(store.current_balance("u1").await.expect("balance"), 0);

    // One more credit does not.
    let err = store
        .deduct_atomically(DeductionArgs {
            user_id: "u1".to_string(),
            request_id: "req-2".to_string(),
            credits_to_deduct: 1,
            reason: "inference".to_string(),
            usage: inference_usage(),
        })
        .await;
    assert!(matches!(
        err,
        Err(LedgerError::InsufficientFunds {
            balance: 0,
            required: 1,
            shortfall: 1,
        })
    ));
}
