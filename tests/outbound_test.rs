use chrono::{NaiveDate, TimeZone, Utc};
use donation_ledger::cancel::CancellationToken;
use donation_ledger::config;
use donation_ledger::db::outbound::{self, EnqueueStamp, PledgeCreateRequest};
use donation_ledger::db::{self, schema, Pool};
use donation_ledger::error::LedgerError;
use donation_ledger::model::{OutboundStatus, TransactionType};
use rust_decimal::Decimal;
use serde_json::json;
use std::str::FromStr;
use tempfile::TempDir;
use uuid::Uuid;

async fn setup_pool() -> (TempDir, Pool) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
    let pool = db::init_pool(&url, &config::Database::default())
        .await
        .unwrap();
    schema::ensure(&pool).await.unwrap();
    (dir, pool)
}

fn pledge(workflow_id: Uuid, amount: &str, note: &str) -> PledgeCreateRequest {
    PledgeCreateRequest {
        workflow_id,
        constituent_id: 4242,
        amount: Decimal::from_str(amount).unwrap(),
        date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
        fund_id: Some(3),
        comments: Some(note.into()),
        request_payload: json!({ "amount": amount, "note": note }),
        client_machine: "desk-4".into(),
        client_user: "op".into(),
    }
}

#[tokio::test]
async fn re_enqueue_resets_processing_state() {
    let (_dir, pool) = setup_pool().await;
    let cancel = CancellationToken::new();
    let workflow_id = Uuid::new_v4();

    let id = outbound::enqueue_or_update_pending_pledge_create(
        &pool,
        &pledge(workflow_id, "50.00", "first"),
        &cancel,
    )
    .await
    .unwrap();
    for _ in 0..3 {
        outbound::mark_processing(&pool, id, &cancel).await.unwrap();
    }
    outbound::mark_failed(&pool, id, "timeout", &cancel).await.unwrap();
    let failed = outbound::get_transaction(&pool, workflow_id, TransactionType::PledgeCreate)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(failed.attempt_count, 3);
    assert_eq!(failed.status, OutboundStatus::Failed);
    assert!(failed.completed_at.is_some());

    let again = outbound::enqueue_or_update_pending_pledge_create(
        &pool,
        &pledge(workflow_id, "75.25", "second"),
        &cancel,
    )
    .await
    .unwrap();
    assert_eq!(again, id);

    let row = outbound::get_transaction(&pool, workflow_id, TransactionType::PledgeCreate)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, OutboundStatus::Pending);
    assert_eq!(row.attempt_count, 0);
    assert_eq!(row.request_payload["note"], "second");
    assert_eq!(row.amount, Decimal::from_str("75.25").unwrap());
    assert_eq!(row.comments.as_deref(), Some("second"));
    assert!(row.processing_started_at.is_none());
    assert!(row.completed_at.is_none());
    assert!(row.last_error.is_none());
    assert!(row.remote_id.is_none());

    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbound_transactions")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn enqueue_records_local_and_utc_time() {
    let (_dir, pool) = setup_pool().await;
    let cancel = CancellationToken::new();
    let workflow_id = Uuid::new_v4();
    let utc = Utc.with_ymd_and_hms(2025, 6, 1, 15, 30, 0).unwrap();
    let stamp = EnqueueStamp {
        utc,
        local: NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap(),
        timezone_id: "America/Chicago".into(),
        utc_offset_minutes: -300,
    };
    outbound::enqueue_with_stamp(&pool, &pledge(workflow_id, "10", "stamp"), &stamp, &cancel)
        .await
        .unwrap();

    let row = outbound::get_transaction(&pool, workflow_id, TransactionType::PledgeCreate)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.enqueued_at_utc, utc);
    assert_eq!(row.enqueued_at_local, stamp.local);
    assert_eq!(row.timezone_id, "America/Chicago");
    assert_eq!(row.utc_offset_minutes, -300);
    assert_eq!(row.client_machine, "desk-4");
    assert_eq!(row.constituent_id, 4242);
}

#[tokio::test]
async fn claim_takes_oldest_pending_first() {
    let (_dir, pool) = setup_pool().await;
    let cancel = CancellationToken::new();
    let older = Uuid::new_v4();
    let newer = Uuid::new_v4();
    let mut stamp = EnqueueStamp::now();
    stamp.utc = Utc.with_ymd_and_hms(2025, 1, 1, 8, 0, 0).unwrap();
    outbound::enqueue_with_stamp(&pool, &pledge(newer, "20", "newer"), &EnqueueStamp::now(), &cancel)
        .await
        .unwrap();
    outbound::enqueue_with_stamp(&pool, &pledge(older, "30", "older"), &stamp, &cancel)
        .await
        .unwrap();

    let first = outbound::claim_next_pending(&pool, &cancel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.workflow_id, older);
    assert_eq!(first.status, OutboundStatus::Processing);
    assert_eq!(first.attempt_count, 1);
    assert!(first.processing_started_at.is_some());

    outbound::mark_succeeded(&pool, first.id, "PLEDGE-1", &cancel)
        .await
        .unwrap();
    let second = outbound::claim_next_pending(&pool, &cancel)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.workflow_id, newer);
    assert!(outbound::claim_next_pending(&pool, &cancel)
        .await
        .unwrap()
        .is_none());

    let succeeded = outbound::list_transactions(&pool, Some(OutboundStatus::Succeeded), 10)
        .await
        .unwrap();
    assert_eq!(succeeded.len(), 1);
    assert_eq!(succeeded[0].remote_id.as_deref(), Some("PLEDGE-1"));
    assert_eq!(outbound::list_transactions(&pool, None, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn bookkeeping_on_unknown_row_is_not_found() {
    let (_dir, pool) = setup_pool().await;
    let cancel = CancellationToken::new();
    let err = outbound::mark_processing(&pool, 99, &cancel).await.unwrap_err();
    assert!(matches!(err, LedgerError::NotFound { .. }));
    let err = outbound::mark_succeeded(&pool, 99, "x", &cancel).await.unwrap_err();
    assert!(matches!(err, LedgerError::NotFound { .. }));
}

#[tokio::test]
async fn invalid_pledges_are_rejected() {
    let (_dir, pool) = setup_pool().await;
    let cancel = CancellationToken::new();
    let mut bad = pledge(Uuid::nil(), "10", "nil");
    let err = outbound::enqueue_or_update_pending_pledge_create(&pool, &bad, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Validation { field: "workflow_id", .. }));

    bad.workflow_id = Uuid::new_v4();
    bad.amount = Decimal::ZERO;
    let err = outbound::enqueue_or_update_pending_pledge_create(&pool, &bad, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Validation { field: "amount", .. }));
}
