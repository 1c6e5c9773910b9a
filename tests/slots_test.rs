use chrono::NaiveDate;
use donation_ledger::cancel::CancellationToken;
use donation_ledger::config;
use donation_ledger::db::{self, deletion, ledger, query, schema, slots, Pool};
use donation_ledger::error::{LedgerError, Result};
use donation_ledger::model::{
    Actor, ConstituentSnapshot, DayPart, GiftLine, SponsorshipRequest, WorkflowRecord,
    WorkflowStatus,
};
use rust_decimal::Decimal;
use tempfile::TempDir;

async fn setup_pool() -> (TempDir, Pool) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("ledger.db").display());
    let pool = db::init_pool(&url, &config::Database::default())
        .await
        .unwrap();
    schema::ensure(&pool).await.unwrap();
    (dir, pool)
}

fn june_first() -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, 1).unwrap()
}

fn sponsorship(campaign_id: i64, date: NaiveDate, label: &str, amount: i64) -> WorkflowRecord {
    let mut record = WorkflowRecord::new(
        ConstituentSnapshot {
            id: 900 + amount,
            name: format!("Sponsor {amount}"),
        },
        &Actor::new("op", "desk-2"),
    );
    let mut gift = GiftLine::one_time(Decimal::from(amount), date);
    gift.campaign_id = Some(campaign_id);
    gift.sponsorship = Some(SponsorshipRequest {
        date,
        slot_label: label.into(),
        tier_label: None,
        threshold_override: None,
    });
    record.gift = Some(gift);
    record.status = WorkflowStatus::Committed;
    record
}

async fn book(pool: &Pool, record: &WorkflowRecord) -> Result<i64> {
    let outcome = ledger::save(pool, record, &CancellationToken::new()).await?;
    Ok(outcome.reservation_id.unwrap_or_default())
}

fn expect_conflict(result: Result<i64>, existing: DayPart) {
    match result {
        Err(LedgerError::BookingConflict { existing: got, .. }) => assert_eq!(got, existing),
        other => panic!("expected booking conflict on {existing}, got {other:?}"),
    }
}

#[tokio::test]
async fn full_day_then_half_day_then_release_and_rebook() {
    let (_dir, pool) = setup_pool().await;
    let date = june_first();
    let admin = Actor::new("admin", "office-1");

    let full = sponsorship(1, date, "Full day", 2000);
    book(&pool, &full).await.unwrap();

    let rejected = sponsorship(1, date, "Half-day AM", 1000);
    let err = book(&pool, &rejected).await.unwrap_err();
    assert!(err.to_string().contains("already booked (FULL)"));
    // the rejected save rolled back completely
    let err = query::load_workflow(&pool, rejected.workflow_id)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::NotFound { .. }));

    deletion::mark_deleted(
        &pool,
        full.workflow_id,
        &admin,
        "sponsor withdrew",
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    let history = query::reservations_for_workflow(&pool, full.workflow_id)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].is_cancelled);
    assert_eq!(history[0].cancelled_by.as_deref(), Some("admin@office-1"));

    let retry = sponsorship(1, date, "Half-day AM", 1000);
    book(&pool, &retry).await.unwrap();
    assert_eq!(
        query::reserved_day_parts(&pool, 1, date).await.unwrap(),
        vec![DayPart::Am]
    );
}

#[tokio::test]
async fn halves_coexist_and_block_full() {
    let (_dir, pool) = setup_pool().await;
    let date = june_first();

    book(&pool, &sponsorship(1, date, "Half-day AM", 500)).await.unwrap();
    expect_conflict(book(&pool, &sponsorship(1, date, "Full day", 600)).await, DayPart::Am);
    expect_conflict(book(&pool, &sponsorship(1, date, "am slot", 700)).await, DayPart::Am);
    book(&pool, &sponsorship(1, date, "Half-day PM", 800)).await.unwrap();
    expect_conflict(book(&pool, &sponsorship(1, date, "Half-day PM", 900)).await, DayPart::Pm);

    // other campaigns and dates are unaffected
    book(&pool, &sponsorship(2, date, "Full day", 1000)).await.unwrap();
    let next_day = date.succ_opt().unwrap();
    book(&pool, &sponsorship(1, next_day, "Full day", 1100)).await.unwrap();

    let mut parts = query::reserved_day_parts(&pool, 1, date).await.unwrap();
    parts.sort();
    assert_eq!(parts, vec![DayPart::Am, DayPart::Pm]);

    let booked = query::fully_booked_dates(&pool, 1, date, next_day.succ_opt().unwrap())
        .await
        .unwrap();
    assert_eq!(booked, vec![date, next_day]);
    let active = query::reservations_between(&pool, 1, date, next_day)
        .await
        .unwrap();
    assert_eq!(active.len(), 3);
}

#[tokio::test]
async fn unrecognized_slot_label_is_rejected() {
    let (_dir, pool) = setup_pool().await;
    let err = book(&pool, &sponsorship(1, june_first(), "Evening gala", 100))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Validation { field: "slot_label", .. }));
}

#[tokio::test]
async fn threshold_override_is_recorded_as_required_amount() {
    let (_dir, pool) = setup_pool().await;
    let mut record = sponsorship(1, june_first(), "Full day", 150);
    if let Some(s) = record.gift.as_mut().and_then(|g| g.sponsorship.as_mut()) {
        s.threshold_override = Some(Decimal::from(2500));
        s.tier_label = Some("Platinum".into());
    }
    book(&pool, &record).await.unwrap();
    let reservations = query::reservations_between(&pool, 1, june_first(), june_first())
        .await
        .unwrap();
    assert_eq!(reservations[0].required_amount, Decimal::from(2500));
    assert_eq!(reservations[0].tier_label.as_deref(), Some("Platinum"));
    assert_eq!(reservations[0].workflow_id, record.workflow_id);
}

#[tokio::test]
async fn active_index_rejects_duplicate_rows_inserted_directly() {
    let (_dir, pool) = setup_pool().await;
    let insert = "INSERT INTO sponsorship_reservations (campaign_id, sponsored_on, day_part, \
        slot_label, required_amount_cents, workflow_id, created_at, is_cancelled) \
        VALUES (1, '2025-06-01', 'FULL', 'Full day', 0, 'w', '2025-01-01T00:00:00Z', ?)";
    sqlx::query(insert).bind(0).execute(&pool).await.unwrap();
    // cancelled rows do not count
    sqlx::query(insert).bind(1).execute(&pool).await.unwrap();
    let err = sqlx::query(insert).bind(0).execute(&pool).await.unwrap_err();
    match err {
        sqlx::Error::Database(db_err) => assert!(db_err.is_unique_violation()),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_full_day_bookings_admit_exactly_one() {
    let (_dir, pool) = setup_pool().await;
    let a = sponsorship(5, june_first(), "Full day", 2000);
    let b = sponsorship(5, june_first(), "Full day", 2100);

    let (ra, rb) = {
        let pa = pool.clone();
        let pb = pool.clone();
        let ta = tokio::spawn(async move { book(&pa, &a).await });
        let tb = tokio::spawn(async move { book(&pb, &b).await });
        futures::future::join(ta, tb).await
    };
    let results = [ra.unwrap(), rb.unwrap()];

    let successes = results.iter().filter(|r| r.is_ok()).count();
    let conflicts = results
        .iter()
        .filter(|r| matches!(r, Err(e) if e.is_booking_conflict()))
        .count();
    assert_eq!(successes, 1, "results: {results:?}");
    assert_eq!(conflicts, 1, "results: {results:?}");
    assert_eq!(
        query::reserved_day_parts(&pool, 5, june_first()).await.unwrap(),
        vec![DayPart::Full]
    );
}

#[tokio::test]
async fn reserve_inside_an_open_transaction() {
    let (_dir, pool) = setup_pool().await;
    let record = sponsorship(3, june_first(), "Half-day PM", 300);
    let mut plain = record.clone();
    if let Some(gift) = plain.gift.as_mut() {
        gift.sponsorship = None;
    }
    let saved = ledger::save(&pool, &plain, &CancellationToken::new())
        .await
        .unwrap();
    let gift_line_id = saved.gift_line_id.unwrap();

    let mut tx = pool.begin().await.unwrap();
    let request = slots::ReservationRequest {
        campaign_id: 3,
        date: june_first(),
        slot_label: "Half-day PM",
        tier_label: None,
        gift_line_id,
        workflow_id: record.workflow_id,
        required_amount: Decimal::from(300),
    };
    slots::reserve(&mut tx, &request).await.unwrap();
    let err = slots::reserve(&mut tx, &request).await.unwrap_err();
    assert!(err.is_booking_conflict());
    // rolled back with the transaction
    drop(tx);
    assert!(query::reserved_day_parts(&pool, 3, june_first())
        .await
        .unwrap()
        .is_empty());
}
