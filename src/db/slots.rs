//! Sponsorship slot allocator.
//!
//! This module is the only writer of `sponsorship_reservations`. Reservations
//! for one (campaign, date) are serialized by touching that day's row in
//! `sponsorship_day_locks` before reading the active reservations: the touch
//! takes the store's write lock, so a concurrent allocator for the same day
//! waits until this transaction commits or rolls back and then sees its rows.
//! The partial unique index on active (campaign, date, day-part) rows backs
//! this up.
use super::model::Reservation;
use crate::error::{LedgerError, Result};
use crate::model::{from_cents, to_cents, DayPart};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ReservationRequest<'a> {
    pub campaign_id: i64,
    pub date: NaiveDate,
    pub slot_label: &'a str,
    pub tier_label: Option<&'a str>,
    pub gift_line_id: i64,
    pub workflow_id: Uuid,
    pub required_amount: Decimal,
}

pub fn parse_slot_label(label: &str) -> Result<DayPart> {
    DayPart::from_slot_label(label).ok_or_else(|| {
        LedgerError::validation(
            "slot_label",
            format!("{label:?} does not name a full day, AM or PM slot"),
        )
    })
}

/// Apply the booking rules to the active day-parts of one campaign day.
/// Returns the day-part that blocks the request, if any.
///
/// FULL is exclusive; AM and PM are independent and each single-booked.
pub fn check_booking(existing: &[DayPart], requested: DayPart) -> std::result::Result<(), DayPart> {
    if existing.contains(&DayPart::Full) {
        return Err(DayPart::Full);
    }
    if requested == DayPart::Full {
        if let Some(taken) = existing.first() {
            return Err(*taken);
        }
    }
    if existing.contains(&requested) {
        return Err(requested);
    }
    Ok(())
}

/// Reserve a day-part for a gift line inside the caller's transaction.
#[instrument(skip_all, fields(campaign_id = req.campaign_id, date = %req.date, gift_line_id = req.gift_line_id))]
pub async fn reserve(tx: &mut Transaction<'_, Sqlite>, req: &ReservationRequest<'_>) -> Result<i64> {
    let requested = parse_slot_label(req.slot_label)?;
    let required_cents = to_cents("required_amount", req.required_amount.max(Decimal::ZERO))?;

    lock_day(tx, req.campaign_id, req.date).await?;
    let existing = active_day_parts(tx, req.campaign_id, req.date).await?;
    debug!(?existing, %requested, "evaluating booking rules");

    if let Err(existing) = check_booking(&existing, requested) {
        warn!(%requested, %existing, "sponsorship slot already booked");
        return Err(LedgerError::BookingConflict {
            campaign_id: req.campaign_id,
            date: req.date,
            requested,
            existing,
        });
    }

    let inserted = sqlx::query(
        "INSERT INTO sponsorship_reservations \
            (campaign_id, sponsored_on, day_part, slot_label, tier_label, required_amount_cents, \
             gift_line_id, workflow_id, created_at, is_cancelled) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0) RETURNING id",
    )
    .bind(req.campaign_id)
    .bind(req.date)
    .bind(requested.as_str())
    .bind(req.slot_label)
    .bind(req.tier_label)
    .bind(required_cents)
    .bind(req.gift_line_id)
    .bind(req.workflow_id.to_string())
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await;

    let row = match inserted {
        Ok(row) => row,
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            warn!(%requested, "active reservation index rejected insert");
            return Err(LedgerError::BookingConflict {
                campaign_id: req.campaign_id,
                date: req.date,
                requested,
                existing: requested,
            });
        }
        Err(err) => return Err(err.into()),
    };
    let id: i64 = row.get("id");
    info!(reservation_id = id, day_part = %requested, "sponsorship reserved");
    Ok(id)
}

/// Cancel the active reservations held by a gift line. The rows stay for
/// history; the day-part becomes available again.
#[instrument(skip_all, fields(gift_line_id = gift_line_id))]
pub async fn release(
    tx: &mut Transaction<'_, Sqlite>,
    gift_line_id: i64,
    cancelled_by: &str,
    reason: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE sponsorship_reservations \
         SET is_cancelled = 1, cancelled_at = ?, cancelled_by = ?, cancel_reason = ? \
         WHERE gift_line_id = ? AND is_cancelled = 0",
    )
    .bind(Utc::now())
    .bind(cancelled_by)
    .bind(reason)
    .bind(gift_line_id)
    .execute(&mut **tx)
    .await?;
    let released = result.rows_affected();
    if released > 0 {
        info!(released, reason, "sponsorship released");
    }
    Ok(released)
}

async fn lock_day(tx: &mut Transaction<'_, Sqlite>, campaign_id: i64, date: NaiveDate) -> Result<()> {
    sqlx::query(
        "INSERT INTO sponsorship_day_locks (campaign_id, sponsored_on, locked_at) VALUES (?, ?, ?) \
         ON CONFLICT(campaign_id, sponsored_on) DO UPDATE SET locked_at = excluded.locked_at",
    )
    .bind(campaign_id)
    .bind(date)
    .bind(Utc::now())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn active_day_parts(
    tx: &mut Transaction<'_, Sqlite>,
    campaign_id: i64,
    date: NaiveDate,
) -> Result<Vec<DayPart>> {
    let raw: Vec<String> = sqlx::query_scalar(
        "SELECT day_part FROM sponsorship_reservations \
         WHERE campaign_id = ? AND sponsored_on = ? AND is_cancelled = 0 ORDER BY id",
    )
    .bind(campaign_id)
    .bind(date)
    .fetch_all(&mut **tx)
    .await?;
    raw.iter()
        .map(|s| DayPart::parse(s).ok_or_else(|| LedgerError::corrupt("day_part", s)))
        .collect()
}

pub(crate) const RESERVATION_COLUMNS: &str = "id, campaign_id, sponsored_on, day_part, slot_label, tier_label, \
     required_amount_cents, gift_line_id, workflow_id, created_at, is_cancelled, cancelled_at, \
     cancelled_by, cancel_reason";

pub(crate) fn reservation_from_row(row: &SqliteRow) -> Result<Reservation> {
    let day_part: String = row.try_get("day_part")?;
    let workflow_id: String = row.try_get("workflow_id")?;
    Ok(Reservation {
        id: row.try_get("id")?,
        campaign_id: row.try_get("campaign_id")?,
        sponsored_on: row.try_get("sponsored_on")?,
        day_part: DayPart::parse(&day_part).ok_or_else(|| LedgerError::corrupt("day_part", &day_part))?,
        slot_label: row.try_get("slot_label")?,
        tier_label: row.try_get("tier_label")?,
        required_amount: from_cents(row.try_get("required_amount_cents")?),
        gift_line_id: row.try_get("gift_line_id")?,
        workflow_id: Uuid::parse_str(&workflow_id)
            .map_err(|_| LedgerError::corrupt("workflow_id", &workflow_id))?,
        created_at: row.try_get("created_at")?,
        is_cancelled: row.try_get("is_cancelled")?,
        cancelled_at: row.try_get("cancelled_at")?,
        cancelled_by: row.try_get("cancelled_by")?,
        cancel_reason: row.try_get("cancel_reason")?,
    })
}
