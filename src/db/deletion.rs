//! Soft delete with audit snapshot.
//!
//! Deleting a workflow is a two-write protocol inside one transaction: first
//! the snapshot row, then the tombstone on the gift line (plus release of its
//! sponsorship). The gift line is never physically removed.
use super::ledger::{gift_line_from_row, load_for_update, GIFT_LINE_COLUMNS};
use super::model::{DeletionOutcome, DeletionSnapshot, GiftLineRow, Reservation};
use super::slots::{self, reservation_from_row, RESERVATION_COLUMNS};
use super::{begin, commit, Pool};
use crate::cancel::CancellationToken;
use crate::error::{LedgerError, Result};
use crate::model::{from_cents, to_cents, Actor, DayPart, WorkflowRecord};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Result of deleting the gift in the remote gift API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDeleteOutcome {
    pub attempted_at: DateTime<Utc>,
    pub succeeded: bool,
    pub error: Option<String>,
}

impl RemoteDeleteOutcome {
    pub fn succeeded() -> Self {
        Self {
            attempted_at: Utc::now(),
            succeeded: true,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            attempted_at: Utc::now(),
            succeeded: false,
            error: Some(error.into()),
        }
    }
}

#[derive(Serialize)]
struct SnapshotDocument<'a> {
    workflow: &'a WorkflowRecord,
    gift_line: Option<&'a GiftLineRow>,
    reservation: Option<&'a Reservation>,
}

/// Snapshot, tombstone and release a workflow's gift. Calling it again for
/// the same workflow refreshes the deletion metadata on the existing snapshot.
#[instrument(skip_all, fields(workflow_id = %workflow_id, actor = %actor.label()))]
pub async fn mark_deleted(
    pool: &Pool,
    workflow_id: Uuid,
    actor: &Actor,
    reason: &str,
    cancel: &CancellationToken,
) -> Result<DeletionOutcome> {
    let reason = reason.trim();
    if reason.is_empty() {
        return Err(LedgerError::validation("reason", "a deletion reason is required"));
    }
    if actor.user_name.trim().is_empty() || actor.machine_name.trim().is_empty() {
        return Err(LedgerError::validation("actor", "user and machine are required"));
    }

    let mut tx = begin(pool, cancel).await?;
    let record = load_for_update(&mut tx, workflow_id).await?;
    let id = workflow_id.to_string();

    let gift = sqlx::query(&format!(
        "SELECT {GIFT_LINE_COLUMNS} FROM gift_lines WHERE workflow_id = ? \
         ORDER BY is_deleted ASC, id DESC LIMIT 1"
    ))
    .bind(&id)
    .fetch_optional(&mut *tx)
    .await?
    .map(|row| gift_line_from_row(&row))
    .transpose()?;

    let reservation = match &gift {
        Some(gift) => sqlx::query(&format!(
            "SELECT {RESERVATION_COLUMNS} FROM sponsorship_reservations WHERE gift_line_id = ? \
             ORDER BY is_cancelled ASC, id DESC LIMIT 1"
        ))
        .bind(gift.id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|row| reservation_from_row(&row))
        .transpose()?,
        None => None,
    };
    cancel.check()?;

    let existing: Option<i64> =
        sqlx::query_scalar("SELECT delete_count FROM deletion_snapshots WHERE workflow_id = ?")
            .bind(&id)
            .fetch_optional(&mut *tx)
            .await?;

    let now = Utc::now();
    let document = serde_json::to_string(&SnapshotDocument {
        workflow: &record,
        gift_line: gift.as_ref(),
        reservation: reservation.as_ref(),
    })?;

    // A repeated delete only refreshes deletion metadata here; the captured
    // state is replaced below when a re-saved live line is being deleted.
    sqlx::query(
        "INSERT INTO deletion_snapshots (workflow_id, workflow_created_at, workflow_status, \
            machine_name, user_name, search_hint, constituent_id, constituent_name, gift_line_id, \
            amount_cents, pledge_date, fund_id, campaign_id, remote_gift_id, sponsored_on, day_part, \
            snapshot_json, first_deleted_at, deleted_at, deleted_by_user, deleted_by_machine, \
            delete_reason, delete_count) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1) \
         ON CONFLICT(workflow_id) DO UPDATE SET \
            deleted_at = excluded.deleted_at, \
            deleted_by_user = excluded.deleted_by_user, \
            deleted_by_machine = excluded.deleted_by_machine, \
            delete_reason = excluded.delete_reason, \
            delete_count = deletion_snapshots.delete_count + 1",
    )
    .bind(&id)
    .bind(record.created_at)
    .bind(record.status.as_str())
    .bind(&record.machine_name)
    .bind(&record.user_name)
    .bind(&record.search_hint)
    .bind(record.constituent.id)
    .bind(&record.constituent.name)
    .bind(gift.as_ref().map(|g| g.id))
    .bind(gift.as_ref().map(|g| to_cents("amount", g.amount)).transpose()?)
    .bind(gift.as_ref().map(|g| g.pledge_date))
    .bind(gift.as_ref().and_then(|g| g.fund_id))
    .bind(gift.as_ref().and_then(|g| g.campaign_id))
    .bind(gift.as_ref().and_then(|g| g.remote_gift_id.clone()))
    .bind(reservation.as_ref().map(|r| r.sponsored_on))
    .bind(reservation.as_ref().map(|r| r.day_part.as_str()))
    .bind(&document)
    .bind(now)
    .bind(now)
    .bind(&actor.user_name)
    .bind(&actor.machine_name)
    .bind(reason)
    .execute(&mut *tx)
    .await?;

    let deletes_live_line = gift.as_ref().is_some_and(|g| !g.is_deleted);
    if existing.is_some() && deletes_live_line {
        recapture(&mut tx, &record, gift.as_ref(), reservation.as_ref(), &document).await?;
        info!("workflow re-saved since last delete; snapshot recaptured");
    }

    let mut released_reservations = 0;
    if let Some(gift) = &gift {
        sqlx::query(
            "UPDATE gift_lines SET is_deleted = 1, deleted_at = ?, deleted_by_user = ?, \
             deleted_by_machine = ?, delete_reason = ? WHERE id = ? AND is_deleted = 0",
        )
        .bind(now)
        .bind(&actor.user_name)
        .bind(&actor.machine_name)
        .bind(reason)
        .bind(gift.id)
        .execute(&mut *tx)
        .await?;
        released_reservations = slots::release(&mut tx, gift.id, &actor.label(), reason).await?;
    } else {
        warn!("workflow has no gift line; snapshot only");
    }

    commit(tx, cancel).await?;
    let outcome = DeletionOutcome {
        workflow_id,
        snapshot_created: existing.is_none(),
        gift_line_id: gift.as_ref().map(|g| g.id),
        released_reservations,
        remote_gift_id: gift.and_then(|g| g.remote_gift_id),
    };
    info!(
        snapshot_created = outcome.snapshot_created,
        released = outcome.released_reservations,
        "workflow marked deleted"
    );
    Ok(outcome)
}

/// Point an existing snapshot at the gift line being deleted now. The remote
/// delete outcome belongs to the previous line, so it is cleared.
async fn recapture(
    tx: &mut Transaction<'_, Sqlite>,
    record: &WorkflowRecord,
    gift: Option<&GiftLineRow>,
    reservation: Option<&Reservation>,
    document: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE deletion_snapshots SET workflow_status = ?, gift_line_id = ?, amount_cents = ?, pledge_date = ?, \
            fund_id = ?, campaign_id = ?, remote_gift_id = ?, sponsored_on = ?, day_part = ?, \
            snapshot_json = ?, remote_delete_attempted_at = NULL, \
            remote_delete_succeeded = NULL, remote_delete_error = NULL \
         WHERE workflow_id = ?",
    )
    .bind(record.status.as_str())
    .bind(gift.map(|g| g.id))
    .bind(gift.map(|g| to_cents("amount", g.amount)).transpose()?)
    .bind(gift.map(|g| g.pledge_date))
    .bind(gift.and_then(|g| g.fund_id))
    .bind(gift.and_then(|g| g.campaign_id))
    .bind(gift.and_then(|g| g.remote_gift_id.clone()))
    .bind(reservation.map(|r| r.sponsored_on))
    .bind(reservation.map(|r| r.day_part.as_str()))
    .bind(document)
    .bind(record.workflow_id.to_string())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Record the result of deleting the gift in the remote gift API on both the
/// snapshot and the soft-deleted gift line.
#[instrument(skip_all, fields(workflow_id = %workflow_id, succeeded = outcome.succeeded))]
pub async fn record_remote_delete_outcome(
    pool: &Pool,
    workflow_id: Uuid,
    outcome: &RemoteDeleteOutcome,
    cancel: &CancellationToken,
) -> Result<()> {
    let id = workflow_id.to_string();
    let mut tx = begin(pool, cancel).await?;
    let updated = sqlx::query(
        "UPDATE deletion_snapshots SET remote_delete_attempted_at = ?, remote_delete_succeeded = ?, \
         remote_delete_error = ? WHERE workflow_id = ?",
    )
    .bind(outcome.attempted_at)
    .bind(outcome.succeeded)
    .bind(&outcome.error)
    .bind(&id)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(LedgerError::not_found("deletion snapshot", workflow_id));
    }

    sqlx::query(
        "UPDATE gift_lines SET remote_delete_attempted_at = ?, remote_delete_succeeded = ?, \
         remote_delete_error = ? \
         WHERE id = (SELECT gift_line_id FROM deletion_snapshots WHERE workflow_id = ?)",
    )
    .bind(outcome.attempted_at)
    .bind(outcome.succeeded)
    .bind(&outcome.error)
    .bind(&id)
    .execute(&mut *tx)
    .await?;
    commit(tx, cancel).await?;

    if outcome.succeeded {
        info!("remote delete recorded");
    } else {
        warn!(error = ?outcome.error, "remote delete failed");
    }
    Ok(())
}

pub(crate) const SNAPSHOT_COLUMNS: &str = "workflow_id, workflow_created_at, workflow_status, \
     machine_name, user_name, search_hint, constituent_id, constituent_name, gift_line_id, \
     amount_cents, pledge_date, fund_id, campaign_id, remote_gift_id, sponsored_on, day_part, \
     snapshot_json, first_deleted_at, deleted_at, deleted_by_user, deleted_by_machine, \
     delete_reason, delete_count, remote_delete_attempted_at, remote_delete_succeeded, \
     remote_delete_error";

pub(crate) fn snapshot_from_row(row: &SqliteRow) -> Result<DeletionSnapshot> {
    let workflow_id: String = row.try_get("workflow_id")?;
    let day_part: Option<String> = row.try_get("day_part")?;
    let snapshot_json: String = row.try_get("snapshot_json")?;
    let amount_cents: Option<i64> = row.try_get("amount_cents")?;
    Ok(DeletionSnapshot {
        workflow_id: Uuid::parse_str(&workflow_id)
            .map_err(|_| LedgerError::corrupt("workflow_id", &workflow_id))?,
        workflow_created_at: row.try_get("workflow_created_at")?,
        workflow_status: row.try_get("workflow_status")?,
        machine_name: row.try_get("machine_name")?,
        user_name: row.try_get("user_name")?,
        search_hint: row.try_get("search_hint")?,
        constituent_id: row.try_get("constituent_id")?,
        constituent_name: row.try_get("constituent_name")?,
        gift_line_id: row.try_get("gift_line_id")?,
        amount: amount_cents.map(from_cents),
        pledge_date: row.try_get("pledge_date")?,
        fund_id: row.try_get("fund_id")?,
        campaign_id: row.try_get("campaign_id")?,
        remote_gift_id: row.try_get("remote_gift_id")?,
        sponsored_on: row.try_get("sponsored_on")?,
        day_part: day_part
            .map(|s| DayPart::parse(&s).ok_or_else(|| LedgerError::corrupt("day_part", &s)))
            .transpose()?,
        snapshot: serde_json::from_str(&snapshot_json)?,
        first_deleted_at: row.try_get("first_deleted_at")?,
        deleted_at: row.try_get("deleted_at")?,
        deleted_by_user: row.try_get("deleted_by_user")?,
        deleted_by_machine: row.try_get("deleted_by_machine")?,
        delete_reason: row.try_get("delete_reason")?,
        delete_count: row.try_get("delete_count")?,
        remote_delete_attempted_at: row.try_get("remote_delete_attempted_at")?,
        remote_delete_succeeded: row.try_get("remote_delete_succeeded")?,
        remote_delete_error: row.try_get("remote_delete_error")?,
    })
}
