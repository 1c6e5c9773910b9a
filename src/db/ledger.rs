//! Workflow ledger: the unit of "save".
//!
//! A save upserts the header, releases and replaces the live child rows and,
//! when the gift asks for a sponsorship, reserves the slot, all inside one
//! transaction. Re-running a save with the same record converges to the same
//! state, which is what lets the client retry a failed save blindly.
use super::model::{GiftLineRow, SaveOutcome};
use super::slots::{self, ReservationRequest};
use super::{begin, commit, Pool};
use crate::cancel::CancellationToken;
use crate::context;
use crate::error::{LedgerError, Result};
use crate::model::{
    from_cents, to_cents, GiftFrequency, GiftLine, WorkflowRecord, WorkflowStatus,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tracing::{info, instrument, warn};
use uuid::Uuid;

const RESAVE_RELEASE_REASON: &str = "superseded by re-save";

/// Result of a create call against the remote gift API, recorded after the
/// call returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCreateOutcome {
    pub attempted_at: DateTime<Utc>,
    pub remote_gift_id: Option<String>,
    pub error: Option<String>,
}

impl RemoteCreateOutcome {
    pub fn succeeded(remote_gift_id: impl Into<String>) -> Self {
        Self {
            attempted_at: Utc::now(),
            remote_gift_id: Some(remote_gift_id.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            attempted_at: Utc::now(),
            remote_gift_id: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.remote_gift_id.is_some()
    }
}

/// Persist the workflow header and replace its live child rows atomically.
#[instrument(skip_all, fields(workflow_id = %record.workflow_id))]
pub async fn save(
    pool: &Pool,
    record: &WorkflowRecord,
    cancel: &CancellationToken,
) -> Result<SaveOutcome> {
    let amount_cents = validate(record)?;
    let context_json = context::encode(record)?;

    let mut tx = begin(pool, cancel).await?;
    upsert_header(&mut tx, record, &context_json).await?;
    cancel.check()?;

    let workflow_id = record.workflow_id.to_string();
    let live_ids: Vec<i64> =
        sqlx::query_scalar("SELECT id FROM gift_lines WHERE workflow_id = ? AND is_deleted = 0")
            .bind(&workflow_id)
            .fetch_all(&mut *tx)
            .await?;
    let released_by = format!("{}@{}", record.user_name, record.machine_name);
    let mut released_reservations = 0;
    for gift_line_id in &live_ids {
        released_reservations +=
            slots::release(&mut tx, *gift_line_id, &released_by, RESAVE_RELEASE_REASON).await?;
    }
    cancel.check()?;

    sqlx::query("DELETE FROM gift_lines WHERE workflow_id = ? AND is_deleted = 0")
        .bind(&workflow_id)
        .execute(&mut *tx)
        .await?;

    let mut outcome = SaveOutcome {
        gift_line_id: None,
        reservation_id: None,
        released_reservations,
    };
    if let (Some(gift), Some(cents)) = (&record.gift, amount_cents) {
        let gift_line_id = insert_gift_line(&mut tx, record, gift, cents).await?;
        outcome.gift_line_id = Some(gift_line_id);
        cancel.check()?;

        if let (Some(sponsorship), Some(campaign_id)) = (&gift.sponsorship, gift.campaign_id) {
            let request = ReservationRequest {
                campaign_id,
                date: sponsorship.date,
                slot_label: &sponsorship.slot_label,
                tier_label: sponsorship.tier_label.as_deref(),
                gift_line_id,
                workflow_id: record.workflow_id,
                required_amount: gift.sponsorship_required_amount(),
            };
            outcome.reservation_id = Some(slots::reserve(&mut tx, &request).await?);
        }
    }

    commit(tx, cancel).await?;
    info!(
        gift_line_id = ?outcome.gift_line_id,
        reservation_id = ?outcome.reservation_id,
        released = outcome.released_reservations,
        "workflow saved"
    );
    Ok(outcome)
}

/// Upsert only the header and context envelope; child rows are untouched.
/// The envelope keeps the stored gift so it keeps matching the gift rows;
/// the caller's `gift` is ignored. A workflow created this way has none.
#[instrument(skip_all, fields(workflow_id = %record.workflow_id))]
pub async fn save_header_only(
    pool: &Pool,
    record: &WorkflowRecord,
    cancel: &CancellationToken,
) -> Result<()> {
    validate_header(record)?;
    let mut tx = begin(pool, cancel).await?;
    let stored_gift = match load_for_update(&mut tx, record.workflow_id).await {
        Ok(stored) => stored.gift,
        Err(LedgerError::NotFound { .. }) => None,
        Err(err) => return Err(err),
    };
    if stored_gift != record.gift {
        warn!("header-only save ignores gift changes");
    }
    let merged = WorkflowRecord {
        gift: stored_gift,
        ..record.clone()
    };
    let context_json = context::encode(&merged)?;
    upsert_header(&mut tx, &merged, &context_json).await?;
    commit(tx, cancel).await?;
    Ok(())
}

/// Append an audit-trail event to a stored workflow through the header-only
/// path. Returns the updated record.
#[instrument(skip_all, fields(workflow_id = %workflow_id, kind = kind))]
pub async fn append_event(
    pool: &Pool,
    workflow_id: Uuid,
    kind: &str,
    detail: Option<&str>,
    cancel: &CancellationToken,
) -> Result<WorkflowRecord> {
    let mut tx = begin(pool, cancel).await?;
    let mut record = load_for_update(&mut tx, workflow_id).await?;
    record.push_event(kind, detail.map(str::to_string));
    let context_json = context::encode(&record)?;
    upsert_header(&mut tx, &record, &context_json).await?;
    commit(tx, cancel).await?;
    Ok(record)
}

/// Record the outcome of a create call made after the workflow was saved.
/// Updates the live gift line, the context envelope and the workflow status.
#[instrument(skip_all, fields(workflow_id = %workflow_id))]
pub async fn record_remote_create_outcome(
    pool: &Pool,
    workflow_id: Uuid,
    outcome: &RemoteCreateOutcome,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut tx = begin(pool, cancel).await?;
    let mut record = load_for_update(&mut tx, workflow_id).await?;
    let Some(gift) = record.gift.as_mut() else {
        return Err(LedgerError::not_found("gift line for workflow", workflow_id));
    };
    let succeeded = outcome.is_success();
    gift.remote.attempted_at = Some(outcome.attempted_at);
    gift.remote.succeeded = Some(succeeded);
    gift.remote.remote_gift_id = outcome.remote_gift_id.clone();
    gift.remote.error_message = outcome.error.clone();
    record.status = if succeeded {
        WorkflowStatus::Posted
    } else {
        WorkflowStatus::PostFailed
    };

    let updated = sqlx::query(
        "UPDATE gift_lines SET api_attempted_at = ?, api_succeeded = ?, remote_gift_id = ?, \
         api_error_message = ? WHERE workflow_id = ? AND is_deleted = 0",
    )
    .bind(outcome.attempted_at)
    .bind(succeeded)
    .bind(&outcome.remote_gift_id)
    .bind(&outcome.error)
    .bind(workflow_id.to_string())
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(LedgerError::not_found("live gift line for workflow", workflow_id));
    }

    let context_json = context::encode(&record)?;
    upsert_header(&mut tx, &record, &context_json).await?;
    commit(tx, cancel).await?;
    if succeeded {
        info!(remote_gift_id = ?outcome.remote_gift_id, "remote create recorded");
    } else {
        warn!(error = ?outcome.error, "remote create failed; local record kept");
    }
    Ok(())
}

fn validate_header(record: &WorkflowRecord) -> Result<()> {
    if record.workflow_id.is_nil() {
        return Err(LedgerError::validation(
            "workflow_id",
            "must be a non-empty identifier",
        ));
    }
    if record.constituent.id <= 0 {
        return Err(LedgerError::validation(
            "constituent_id",
            format!("{} is not a valid constituent id", record.constituent.id),
        ));
    }
    Ok(())
}

/// Check everything that can be checked without the store. Returns the gift
/// amount in cents when a gift line is present.
fn validate(record: &WorkflowRecord) -> Result<Option<i64>> {
    validate_header(record)?;
    let Some(gift) = &record.gift else {
        return Ok(None);
    };
    if gift.amount <= Decimal::ZERO {
        return Err(LedgerError::validation(
            "amount",
            format!("{} must be greater than zero", gift.amount),
        ));
    }
    let cents = to_cents("amount", gift.amount)?;
    if let Some(count) = gift.installment_count {
        if count < 1 {
            return Err(LedgerError::validation(
                "installment_count",
                format!("{count} must be at least 1"),
            ));
        }
    }
    if let Some(sponsorship) = &gift.sponsorship {
        if gift.campaign_id.is_none() {
            return Err(LedgerError::validation(
                "campaign_id",
                "a sponsorship requires a campaign",
            ));
        }
        slots::parse_slot_label(&sponsorship.slot_label)?;
        to_cents("threshold_override", gift.sponsorship_required_amount())?;
    }
    Ok(Some(cents))
}

async fn upsert_header(
    tx: &mut Transaction<'_, Sqlite>,
    record: &WorkflowRecord,
    context_json: &str,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO workflows (workflow_id, created_at, completed_at, machine_name, user_name, \
            search_hint, constituent_id, constituent_name, is_first_time_giver, \
            is_new_radio_constituent, status, context_version, context_json) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(workflow_id) DO UPDATE SET \
            created_at = excluded.created_at, \
            completed_at = excluded.completed_at, \
            machine_name = excluded.machine_name, \
            user_name = excluded.user_name, \
            search_hint = excluded.search_hint, \
            constituent_id = excluded.constituent_id, \
            constituent_name = excluded.constituent_name, \
            is_first_time_giver = excluded.is_first_time_giver, \
            is_new_radio_constituent = excluded.is_new_radio_constituent, \
            status = excluded.status, \
            context_version = excluded.context_version, \
            context_json = excluded.context_json",
    )
    .bind(record.workflow_id.to_string())
    .bind(record.created_at)
    .bind(record.completed_at)
    .bind(&record.machine_name)
    .bind(&record.user_name)
    .bind(&record.search_hint)
    .bind(record.constituent.id)
    .bind(&record.constituent.name)
    .bind(record.is_first_time_giver)
    .bind(record.is_new_radio_constituent)
    .bind(record.status.as_str())
    .bind(context::CONTEXT_VERSION as i64)
    .bind(context_json)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_gift_line(
    tx: &mut Transaction<'_, Sqlite>,
    record: &WorkflowRecord,
    gift: &GiftLine,
    amount_cents: i64,
) -> Result<i64> {
    let row = sqlx::query(
        "INSERT INTO gift_lines (workflow_id, amount_cents, frequency, installment_count, \
            pledge_date, start_date, fund_id, campaign_id, appeal_id, package_id, send_reminder, \
            comments, api_attempted_at, api_succeeded, remote_gift_id, api_error_message, \
            created_at, is_deleted) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0) RETURNING id",
    )
    .bind(record.workflow_id.to_string())
    .bind(amount_cents)
    .bind(gift.frequency.as_str())
    .bind(gift.installment_count)
    .bind(gift.pledge_date)
    .bind(gift.start_date)
    .bind(gift.fund_id)
    .bind(gift.campaign_id)
    .bind(gift.appeal_id)
    .bind(gift.package_id)
    .bind(gift.send_reminder)
    .bind(&gift.comments)
    .bind(gift.remote.attempted_at)
    .bind(gift.remote.succeeded)
    .bind(&gift.remote.remote_gift_id)
    .bind(&gift.remote.error_message)
    .bind(record.created_at)
    .fetch_one(&mut **tx)
    .await?;
    Ok(row.get("id"))
}

/// Take the write lock on a workflow header and decode its context. The touch
/// comes first so the read below cannot be invalidated by a concurrent writer.
pub(crate) async fn load_for_update(
    tx: &mut Transaction<'_, Sqlite>,
    workflow_id: Uuid,
) -> Result<WorkflowRecord> {
    let id = workflow_id.to_string();
    let touched = sqlx::query("UPDATE workflows SET workflow_id = workflow_id WHERE workflow_id = ?")
        .bind(&id)
        .execute(&mut **tx)
        .await?
        .rows_affected();
    if touched == 0 {
        return Err(LedgerError::not_found("workflow", workflow_id));
    }
    let raw: String = sqlx::query_scalar("SELECT context_json FROM workflows WHERE workflow_id = ?")
        .bind(&id)
        .fetch_one(&mut **tx)
        .await?;
    context::decode(&raw)
}

pub(crate) const GIFT_LINE_COLUMNS: &str = "id, workflow_id, amount_cents, frequency, installment_count, \
     pledge_date, start_date, fund_id, campaign_id, appeal_id, package_id, send_reminder, comments, \
     api_attempted_at, api_succeeded, remote_gift_id, api_error_message, created_at, is_deleted, \
     deleted_at, deleted_by_user, deleted_by_machine, delete_reason, remote_delete_attempted_at, \
     remote_delete_succeeded, remote_delete_error";

pub(crate) fn gift_line_from_row(row: &SqliteRow) -> Result<GiftLineRow> {
    let workflow_id: String = row.try_get("workflow_id")?;
    let frequency: String = row.try_get("frequency")?;
    Ok(GiftLineRow {
        id: row.try_get("id")?,
        workflow_id: Uuid::parse_str(&workflow_id)
            .map_err(|_| LedgerError::corrupt("workflow_id", &workflow_id))?,
        amount: from_cents(row.try_get("amount_cents")?),
        frequency: GiftFrequency::parse(&frequency)
            .ok_or_else(|| LedgerError::corrupt("frequency", &frequency))?,
        installment_count: row.try_get("installment_count")?,
        pledge_date: row.try_get("pledge_date")?,
        start_date: row.try_get("start_date")?,
        fund_id: row.try_get("fund_id")?,
        campaign_id: row.try_get("campaign_id")?,
        appeal_id: row.try_get("appeal_id")?,
        package_id: row.try_get("package_id")?,
        send_reminder: row.try_get("send_reminder")?,
        comments: row.try_get("comments")?,
        api_attempted_at: row.try_get("api_attempted_at")?,
        api_succeeded: row.try_get("api_succeeded")?,
        remote_gift_id: row.try_get("remote_gift_id")?,
        api_error_message: row.try_get("api_error_message")?,
        created_at: row.try_get("created_at")?,
        is_deleted: row.try_get("is_deleted")?,
        deleted_at: row.try_get("deleted_at")?,
        deleted_by_user: row.try_get("deleted_by_user")?,
        deleted_by_machine: row.try_get("deleted_by_machine")?,
        delete_reason: row.try_get("delete_reason")?,
        remote_delete_attempted_at: row.try_get("remote_delete_attempted_at")?,
        remote_delete_succeeded: row.try_get("remote_delete_succeeded")?,
        remote_delete_error: row.try_get("remote_delete_error")?,
    })
}
