//! Outbound transaction queue.
//!
//! Captures "this pledge must be sent to the remote gift API" separately from
//! the workflow ledger, keyed by (workflow, transaction type). The consumer is
//! a server-side worker; the bookkeeping functions below are the contract it
//! uses. Enqueue is idempotent: re-enqueueing resets the row to pending.
use super::model::OutboundTransaction;
use super::{begin, commit, Pool};
use crate::cancel::CancellationToken;
use crate::error::{LedgerError, Result};
use crate::model::{from_cents, to_cents, OutboundStatus, TransactionType};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, Offset, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct PledgeCreateRequest {
    pub workflow_id: Uuid,
    pub constituent_id: i64,
    pub amount: Decimal,
    pub date: NaiveDate,
    pub fund_id: Option<i64>,
    pub comments: Option<String>,
    /// Fully formed request for the remote gift API, stored verbatim.
    pub request_payload: serde_json::Value,
    pub client_machine: String,
    pub client_user: String,
}

/// Enqueue time in UTC and in the recording machine's local time, with the
/// timezone id and offset needed to reinterpret it later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueStamp {
    pub utc: DateTime<Utc>,
    pub local: NaiveDateTime,
    pub timezone_id: String,
    pub utc_offset_minutes: i32,
}

impl EnqueueStamp {
    pub fn now() -> Self {
        let utc = Utc::now();
        let local = utc.with_timezone(&Local);
        let offset_seconds = local.offset().fix().local_minus_utc();
        Self {
            utc,
            local: local.naive_local(),
            timezone_id: local_timezone_id(),
            utc_offset_minutes: offset_seconds / 60,
        }
    }
}

fn local_timezone_id() -> String {
    std::env::var("TZ")
        .ok()
        .map(|tz| tz.trim().trim_start_matches(':').to_string())
        .filter(|tz| !tz.is_empty())
        .unwrap_or_else(|| "localtime".to_string())
}

/// Insert a pending pledge-create row, or overwrite the existing row for the
/// same workflow and reset its processing state. Returns the row id.
#[instrument(skip_all, fields(workflow_id = %request.workflow_id))]
pub async fn enqueue_or_update_pending_pledge_create(
    pool: &Pool,
    request: &PledgeCreateRequest,
    cancel: &CancellationToken,
) -> Result<i64> {
    enqueue_with_stamp(pool, request, &EnqueueStamp::now(), cancel).await
}

/// Same as [`enqueue_or_update_pending_pledge_create`] with a given stamp.
pub async fn enqueue_with_stamp(
    pool: &Pool,
    request: &PledgeCreateRequest,
    stamp: &EnqueueStamp,
    cancel: &CancellationToken,
) -> Result<i64> {
    if request.workflow_id.is_nil() {
        return Err(LedgerError::validation(
            "workflow_id",
            "must be a non-empty identifier",
        ));
    }
    if request.constituent_id <= 0 {
        return Err(LedgerError::validation(
            "constituent_id",
            format!("{} is not a valid constituent id", request.constituent_id),
        ));
    }
    if request.amount <= Decimal::ZERO {
        return Err(LedgerError::validation(
            "amount",
            format!("{} must be greater than zero", request.amount),
        ));
    }
    let amount_cents = to_cents("amount", request.amount)?;
    let payload = serde_json::to_string(&request.request_payload)?;
    let transaction_type = TransactionType::PledgeCreate;

    let mut tx = begin(pool, cancel).await?;
    let row = sqlx::query(
        "INSERT INTO outbound_transactions (workflow_id, transaction_type, status, request_payload, \
            enqueued_at_utc, enqueued_at_local, timezone_id, utc_offset_minutes, client_machine, \
            client_user, constituent_id, amount_cents, gift_date, fund_id, comments, attempt_count) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0) \
         ON CONFLICT(workflow_id, transaction_type) DO UPDATE SET \
            status = excluded.status, \
            request_payload = excluded.request_payload, \
            enqueued_at_utc = excluded.enqueued_at_utc, \
            enqueued_at_local = excluded.enqueued_at_local, \
            timezone_id = excluded.timezone_id, \
            utc_offset_minutes = excluded.utc_offset_minutes, \
            client_machine = excluded.client_machine, \
            client_user = excluded.client_user, \
            constituent_id = excluded.constituent_id, \
            amount_cents = excluded.amount_cents, \
            gift_date = excluded.gift_date, \
            fund_id = excluded.fund_id, \
            comments = excluded.comments, \
            attempt_count = 0, \
            processing_started_at = NULL, \
            completed_at = NULL, \
            last_error = NULL, \
            remote_id = NULL \
         RETURNING id",
    )
    .bind(request.workflow_id.to_string())
    .bind(transaction_type.as_str())
    .bind(OutboundStatus::Pending.as_str())
    .bind(&payload)
    .bind(stamp.utc)
    .bind(stamp.local)
    .bind(&stamp.timezone_id)
    .bind(stamp.utc_offset_minutes)
    .bind(&request.client_machine)
    .bind(&request.client_user)
    .bind(request.constituent_id)
    .bind(amount_cents)
    .bind(request.date)
    .bind(request.fund_id)
    .bind(&request.comments)
    .fetch_one(&mut *tx)
    .await?;
    let id: i64 = row.get("id");
    commit(tx, cancel).await?;
    info!(id, transaction_type = transaction_type.as_str(), "outbound transaction pending");
    Ok(id)
}

/// Move the oldest pending row to processing and return it.
#[instrument(skip_all)]
pub async fn claim_next_pending(
    pool: &Pool,
    cancel: &CancellationToken,
) -> Result<Option<OutboundTransaction>> {
    let mut tx = begin(pool, cancel).await?;
    let row = sqlx::query(&format!(
        "UPDATE outbound_transactions \
         SET status = 'processing', attempt_count = attempt_count + 1, processing_started_at = ? \
         WHERE id = (SELECT id FROM outbound_transactions WHERE status = 'pending' \
                     ORDER BY enqueued_at_utc ASC, id ASC LIMIT 1) \
         RETURNING {OUTBOUND_COLUMNS}"
    ))
    .bind(Utc::now())
    .fetch_optional(&mut *tx)
    .await?;
    let claimed = row.map(|r| transaction_from_row(&r)).transpose()?;
    commit(tx, cancel).await?;
    Ok(claimed)
}

/// Mark a row as being processed, counting one more attempt.
#[instrument(skip_all, fields(id = id))]
pub async fn mark_processing(pool: &Pool, id: i64, cancel: &CancellationToken) -> Result<i32> {
    let mut tx = begin(pool, cancel).await?;
    let attempts: Option<i32> = sqlx::query_scalar(
        "UPDATE outbound_transactions \
         SET status = 'processing', attempt_count = attempt_count + 1, processing_started_at = ? \
         WHERE id = ? RETURNING attempt_count",
    )
    .bind(Utc::now())
    .bind(id)
    .fetch_optional(&mut *tx)
    .await?;
    let attempts = attempts.ok_or_else(|| LedgerError::not_found("outbound transaction", id))?;
    commit(tx, cancel).await?;
    Ok(attempts)
}

#[instrument(skip_all, fields(id = id))]
pub async fn mark_succeeded(
    pool: &Pool,
    id: i64,
    remote_id: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    finish(pool, id, OutboundStatus::Succeeded, Some(remote_id), None, cancel).await?;
    info!(id, remote_id, "outbound transaction succeeded");
    Ok(())
}

#[instrument(skip_all, fields(id = id))]
pub async fn mark_failed(pool: &Pool, id: i64, error: &str, cancel: &CancellationToken) -> Result<()> {
    finish(pool, id, OutboundStatus::Failed, None, Some(error), cancel).await?;
    warn!(id, error, "outbound transaction failed");
    Ok(())
}

async fn finish(
    pool: &Pool,
    id: i64,
    status: OutboundStatus,
    remote_id: Option<&str>,
    error: Option<&str>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut tx = begin(pool, cancel).await?;
    let updated = sqlx::query(
        "UPDATE outbound_transactions SET status = ?, completed_at = ?, \
         remote_id = COALESCE(?, remote_id), last_error = ? WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(Utc::now())
    .bind(remote_id)
    .bind(error)
    .bind(id)
    .execute(&mut *tx)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(LedgerError::not_found("outbound transaction", id));
    }
    commit(tx, cancel).await
}

pub async fn get_transaction(
    pool: &Pool,
    workflow_id: Uuid,
    transaction_type: TransactionType,
) -> Result<Option<OutboundTransaction>> {
    let row = sqlx::query(&format!(
        "SELECT {OUTBOUND_COLUMNS} FROM outbound_transactions \
         WHERE workflow_id = ? AND transaction_type = ?"
    ))
    .bind(workflow_id.to_string())
    .bind(transaction_type.as_str())
    .fetch_optional(pool)
    .await?;
    row.map(|r| transaction_from_row(&r)).transpose()
}

/// Queue rows, newest first, optionally filtered by status.
pub async fn list_transactions(
    pool: &Pool,
    status: Option<OutboundStatus>,
    limit: i64,
) -> Result<Vec<OutboundTransaction>> {
    let rows = sqlx::query(&format!(
        "SELECT {OUTBOUND_COLUMNS} FROM outbound_transactions \
         WHERE (? IS NULL OR status = ?) ORDER BY enqueued_at_utc DESC, id DESC LIMIT ?"
    ))
    .bind(status.map(|s| s.as_str()))
    .bind(status.map(|s| s.as_str()))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(transaction_from_row).collect()
}

const OUTBOUND_COLUMNS: &str = "id, workflow_id, transaction_type, status, request_payload, \
     enqueued_at_utc, enqueued_at_local, timezone_id, utc_offset_minutes, client_machine, \
     client_user, constituent_id, amount_cents, gift_date, fund_id, comments, attempt_count, \
     processing_started_at, completed_at, last_error, remote_id";

fn transaction_from_row(row: &SqliteRow) -> Result<OutboundTransaction> {
    let workflow_id: String = row.try_get("workflow_id")?;
    let transaction_type: String = row.try_get("transaction_type")?;
    let status: String = row.try_get("status")?;
    let payload: String = row.try_get("request_payload")?;
    Ok(OutboundTransaction {
        id: row.try_get("id")?,
        workflow_id: Uuid::parse_str(&workflow_id)
            .map_err(|_| LedgerError::corrupt("workflow_id", &workflow_id))?,
        transaction_type: TransactionType::parse(&transaction_type)
            .ok_or_else(|| LedgerError::corrupt("transaction_type", &transaction_type))?,
        status: OutboundStatus::parse(&status).ok_or_else(|| LedgerError::corrupt("status", &status))?,
        request_payload: serde_json::from_str(&payload)?,
        enqueued_at_utc: row.try_get("enqueued_at_utc")?,
        enqueued_at_local: row.try_get("enqueued_at_local")?,
        timezone_id: row.try_get("timezone_id")?,
        utc_offset_minutes: row.try_get("utc_offset_minutes")?,
        client_machine: row.try_get("client_machine")?,
        client_user: row.try_get("client_user")?,
        constituent_id: row.try_get("constituent_id")?,
        amount: from_cents(row.try_get("amount_cents")?),
        gift_date: row.try_get("gift_date")?,
        fund_id: row.try_get("fund_id")?,
        comments: row.try_get("comments")?,
        attempt_count: row.try_get("attempt_count")?,
        processing_started_at: row.try_get("processing_started_at")?,
        completed_at: row.try_get("completed_at")?,
        last_error: row.try_get("last_error")?,
        remote_id: row.try_get("remote_id")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamp_offset_matches_local_clock() {
        let stamp = EnqueueStamp::now();
        let diff = stamp.local - stamp.utc.naive_utc();
        assert_eq!(diff.num_minutes(), stamp.utc_offset_minutes as i64);
        assert!(!stamp.timezone_id.is_empty());
    }
}
