//! Read-only projections for the history, booking and audit screens.
use super::deletion::{snapshot_from_row, SNAPSHOT_COLUMNS};
use super::ledger::{gift_line_from_row, GIFT_LINE_COLUMNS};
use super::model::{DeletionSnapshot, GiftLineRow, HistoryEntry, Reservation};
use super::slots::{reservation_from_row, RESERVATION_COLUMNS};
use super::Pool;
use crate::context;
use crate::error::{LedgerError, Result};
use crate::model::{from_cents, DayPart, WorkflowRecord, WorkflowStatus};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::instrument;
use uuid::Uuid;

/// Filters for the workflow history screen. Unset fields match everything.
#[derive(Debug, Clone)]
pub struct HistoryFilter {
    pub constituent_id: Option<i64>,
    pub machine_name: Option<String>,
    pub user_name: Option<String>,
    /// Substring matched against constituent name, search hint and id.
    pub search: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub include_deleted: bool,
    pub limit: i64,
}

impl Default for HistoryFilter {
    fn default() -> Self {
        Self {
            constituent_id: None,
            machine_name: None,
            user_name: None,
            search: None,
            since: None,
            include_deleted: false,
            limit: 100,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditQuery {
    /// Substring matched against constituent, hint, reason, deleting user and
    /// remote gift id.
    pub text: Option<String>,
    pub deleted_from: Option<DateTime<Utc>>,
    pub deleted_to: Option<DateTime<Utc>>,
    pub limit: i64,
}

impl Default for AuditQuery {
    fn default() -> Self {
        Self {
            text: None,
            deleted_from: None,
            deleted_to: None,
            limit: 100,
        }
    }
}

fn like_pattern(text: &Option<String>) -> Option<String> {
    text.as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(|t| format!("%{t}%"))
}

/// Decode the stored context envelope of a workflow.
pub async fn load_workflow(pool: &Pool, workflow_id: Uuid) -> Result<WorkflowRecord> {
    let raw: Option<String> =
        sqlx::query_scalar("SELECT context_json FROM workflows WHERE workflow_id = ?")
            .bind(workflow_id.to_string())
            .fetch_optional(pool)
            .await?;
    let raw = raw.ok_or_else(|| LedgerError::not_found("workflow", workflow_id))?;
    context::decode(&raw)
}

/// Workflows newest first, each joined to its current gift line (the live
/// one, else the most recently deleted).
#[instrument(skip_all)]
pub async fn workflow_history(pool: &Pool, filter: &HistoryFilter) -> Result<Vec<HistoryEntry>> {
    let search = like_pattern(&filter.search);
    let rows = sqlx::query(
        "SELECT w.workflow_id, w.created_at, w.completed_at, w.status, w.machine_name, \
            w.user_name, w.constituent_id, w.constituent_name, w.search_hint, \
            g.id AS gift_line_id, g.amount_cents, g.pledge_date, g.api_succeeded, \
            g.remote_gift_id, COALESCE(g.is_deleted, 0) AS is_deleted \
         FROM workflows w \
         LEFT JOIN gift_lines g ON g.id = ( \
            SELECT id FROM gift_lines WHERE workflow_id = w.workflow_id \
            ORDER BY is_deleted ASC, id DESC LIMIT 1) \
         WHERE (? IS NULL OR w.constituent_id = ?) \
           AND (? IS NULL OR w.machine_name = ?) \
           AND (? IS NULL OR w.user_name = ?) \
           AND (? IS NULL OR w.created_at >= ?) \
           AND (? IS NULL OR w.constituent_name LIKE ? OR w.search_hint LIKE ? \
                OR CAST(w.constituent_id AS TEXT) LIKE ?) \
           AND (? OR COALESCE(g.is_deleted, 0) = 0) \
         ORDER BY w.created_at DESC, w.workflow_id \
         LIMIT ?",
    )
    .bind(filter.constituent_id)
    .bind(filter.constituent_id)
    .bind(&filter.machine_name)
    .bind(&filter.machine_name)
    .bind(&filter.user_name)
    .bind(&filter.user_name)
    .bind(filter.since)
    .bind(filter.since)
    .bind(&search)
    .bind(&search)
    .bind(&search)
    .bind(&search)
    .bind(filter.include_deleted)
    .bind(filter.limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(history_from_row).collect()
}

fn history_from_row(row: &SqliteRow) -> Result<HistoryEntry> {
    let workflow_id: String = row.try_get("workflow_id")?;
    let status: String = row.try_get("status")?;
    let amount_cents: Option<i64> = row.try_get("amount_cents")?;
    Ok(HistoryEntry {
        workflow_id: Uuid::parse_str(&workflow_id)
            .map_err(|_| LedgerError::corrupt("workflow_id", &workflow_id))?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
        status: WorkflowStatus::parse(&status).ok_or_else(|| LedgerError::corrupt("status", &status))?,
        machine_name: row.try_get("machine_name")?,
        user_name: row.try_get("user_name")?,
        constituent_id: row.try_get("constituent_id")?,
        constituent_name: row.try_get("constituent_name")?,
        search_hint: row.try_get("search_hint")?,
        gift_line_id: row.try_get("gift_line_id")?,
        amount: amount_cents.map(from_cents),
        pledge_date: row.try_get("pledge_date")?,
        api_succeeded: row.try_get("api_succeeded")?,
        remote_gift_id: row.try_get("remote_gift_id")?,
        is_deleted: row.try_get("is_deleted")?,
    })
}

/// Gift lines the remote API accepted and that have not been deleted since.
pub async fn successful_gifts(pool: &Pool, constituent_id: Option<i64>) -> Result<Vec<GiftLineRow>> {
    let columns = GIFT_LINE_COLUMNS
        .split(", ")
        .map(|c| format!("g.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    let rows = sqlx::query(&format!(
        "SELECT {columns} FROM gift_lines g JOIN workflows w ON w.workflow_id = g.workflow_id \
         WHERE g.api_succeeded = 1 AND g.is_deleted = 0 \
           AND (? IS NULL OR w.constituent_id = ?) \
         ORDER BY g.pledge_date DESC, g.id DESC"
    ))
    .bind(constituent_id)
    .bind(constituent_id)
    .fetch_all(pool)
    .await?;
    rows.iter().map(gift_line_from_row).collect()
}

/// Every gift line ever written for a workflow, soft-deleted ones included.
pub async fn gift_lines_for_workflow(pool: &Pool, workflow_id: Uuid) -> Result<Vec<GiftLineRow>> {
    let rows = sqlx::query(&format!(
        "SELECT {GIFT_LINE_COLUMNS} FROM gift_lines WHERE workflow_id = ? ORDER BY id"
    ))
    .bind(workflow_id.to_string())
    .fetch_all(pool)
    .await?;
    rows.iter().map(gift_line_from_row).collect()
}

pub async fn live_gift_line(pool: &Pool, workflow_id: Uuid) -> Result<Option<GiftLineRow>> {
    let row = sqlx::query(&format!(
        "SELECT {GIFT_LINE_COLUMNS} FROM gift_lines WHERE workflow_id = ? AND is_deleted = 0 \
         ORDER BY id DESC LIMIT 1"
    ))
    .bind(workflow_id.to_string())
    .fetch_optional(pool)
    .await?;
    row.map(|r| gift_line_from_row(&r)).transpose()
}

/// Dates in `[from, to]` with no bookable day-part left: a FULL reservation,
/// or both AM and PM.
#[instrument(skip_all, fields(campaign_id = campaign_id, from = %from, to = %to))]
pub async fn fully_booked_dates(
    pool: &Pool,
    campaign_id: i64,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<NaiveDate>> {
    let dates: Vec<NaiveDate> = sqlx::query_scalar(
        "SELECT sponsored_on FROM sponsorship_reservations \
         WHERE campaign_id = ? AND is_cancelled = 0 AND sponsored_on BETWEEN ? AND ? \
         GROUP BY sponsored_on \
         HAVING SUM(day_part = 'FULL') > 0 \
             OR (SUM(day_part = 'AM') > 0 AND SUM(day_part = 'PM') > 0) \
         ORDER BY sponsored_on",
    )
    .bind(campaign_id)
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;
    Ok(dates)
}

/// Active day-parts for one campaign day, in FULL/AM/PM order.
pub async fn reserved_day_parts(
    pool: &Pool,
    campaign_id: i64,
    date: NaiveDate,
) -> Result<Vec<DayPart>> {
    let raw: Vec<String> = sqlx::query_scalar(
        "SELECT day_part FROM sponsorship_reservations \
         WHERE campaign_id = ? AND sponsored_on = ? AND is_cancelled = 0",
    )
    .bind(campaign_id)
    .bind(date)
    .fetch_all(pool)
    .await?;
    let mut parts = raw
        .iter()
        .map(|s| DayPart::parse(s).ok_or_else(|| LedgerError::corrupt("day_part", s)))
        .collect::<Result<Vec<_>>>()?;
    parts.sort();
    parts.dedup();
    Ok(parts)
}

/// Active reservations for a campaign within `[from, to]`.
pub async fn reservations_between(
    pool: &Pool,
    campaign_id: i64,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<Vec<Reservation>> {
    let rows = sqlx::query(&format!(
        "SELECT {RESERVATION_COLUMNS} FROM sponsorship_reservations \
         WHERE campaign_id = ? AND is_cancelled = 0 AND sponsored_on BETWEEN ? AND ? \
         ORDER BY sponsored_on, day_part"
    ))
    .bind(campaign_id)
    .bind(from)
    .bind(to)
    .fetch_all(pool)
    .await?;
    rows.iter().map(reservation_from_row).collect()
}

/// All reservations a workflow ever held, cancelled ones included.
pub async fn reservations_for_workflow(pool: &Pool, workflow_id: Uuid) -> Result<Vec<Reservation>> {
    let rows = sqlx::query(&format!(
        "SELECT {RESERVATION_COLUMNS} FROM sponsorship_reservations WHERE workflow_id = ? ORDER BY id"
    ))
    .bind(workflow_id.to_string())
    .fetch_all(pool)
    .await?;
    rows.iter().map(reservation_from_row).collect()
}

#[instrument(skip_all)]
pub async fn search_deletion_snapshots(
    pool: &Pool,
    query: &AuditQuery,
) -> Result<Vec<DeletionSnapshot>> {
    let text = like_pattern(&query.text);
    let rows = sqlx::query(&format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM deletion_snapshots \
         WHERE (? IS NULL OR constituent_name LIKE ? OR search_hint LIKE ? \
                OR delete_reason LIKE ? OR deleted_by_user LIKE ? OR remote_gift_id LIKE ? \
                OR CAST(constituent_id AS TEXT) LIKE ?) \
           AND (? IS NULL OR deleted_at >= ?) \
           AND (? IS NULL OR deleted_at <= ?) \
         ORDER BY deleted_at DESC \
         LIMIT ?"
    ))
    .bind(&text)
    .bind(&text)
    .bind(&text)
    .bind(&text)
    .bind(&text)
    .bind(&text)
    .bind(&text)
    .bind(query.deleted_from)
    .bind(query.deleted_from)
    .bind(query.deleted_to)
    .bind(query.deleted_to)
    .bind(query.limit)
    .fetch_all(pool)
    .await?;
    rows.iter().map(snapshot_from_row).collect()
}

pub async fn get_deletion_snapshot(
    pool: &Pool,
    workflow_id: Uuid,
) -> Result<Option<DeletionSnapshot>> {
    let row = sqlx::query(&format!(
        "SELECT {SNAPSHOT_COLUMNS} FROM deletion_snapshots WHERE workflow_id = ?"
    ))
    .bind(workflow_id.to_string())
    .fetch_optional(pool)
    .await?;
    row.map(|r| snapshot_from_row(&r)).transpose()
}
