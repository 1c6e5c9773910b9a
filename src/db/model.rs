//! Rows and projections handed back by the repository modules. Money is
//! converted from stored cents; ids and enums are parsed on the way out.

use crate::model::{DayPart, GiftFrequency, OutboundStatus, TransactionType, WorkflowStatus};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

/// Row ids produced by one `ledger::save`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SaveOutcome {
    pub gift_line_id: Option<i64>,
    pub reservation_id: Option<i64>,
    pub released_reservations: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reservation {
    pub id: i64,
    pub campaign_id: i64,
    pub sponsored_on: NaiveDate,
    pub day_part: DayPart,
    pub slot_label: String,
    pub tier_label: Option<String>,
    pub required_amount: Decimal,
    pub gift_line_id: Option<i64>,
    pub workflow_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub is_cancelled: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<String>,
    pub cancel_reason: Option<String>,
}

/// Live or soft-deleted gift line as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GiftLineRow {
    pub id: i64,
    pub workflow_id: Uuid,
    pub amount: Decimal,
    pub frequency: GiftFrequency,
    pub installment_count: Option<i32>,
    pub pledge_date: NaiveDate,
    pub start_date: Option<NaiveDate>,
    pub fund_id: Option<i64>,
    pub campaign_id: Option<i64>,
    pub appeal_id: Option<i64>,
    pub package_id: Option<i64>,
    pub send_reminder: bool,
    pub comments: Option<String>,
    pub api_attempted_at: Option<DateTime<Utc>>,
    pub api_succeeded: Option<bool>,
    pub remote_gift_id: Option<String>,
    pub api_error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_by_user: Option<String>,
    pub deleted_by_machine: Option<String>,
    pub delete_reason: Option<String>,
    pub remote_delete_attempted_at: Option<DateTime<Utc>>,
    pub remote_delete_succeeded: Option<bool>,
    pub remote_delete_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletionOutcome {
    pub workflow_id: Uuid,
    /// False when an existing snapshot was updated by a repeated delete.
    pub snapshot_created: bool,
    pub gift_line_id: Option<i64>,
    pub released_reservations: u64,
    /// Remote gift to delete in the vendor CRM, if the create had succeeded.
    pub remote_gift_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletionSnapshot {
    pub workflow_id: Uuid,
    pub workflow_created_at: DateTime<Utc>,
    pub workflow_status: String,
    pub machine_name: String,
    pub user_name: String,
    pub search_hint: Option<String>,
    pub constituent_id: i64,
    pub constituent_name: String,
    pub gift_line_id: Option<i64>,
    pub amount: Option<Decimal>,
    pub pledge_date: Option<NaiveDate>,
    pub fund_id: Option<i64>,
    pub campaign_id: Option<i64>,
    pub remote_gift_id: Option<String>,
    pub sponsored_on: Option<NaiveDate>,
    pub day_part: Option<DayPart>,
    pub snapshot: serde_json::Value,
    pub first_deleted_at: DateTime<Utc>,
    pub deleted_at: DateTime<Utc>,
    pub deleted_by_user: String,
    pub deleted_by_machine: String,
    pub delete_reason: String,
    pub delete_count: i64,
    pub remote_delete_attempted_at: Option<DateTime<Utc>>,
    pub remote_delete_succeeded: Option<bool>,
    pub remote_delete_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutboundTransaction {
    pub id: i64,
    pub workflow_id: Uuid,
    pub transaction_type: TransactionType,
    pub status: OutboundStatus,
    pub request_payload: serde_json::Value,
    pub enqueued_at_utc: DateTime<Utc>,
    pub enqueued_at_local: NaiveDateTime,
    pub timezone_id: String,
    pub utc_offset_minutes: i32,
    pub client_machine: String,
    pub client_user: String,
    pub constituent_id: i64,
    pub amount: Decimal,
    pub gift_date: NaiveDate,
    pub fund_id: Option<i64>,
    pub comments: Option<String>,
    pub attempt_count: i32,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub remote_id: Option<String>,
}

/// One line of the workflow history screen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    pub workflow_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: WorkflowStatus,
    pub machine_name: String,
    pub user_name: String,
    pub constituent_id: i64,
    pub constituent_name: String,
    pub search_hint: Option<String>,
    pub gift_line_id: Option<i64>,
    pub amount: Option<Decimal>,
    pub pledge_date: Option<NaiveDate>,
    pub api_succeeded: Option<bool>,
    pub remote_gift_id: Option<String>,
    pub is_deleted: bool,
}
