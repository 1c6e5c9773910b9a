use crate::error::{LedgerError, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    InProgress,
    Committed,
    Posted,
    PostFailed,
    Abandoned,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::InProgress => "in_progress",
            WorkflowStatus::Committed => "committed",
            WorkflowStatus::Posted => "posted",
            WorkflowStatus::PostFailed => "post_failed",
            WorkflowStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(WorkflowStatus::InProgress),
            "committed" => Some(WorkflowStatus::Committed),
            "posted" => Some(WorkflowStatus::Posted),
            "post_failed" => Some(WorkflowStatus::PostFailed),
            "abandoned" => Some(WorkflowStatus::Abandoned),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GiftFrequency {
    OneTime,
    Monthly,
    Quarterly,
    SemiAnnually,
    Annually,
}

impl GiftFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            GiftFrequency::OneTime => "one_time",
            GiftFrequency::Monthly => "monthly",
            GiftFrequency::Quarterly => "quarterly",
            GiftFrequency::SemiAnnually => "semi_annually",
            GiftFrequency::Annually => "annually",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "one_time" => Some(GiftFrequency::OneTime),
            "monthly" => Some(GiftFrequency::Monthly),
            "quarterly" => Some(GiftFrequency::Quarterly),
            "semi_annually" => Some(GiftFrequency::SemiAnnually),
            "annually" => Some(GiftFrequency::Annually),
            _ => None,
        }
    }
}

/// Bookable unit of a sponsorship day.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum DayPart {
    Full,
    Am,
    Pm,
}

impl DayPart {
    pub fn as_str(&self) -> &'static str {
        match self {
            DayPart::Full => "FULL",
            DayPart::Am => "AM",
            DayPart::Pm => "PM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FULL" => Some(DayPart::Full),
            "AM" => Some(DayPart::Am),
            "PM" => Some(DayPart::Pm),
            _ => None,
        }
    }

    /// Infer the day-part from a free-text slot label such as "Full day" or
    /// "Half-day PM". Matching is case-insensitive and checks "full", then
    /// "am", then "pm".
    pub fn from_slot_label(label: &str) -> Option<Self> {
        let lower = label.to_lowercase();
        if lower.contains("full") {
            Some(DayPart::Full)
        } else if lower.contains("am") {
            Some(DayPart::Am)
        } else if lower.contains("pm") {
            Some(DayPart::Pm)
        } else {
            None
        }
    }
}

impl fmt::Display for DayPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutboundStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl OutboundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboundStatus::Pending => "pending",
            OutboundStatus::Processing => "processing",
            OutboundStatus::Succeeded => "succeeded",
            OutboundStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboundStatus::Pending),
            "processing" => Some(OutboundStatus::Processing),
            "succeeded" => Some(OutboundStatus::Succeeded),
            "failed" => Some(OutboundStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    PledgeCreate,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::PledgeCreate => "pledge_create",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pledge_create" => Some(TransactionType::PledgeCreate),
            _ => None,
        }
    }
}

/// Who performed an admin action and from which machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_name: String,
    pub machine_name: String,
}

impl Actor {
    pub fn new(user_name: impl Into<String>, machine_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            machine_name: machine_name.into(),
        }
    }

    pub fn label(&self) -> String {
        format!("{}@{}", self.user_name, self.machine_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConstituentSnapshot {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub at: DateTime<Utc>,
    pub kind: String,
    #[serde(default)]
    pub detail: Option<String>,
}

/// Outcome of a remote create call made before or after the ledger write.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAttempt {
    #[serde(default)]
    pub attempted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub succeeded: Option<bool>,
    #[serde(default)]
    pub remote_gift_id: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SponsorshipRequest {
    pub date: NaiveDate,
    pub slot_label: String,
    #[serde(default)]
    pub tier_label: Option<String>,
    #[serde(default)]
    pub threshold_override: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GiftLine {
    pub amount: Decimal,
    pub frequency: GiftFrequency,
    #[serde(default)]
    pub installment_count: Option<i32>,
    pub pledge_date: NaiveDate,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub fund_id: Option<i64>,
    #[serde(default)]
    pub campaign_id: Option<i64>,
    #[serde(default)]
    pub appeal_id: Option<i64>,
    #[serde(default)]
    pub package_id: Option<i64>,
    #[serde(default)]
    pub send_reminder: bool,
    #[serde(default)]
    pub comments: Option<String>,
    #[serde(default)]
    pub remote: RemoteAttempt,
    #[serde(default)]
    pub sponsorship: Option<SponsorshipRequest>,
}

impl GiftLine {
    pub fn one_time(amount: Decimal, pledge_date: NaiveDate) -> Self {
        Self {
            amount,
            frequency: GiftFrequency::OneTime,
            installment_count: None,
            pledge_date,
            start_date: None,
            fund_id: None,
            campaign_id: None,
            appeal_id: None,
            package_id: None,
            send_reminder: false,
            comments: None,
            remote: RemoteAttempt::default(),
            sponsorship: None,
        }
    }

    /// Amount a sponsorship is recorded against: the threshold override when
    /// present, otherwise the gift amount, never below zero.
    pub fn sponsorship_required_amount(&self) -> Decimal {
        let base = self
            .sponsorship
            .as_ref()
            .and_then(|s| s.threshold_override)
            .unwrap_or(self.amount);
        base.max(Decimal::ZERO)
    }
}

/// One donation-entry attempt. This is the full context persisted in the
/// envelope column; normalized header columns are derived from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub workflow_id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    pub machine_name: String,
    pub user_name: String,
    #[serde(default)]
    pub search_hint: Option<String>,
    pub constituent: ConstituentSnapshot,
    #[serde(default)]
    pub is_first_time_giver: Option<bool>,
    #[serde(default)]
    pub is_new_radio_constituent: Option<bool>,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub gift: Option<GiftLine>,
    #[serde(default)]
    pub events: Vec<WorkflowEvent>,
    /// Fields written by newer clients that this build does not know about.
    #[serde(flatten)]
    pub extensions: BTreeMap<String, Value>,
}

impl WorkflowRecord {
    pub fn new(constituent: ConstituentSnapshot, actor: &Actor) -> Self {
        Self {
            workflow_id: Uuid::new_v4(),
            created_at: Utc::now(),
            completed_at: None,
            machine_name: actor.machine_name.clone(),
            user_name: actor.user_name.clone(),
            search_hint: None,
            constituent,
            is_first_time_giver: None,
            is_new_radio_constituent: None,
            status: WorkflowStatus::InProgress,
            gift: None,
            events: Vec::new(),
            extensions: BTreeMap::new(),
        }
    }

    pub fn push_event(&mut self, kind: impl Into<String>, detail: Option<String>) {
        self.events.push(WorkflowEvent {
            at: Utc::now(),
            kind: kind.into(),
            detail,
        });
    }
}

/// Convert a currency amount to integer cents. Amounts with more than two
/// decimal places are not representable.
pub fn to_cents(field: &'static str, amount: Decimal) -> Result<i64> {
    let normalized = amount.normalize();
    if normalized.scale() > 2 {
        return Err(LedgerError::validation(
            field,
            format!("{amount} has more than two decimal places"),
        ));
    }
    normalized
        .checked_mul(Decimal::ONE_HUNDRED)
        .and_then(|cents| cents.to_i64())
        .ok_or_else(|| LedgerError::validation(field, format!("{amount} is out of range")))
}

pub fn from_cents(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn slot_labels_map_to_day_parts() {
        assert_eq!(DayPart::from_slot_label("Full day"), Some(DayPart::Full));
        assert_eq!(DayPart::from_slot_label("FULL"), Some(DayPart::Full));
        assert_eq!(DayPart::from_slot_label("Half-day AM"), Some(DayPart::Am));
        assert_eq!(DayPart::from_slot_label("Half-day PM"), Some(DayPart::Pm));
        assert_eq!(DayPart::from_slot_label("Evening"), None);
    }

    #[test]
    fn cents_round_trip_two_places() {
        let amount = Decimal::from_str("1000.50").unwrap();
        assert_eq!(to_cents("amount", amount).unwrap(), 100_050);
        assert_eq!(from_cents(100_050), amount);
        assert_eq!(to_cents("amount", Decimal::from(2000)).unwrap(), 200_000);
    }

    #[test]
    fn cents_rejects_sub_cent_precision() {
        let err = to_cents("amount", Decimal::from_str("10.005").unwrap()).unwrap_err();
        assert!(matches!(err, LedgerError::Validation { field: "amount", .. }));
        // trailing zeros beyond two places are fine
        assert_eq!(
            to_cents("amount", Decimal::from_str("10.500").unwrap()).unwrap(),
            1050
        );
    }

    #[test]
    fn cents_rejects_amounts_that_overflow() {
        let err = to_cents("amount", Decimal::MAX).unwrap_err();
        assert!(matches!(err, LedgerError::Validation { field: "amount", .. }));
    }

    #[test]
    fn required_amount_prefers_override_and_clamps() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let mut gift = GiftLine::one_time(Decimal::from(2000), date);
        gift.sponsorship = Some(SponsorshipRequest {
            date,
            slot_label: "Full day".into(),
            tier_label: None,
            threshold_override: None,
        });
        assert_eq!(gift.sponsorship_required_amount(), Decimal::from(2000));

        if let Some(s) = gift.sponsorship.as_mut() {
            s.threshold_override = Some(Decimal::from(-5));
        }
        assert_eq!(gift.sponsorship_required_amount(), Decimal::ZERO);
    }

    #[test]
    fn unknown_fields_survive_deserialization() {
        let actor = Actor::new("op", "desk-1");
        let record = WorkflowRecord::new(
            ConstituentSnapshot {
                id: 7,
                name: "Ada".into(),
            },
            &actor,
        );
        let mut value = serde_json::to_value(&record).unwrap();
        value["future_field"] = serde_json::json!({"nested": true});
        let back: WorkflowRecord = serde_json::from_value(value).unwrap();
        assert_eq!(
            back.extensions.get("future_field"),
            Some(&serde_json::json!({"nested": true}))
        );
        assert_eq!(back.workflow_id, record.workflow_id);
    }
}
