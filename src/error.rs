//! Error taxonomy for ledger operations.
//!
//! Every failure reported by the repository layer carries enough detail for an
//! operator to correct the input and retry: the conflicting slot, the missing
//! table, or the offending field.
use crate::model::DayPart;
use chrono::NaiveDate;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerError>;

pub const SCHEMA_HINT: &str = "run `donation-ledger migrate` against this database";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("schema missing: {object} ({hint})")]
    SchemaMissing { object: String, hint: &'static str },

    #[error("invalid {field}: {message}")]
    Validation { field: &'static str, message: String },

    #[error("sponsorship for campaign {campaign_id} on {date} ({requested}) already booked ({existing})")]
    BookingConflict {
        campaign_id: i64,
        date: NaiveDate,
        requested: DayPart,
        existing: DayPart,
    },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("corrupt stored value in {column}: {value}")]
    Corrupt { column: &'static str, value: String },

    #[error("operation cancelled; transaction rolled back")]
    Cancelled,

    #[error("transient store failure, safe to retry: {0}")]
    Transient(#[source] sqlx::Error),

    #[error("store error: {0}")]
    Store(#[source] sqlx::Error),

    #[error("context serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    pub fn validation(field: &'static str, message: impl Into<String>) -> Self {
        LedgerError::Validation {
            field,
            message: message.into(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        LedgerError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn corrupt(column: &'static str, value: impl ToString) -> Self {
        LedgerError::Corrupt {
            column,
            value: value.to_string(),
        }
    }

    /// Whether repeating the same call can be expected to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Transient(_) | LedgerError::Cancelled)
    }

    pub fn is_booking_conflict(&self) -> bool {
        matches!(self, LedgerError::BookingConflict { .. })
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        let (missing, busy) = match &err {
            sqlx::Error::Database(db_err) => {
                let message = db_err.message();
                let busy = is_busy_code(db_err.code().as_deref())
                    || message.contains("database is locked");
                (missing_object(message), busy)
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => {
                (None, true)
            }
            _ => (None, false),
        };
        match (missing, busy) {
            (Some(object), _) => LedgerError::SchemaMissing {
                object,
                hint: SCHEMA_HINT,
            },
            (None, true) => LedgerError::Transient(err),
            (None, false) => LedgerError::Store(err),
        }
    }
}

// SQLITE_BUSY (5) and SQLITE_LOCKED (6), including their extended codes.
fn is_busy_code(code: Option<&str>) -> bool {
    let Some(code) = code.and_then(|c| c.parse::<i32>().ok()) else {
        return false;
    };
    matches!(code & 0xff, 5 | 6)
}

fn missing_object(message: &str) -> Option<String> {
    ["no such table: ", "no such column: ", "has no column named "]
        .iter()
        .find_map(|prefix| {
            message
                .find(prefix)
                .map(|idx| message[idx + prefix.len()..].trim().to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_codes_cover_extended_variants() {
        assert!(is_busy_code(Some("5")));
        assert!(is_busy_code(Some("517")));
        assert!(is_busy_code(Some("6")));
        assert!(!is_busy_code(Some("19")));
        assert!(!is_busy_code(None));
    }

    #[test]
    fn missing_object_extracts_name() {
        assert_eq!(
            missing_object("no such table: gift_lines").as_deref(),
            Some("gift_lines")
        );
        assert_eq!(
            missing_object("table gift_lines has no column named is_deleted").as_deref(),
            Some("is_deleted")
        );
        assert!(missing_object("UNIQUE constraint failed").is_none());
    }

    #[test]
    fn conflict_message_names_existing_part() {
        let err = LedgerError::BookingConflict {
            campaign_id: 1,
            date: NaiveDate::from_ymd_opt(2025, 6, 1).unwrap(),
            requested: DayPart::Am,
            existing: DayPart::Full,
        };
        assert!(err.to_string().contains("already booked (FULL)"));
        assert!(err.is_booking_conflict());
        assert!(!err.is_retryable());
    }
}
