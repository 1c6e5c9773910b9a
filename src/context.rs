//! Versioned envelope around the serialized workflow context.
//!
//! The envelope is the source of truth for replay and audit. Normalized
//! columns on the `workflows` table are derived from it on every write.
use crate::error::Result;
use crate::model::WorkflowRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub const CONTEXT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    workflow: Value,
}

pub fn encode(record: &WorkflowRecord) -> Result<String> {
    let envelope = Envelope {
        version: CONTEXT_VERSION,
        workflow: serde_json::to_value(record)?,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Decode an envelope written by this or a newer client. Unknown fields are
/// kept in [`WorkflowRecord::extensions`].
pub fn decode(raw: &str) -> Result<WorkflowRecord> {
    let envelope: Envelope = serde_json::from_str(raw)?;
    if envelope.version > CONTEXT_VERSION {
        warn!(
            version = envelope.version,
            supported = CONTEXT_VERSION,
            "decoding workflow context from a newer client"
        );
    }
    Ok(serde_json::from_value(envelope.workflow)?)
}

pub fn version_of(raw: &str) -> Result<u32> {
    let envelope: Envelope = serde_json::from_str(raw)?;
    Ok(envelope.version)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Actor, ConstituentSnapshot};
    use serde_json::json;

    fn record() -> WorkflowRecord {
        WorkflowRecord::new(
            ConstituentSnapshot {
                id: 42,
                name: "Grace Hopper".into(),
            },
            &Actor::new("op", "desk-1"),
        )
    }

    #[test]
    fn envelope_carries_version() {
        let original = record();
        let raw = encode(&original).unwrap();
        assert_eq!(version_of(&raw).unwrap(), CONTEXT_VERSION);
        assert_eq!(decode(&raw).unwrap(), original);
    }

    #[test]
    fn newer_envelope_with_extra_fields_decodes() {
        let original = record();
        let mut workflow = serde_json::to_value(&original).unwrap();
        workflow["pledge_channel"] = json!("radio");
        let raw = json!({ "version": CONTEXT_VERSION + 1, "workflow": workflow }).to_string();

        let decoded = decode(&raw).unwrap();
        assert_eq!(decoded.workflow_id, original.workflow_id);
        assert_eq!(decoded.extensions.get("pledge_channel"), Some(&json!("radio")));

        // re-encoding keeps the unknown field
        let again = encode(&decoded).unwrap();
        assert!(again.contains("pledge_channel"));
    }
}
