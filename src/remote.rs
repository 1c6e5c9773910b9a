//! Boundary to the vendor gift API.
//!
//! The ledger never calls the remote API while a transaction is open: local
//! state is committed first, the call is made, and its outcome is recorded in
//! a second short transaction. A remote failure is data, not an error.
//!
//! Once a remote call has returned, its outcome is recorded even if the
//! caller cancelled meanwhile; otherwise the ledger would lose track of a
//! gift that exists remotely.
use crate::cancel::CancellationToken;
use crate::db::deletion::{self, RemoteDeleteOutcome};
use crate::db::ledger::{self, RemoteCreateOutcome};
use crate::db::{outbound, query, DeletionOutcome, OutboundTransaction, Pool};
use crate::error::{LedgerError, Result};
use crate::model::Actor;
use async_trait::async_trait;
use serde_json::Value;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[async_trait]
pub trait RemoteGiftApi: Send + Sync {
    /// Create a gift from a fully formed request; returns the remote gift id.
    async fn create_remote_gift(&self, payload: &Value) -> anyhow::Result<String>;

    async fn delete_remote_gift(&self, remote_gift_id: &str) -> anyhow::Result<()>;
}

/// Send a saved workflow's gift to the remote API and record the outcome on
/// the gift line and workflow.
#[instrument(skip_all, fields(workflow_id = %workflow_id))]
pub async fn post_gift(
    pool: &Pool,
    api: &dyn RemoteGiftApi,
    workflow_id: Uuid,
    payload: &Value,
    cancel: &CancellationToken,
) -> Result<RemoteCreateOutcome> {
    if query::live_gift_line(pool, workflow_id).await?.is_none() {
        return Err(LedgerError::not_found("live gift line for workflow", workflow_id));
    }
    cancel.check()?;

    let outcome = match api.create_remote_gift(payload).await {
        Ok(remote_gift_id) => RemoteCreateOutcome::succeeded(remote_gift_id),
        Err(err) => {
            warn!(?err, "remote create failed");
            RemoteCreateOutcome::failed(format!("{err:#}"))
        }
    };
    ledger::record_remote_create_outcome(pool, workflow_id, &outcome, &CancellationToken::new())
        .await?;
    Ok(outcome)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GiftDeletion {
    pub local: DeletionOutcome,
    /// `None` when the gift never reached the remote API.
    pub remote: Option<RemoteDeleteOutcome>,
}

/// Admin delete: snapshot and soft-delete locally, then delete the remote
/// gift if one was created, then record that outcome.
#[instrument(skip_all, fields(workflow_id = %workflow_id))]
pub async fn delete_gift(
    pool: &Pool,
    api: &dyn RemoteGiftApi,
    workflow_id: Uuid,
    actor: &Actor,
    reason: &str,
    cancel: &CancellationToken,
) -> Result<GiftDeletion> {
    let local = deletion::mark_deleted(pool, workflow_id, actor, reason, cancel).await?;
    let Some(remote_gift_id) = local.remote_gift_id.clone() else {
        info!("no remote gift to delete");
        return Ok(GiftDeletion { local, remote: None });
    };
    cancel.check()?;

    let outcome = match api.delete_remote_gift(&remote_gift_id).await {
        Ok(()) => RemoteDeleteOutcome::succeeded(),
        Err(err) => {
            warn!(?err, %remote_gift_id, "remote delete failed");
            RemoteDeleteOutcome::failed(format!("{err:#}"))
        }
    };
    deletion::record_remote_delete_outcome(pool, workflow_id, &outcome, &CancellationToken::new())
        .await?;
    Ok(GiftDeletion {
        local,
        remote: Some(outcome),
    })
}

/// Process one pending pledge-create from the outbound queue. Returns the
/// processed row, or `None` when the queue is empty.
#[instrument(skip_all)]
pub async fn process_next_pledge(
    pool: &Pool,
    api: &dyn RemoteGiftApi,
    cancel: &CancellationToken,
) -> Result<Option<OutboundTransaction>> {
    let Some(item) = outbound::claim_next_pending(pool, cancel).await? else {
        return Ok(None);
    };
    // The row is already `processing`; it must leave that state whatever the
    // caller does next.
    let record = CancellationToken::new();
    match api.create_remote_gift(&item.request_payload).await {
        Ok(remote_id) => {
            outbound::mark_succeeded(pool, item.id, &remote_id, &record).await?;
        }
        Err(err) => {
            warn!(?err, id = item.id, attempt = item.attempt_count, "pledge create failed");
            outbound::mark_failed(pool, item.id, &format!("{err:#}"), &record).await?;
        }
    }
    outbound::get_transaction(pool, item.workflow_id, item.transaction_type).await
}
