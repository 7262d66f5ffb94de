use std::sync::Arc;
use std::time::Duration;

use archivist_queue::{DelayedQueue, Delivery, QueueError};
use futures_util::future::try_join_all;
use thiserror::Error;
use tracing::{error, info};

use crate::config::ReuploadConfig;
use crate::ledger::{Ledger, LedgerError, SignedItem, Submission};
use crate::messages::{VerifySubmission, VERIFY_BUNDLED_TX};
use crate::object_store::{ObjectStore, ObjectStoreError};

#[derive(Debug, Error)]
pub enum ReuploadError {
    #[error("submission lists differ in length")]
    Inconsistent,
    #[error(transparent)]
    Fetch(#[from] ObjectStoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReuploadOutcome {
    /// Rebuilt and broadcast again; a new confirmation check is scheduled.
    Rebroadcast { txid: String },
    /// Failed; the confirmation check was rescheduled immediately.
    Rescheduled { txid: String },
    /// Undecodable message, acknowledged.
    Dropped,
}

/// Rebuilds an unconfirmed submission from the object store, keeping every
/// item's original signature, and broadcasts it again.
pub struct Reuploader {
    queue: DelayedQueue,
    store: Arc<dyn ObjectStore>,
    ledger: Arc<dyn Ledger>,
    config: ReuploadConfig,
}

impl Reuploader {
    pub fn new(
        queue: DelayedQueue,
        store: Arc<dyn ObjectStore>,
        ledger: Arc<dyn Ledger>,
        config: ReuploadConfig,
    ) -> Self {
        Self {
            queue,
            store,
            ledger,
            config,
        }
    }

    pub async fn handle(&self, delivery: Delivery) -> ReuploadOutcome {
        let msg: VerifySubmission = match delivery.decode() {
            Ok(msg) => msg,
            Err(err) => {
                error!("reupload: dropping undecodable message: {err}");
                settle(&delivery).await;
                return ReuploadOutcome::Dropped;
            }
        };

        match self.reupload(&msg).await {
            Ok(submission) => {
                info!("reupload: submission {} was broadcast again", submission.id);
                settle(&delivery).await;
                ReuploadOutcome::Rebroadcast { txid: msg.txid }
            }
            Err(err) => {
                error!(
                    "reupload: rebuilding {} failed, will verify again: {err}",
                    msg.txid
                );
                if let Err(err) = self
                    .queue
                    .publish_delayed(VERIFY_BUNDLED_TX, &msg.restamped(), Duration::ZERO)
                    .await
                {
                    error!("reupload: rescheduling {} failed, requeueing: {err}", msg.txid);
                    if let Err(err) = delivery.reject_and_requeue().await {
                        error!("reupload: requeue of {} failed: {err}", msg.txid);
                    }
                    return ReuploadOutcome::Rescheduled { txid: msg.txid };
                }
                settle(&delivery).await;
                ReuploadOutcome::Rescheduled { txid: msg.txid }
            }
        }
    }

    async fn reupload(&self, msg: &VerifySubmission) -> Result<Submission, ReuploadError> {
        if !msg.is_consistent() {
            return Err(ReuploadError::Inconsistent);
        }
        let rebuilt = msg
            .chunk_ids
            .iter()
            .zip(&msg.signatures)
            .zip(&msg.fields)
            .map(|((id, signature), fields)| async move {
                let data = self.store.fetch(id).await?;
                let mut item = self.ledger.rebuild_item(data, fields).await?;
                item.replace_signature(signature.clone());
                Ok::<SignedItem, ReuploadError>(item)
            });
        let items = try_join_all(rebuilt).await?;

        let submission = self.ledger.rebundle(&msg.txid, &items).await?;
        self.ledger.broadcast(&submission).await?;
        // Scheduled only after a successful broadcast; the failure path
        // schedules its own immediate check.
        self.queue
            .publish_delayed(
                VERIFY_BUNDLED_TX,
                &msg.restamped(),
                self.config.verify_submission_interval,
            )
            .await?;
        Ok(submission)
    }
}

async fn settle(delivery: &Delivery) {
    if let Err(err) = delivery.ack().await {
        error!("reupload: ack of {:?} failed: {err}", delivery.handle());
    }
}
