use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use archivist_core::ContentId;
use archivist_queue::{DelayedQueue, Delivery};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::backpressure::{
    AffordabilityProbe, BackpressureController, ProbeConfig, ProbeError, ProbeFn,
};
use crate::batch::{AddOutcome, PendingPool};
use crate::config::UploaderConfig;
use crate::ledger::{Ledger, LedgerError, SignedItem, Submission};
use crate::messages::{
    now_millis, UploadRequest, VerifyChunk, VerifySubmission, VERIFY_BUNDLED_TX,
    VERIFY_CHUNK_ID, VERIFY_CHUNK_ID_LONG,
};
use crate::object_store::{ObjectStore, ObjectStoreError};

/// An accepted item waiting in the pool. Owns its inbound delivery until
/// the batch it lands in settles it.
pub struct PendingItem {
    pub request: UploadRequest,
    pub content_length: u64,
    pub signed: SignedItem,
    delivery: Delivery,
}

/// Why an intake message was acknowledged without being archived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    Missing,
    IntegrityMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Added to the pool without triggering a flush.
    Queued { pending: usize },
    /// Same content id already pending; acknowledged.
    Duplicate,
    /// Permanent failure; acknowledged and dropped.
    Dropped(DropReason),
    /// Transient failure before pooling; moved to the delayed retry topic.
    Deferred,
    /// The add triggered a flush.
    Flushed(FlushOutcome),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    Empty,
    Submitted { txid: String, items: usize },
    Underfunded { items: usize },
    Failed { items: usize },
}

/// The pending age timer. Dropping it cancels the timer if it is still
/// sleeping; once awake, the timer only flushes while it still owns the slot.
struct FlushTimer {
    id: u64,
    _cancel: oneshot::Sender<()>,
}

/// Accumulates intake into batches and settles every item once its batch
/// resolves.
pub struct BatchUploader {
    queue: DelayedQueue,
    store: Arc<dyn ObjectStore>,
    ledger: Arc<dyn Ledger>,
    backpressure: BackpressureController,
    config: UploaderConfig,
    pool: PendingPool<ContentId, PendingItem>,
    flush_timer: Mutex<Option<FlushTimer>>,
    timer_ids: AtomicU64,
}

impl BatchUploader {
    pub fn new(
        queue: DelayedQueue,
        store: Arc<dyn ObjectStore>,
        ledger: Arc<dyn Ledger>,
        backpressure: BackpressureController,
        config: UploaderConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            store,
            ledger,
            backpressure,
            config,
            pool: PendingPool::new(),
            flush_timer: Mutex::new(None),
            timer_ids: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    pub fn pending(&self) -> usize {
        self.pool.len()
    }

    pub fn has_flush_timer(&self) -> bool {
        self.flush_timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Validates one intake message and offers it to the pool.
    pub async fn handle_upload(self: &Arc<Self>, delivery: Delivery) -> IntakeOutcome {
        let request: UploadRequest = match delivery.decode() {
            Ok(request) => request,
            Err(err) => {
                warn!("uploader: dropping undecodable intake message: {err}");
                ack_logged(&delivery).await;
                return IntakeOutcome::Dropped(DropReason::Malformed);
            }
        };
        let id = request.chunk_id.clone();

        let data = match self.store.fetch(&id).await {
            Ok(data) => data,
            Err(ObjectStoreError::NotFound(_)) => {
                error!(fatal = true, "uploader: {id} not found in object store, dropping");
                ack_logged(&delivery).await;
                return IntakeOutcome::Dropped(DropReason::Missing);
            }
            Err(err) => {
                error!("uploader: fetching {id} failed: {err}");
                self.defer(request, &delivery).await;
                return IntakeOutcome::Deferred;
            }
        };

        if !id.matches(&data) {
            error!(
                fatal = true,
                "uploader: integrity failure for {id}, content hashes to {}",
                ContentId::of(&data)
            );
            ack_logged(&delivery).await;
            return IntakeOutcome::Dropped(DropReason::IntegrityMismatch);
        }

        let content_length = data.len() as u64;
        let signed = match self.ledger.create_item(data, &request.fields).await {
            Ok(signed) => signed,
            Err(err) => {
                error!("uploader: signing {id} failed: {err}");
                self.defer(request, &delivery).await;
                return IntakeOutcome::Deferred;
            }
        };

        let item = PendingItem {
            request,
            content_length,
            signed,
            delivery,
        };
        match self.pool.try_add(id.clone(), item) {
            AddOutcome::AlreadyQueued(item) => {
                debug!("uploader: {id} already queued");
                ack_logged(&item.delivery).await;
                IntakeOutcome::Duplicate
            }
            AddOutcome::Added { size, age } => {
                if size >= self.config.max_batch_size || age >= self.config.batch_timeout {
                    IntakeOutcome::Flushed(self.flush().await)
                } else {
                    self.schedule_flush(self.config.batch_timeout.saturating_sub(age));
                    IntakeOutcome::Queued { pending: size }
                }
            }
        }
    }

    /// Starts the age timer unless one is already pending.
    fn schedule_flush(self: &Arc<Self>, after: Duration) {
        let mut slot = self.flush_timer.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }
        let id = self.timer_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let (cancel, cancelled) = oneshot::channel::<()>();
        *slot = Some(FlushTimer {
            id,
            _cancel: cancel,
        });
        debug!("uploader: flush timer {id} scheduled in {}ms", after.as_millis());
        let uploader = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => {}
                _ = cancelled => return,
            }
            if !uploader.release_timer(id) {
                debug!("uploader: flush timer {id} superseded");
                return;
            }
            let outcome = uploader.flush_pending().await;
            debug!("uploader: timed flush finished: {outcome:?}");
        });
    }

    /// Clears the timer slot if timer `id` still owns it.
    fn release_timer(&self, id: u64) -> bool {
        let mut slot = self.flush_timer.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|timer| timer.id == id) {
            slot.take();
            true
        } else {
            false
        }
    }

    /// Cancels the pending timer, then drains and submits the pool.
    pub async fn flush(&self) -> FlushOutcome {
        // A timer already past its sleep finds the slot empty and stands down.
        self.flush_timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        self.flush_pending().await
    }

    async fn flush_pending(&self) -> FlushOutcome {
        let items: Vec<PendingItem> = self
            .pool
            .drain_all()
            .into_iter()
            .map(|(_, item)| item)
            .collect();
        if items.is_empty() {
            return FlushOutcome::Empty;
        }
        let total_size: u64 = items.iter().map(|item| item.content_length).sum();
        info!(
            "uploader: creating submission for {} item(s), {total_size} bytes",
            items.len()
        );
        let signed: Vec<SignedItem> = items.iter().map(|item| item.signed.clone()).collect();

        let err = match self.submit(&signed).await {
            Ok(submission) => return self.settle_submitted(submission, &items).await,
            Err(err) => err,
        };
        if self.is_underfunded(&err, total_size).await {
            return self.settle_underfunded(total_size, &items).await;
        }
        error!(
            "uploader: submission of {} item(s) failed: {err}",
            items.len()
        );
        for item in &items {
            self.defer(item.request.clone(), &item.delivery).await;
        }
        FlushOutcome::Failed { items: items.len() }
    }

    async fn submit(&self, signed: &[SignedItem]) -> Result<Submission, LedgerError> {
        let submission = self.ledger.bundle(signed).await?;
        self.ledger.broadcast(&submission).await?;
        Ok(submission)
    }

    async fn is_underfunded(&self, err: &LedgerError, total_size: u64) -> bool {
        if !err.is_funding_related() {
            return false;
        }
        if matches!(err, LedgerError::InsufficientFunds) {
            return true;
        }
        match affordable(self.ledger.as_ref(), total_size).await {
            Ok(affordable) => !affordable,
            Err(check) => {
                warn!("uploader: balance check after rejected headers failed: {check}");
                false
            }
        }
    }

    async fn settle_submitted(&self, submission: Submission, items: &[PendingItem]) -> FlushOutcome {
        let verify = VerifySubmission {
            txid: submission.id.clone(),
            created_at: now_millis(),
            chunk_ids: items.iter().map(|i| i.request.chunk_id.clone()).collect(),
            signatures: items.iter().map(|i| i.signed.signature.clone()).collect(),
            fields: items.iter().map(|i| i.request.fields.clone()).collect(),
        };
        if let Err(err) = self
            .queue
            .publish_delayed(
                VERIFY_BUNDLED_TX,
                &verify,
                self.config.verify_submission_interval,
            )
            .await
        {
            // Without a submission check nothing would ever reupload it, so
            // each item goes through the per-item retry path instead.
            error!(
                "uploader: scheduling confirmation for {} failed, deferring its items: {err}",
                submission.id
            );
            for item in items {
                self.defer(item.request.clone(), &item.delivery).await;
            }
            return FlushOutcome::Submitted {
                txid: submission.id,
                items: items.len(),
            };
        }
        for item in items {
            let check = VerifyChunk::now(item.request.clone());
            match self
                .queue
                .publish_delayed(VERIFY_CHUNK_ID_LONG, &check, self.config.verify_chunk_interval)
                .await
            {
                Ok(()) => ack_logged(&item.delivery).await,
                Err(err) => {
                    error!(
                        "uploader: scheduling long check for {} failed, deferring: {err}",
                        item.request.chunk_id
                    );
                    self.defer(item.request.clone(), &item.delivery).await;
                }
            }
        }
        info!(
            "uploader: submission {} broadcast with {} item(s)",
            submission.id,
            items.len()
        );
        FlushOutcome::Submitted {
            txid: submission.id,
            items: items.len(),
        }
    }

    async fn settle_underfunded(&self, total_size: u64, items: &[PendingItem]) -> FlushOutcome {
        error!(
            fatal = true,
            "uploader: not enough funds for {total_size} bytes, pausing {} until funds are loaded",
            self.config.intake_source
        );
        self.backpressure.pause(
            &self.config.intake_source,
            ProbeConfig::new(
                funding_probe(Arc::clone(&self.ledger), total_size),
                self.config.health_check_interval,
            ),
        );
        for item in items {
            if let Err(err) = item.delivery.reject_and_requeue().await {
                error!(
                    "uploader: requeue of {} failed: {err}",
                    item.request.chunk_id
                );
            }
        }
        FlushOutcome::Underfunded { items: items.len() }
    }

    /// Hands the item to the delayed retry topic, then releases the intake
    /// message. Falls back to an immediate requeue if the handoff fails.
    async fn defer(&self, request: UploadRequest, delivery: &Delivery) {
        let id = request.chunk_id.clone();
        let retry = VerifyChunk::now(request);
        match self
            .queue
            .publish_delayed(VERIFY_CHUNK_ID, &retry, self.config.requeue_after_error)
            .await
        {
            Ok(()) => ack_logged(delivery).await,
            Err(err) => {
                error!("uploader: deferring {id} failed, requeueing: {err}");
                if let Err(err) = delivery.reject_and_requeue().await {
                    error!("uploader: requeue of {id} failed: {err}");
                }
            }
        }
    }
}

/// True when the balance covers the price of `total_size` bytes.
async fn affordable(ledger: &dyn Ledger, total_size: u64) -> Result<bool, LedgerError> {
    let balance = ledger.balance().await?;
    let price = ledger.price(total_size).await?;
    Ok(balance >= price)
}

fn funding_probe(ledger: Arc<dyn Ledger>, total_size: u64) -> Arc<dyn AffordabilityProbe> {
    Arc::new(ProbeFn(move || {
        let ledger = Arc::clone(&ledger);
        async move {
            affordable(ledger.as_ref(), total_size)
                .await
                .map_err(|err| ProbeError(err.to_string()))
        }
    }))
}

async fn ack_logged(delivery: &Delivery) {
    if let Err(err) = delivery.ack().await {
        error!("uploader: ack of {:?} failed: {err}", delivery.handle());
    }
}
