//! Batching, retry and admission control for archiving content to a
//! pay-per-byte ledger.
//!
//! Intake deliveries are validated and staged in a [`batch::PendingPool`];
//! [`uploader::BatchUploader`] flushes the pool by size or age into one
//! ledger submission and settles every item once it resolves. Funding
//! shortfalls pause intake through [`backpressure::BackpressureController`],
//! and [`reupload::Reuploader`] rebuilds unconfirmed submissions with their
//! original signatures.

pub mod backpressure;
pub mod batch;
pub mod config;
pub mod consumer;
pub mod ledger;
pub mod messages;
pub mod object_store;
pub mod reupload;
pub mod uploader;

pub use backpressure::{
    AffordabilityProbe, BackpressureController, IntakeGate, ProbeConfig, ProbeError, ProbeFn,
};
pub use batch::{AddOutcome, PendingPool};
pub use config::{ReuploadConfig, UploaderConfig};
pub use consumer::run_consumer;
pub use ledger::{Ledger, LedgerError, SignedItem, Submission};
pub use object_store::{MemoryObjectStore, ObjectStore, ObjectStoreError};
pub use reupload::{ReuploadError, ReuploadOutcome, Reuploader};
pub use uploader::{BatchUploader, DropReason, FlushOutcome, IntakeOutcome, PendingItem};
