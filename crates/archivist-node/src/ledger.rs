use archivist_core::hash::content_digest;
use archivist_core::{Fields, Signature};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures reported by the ledger collaborator.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The network refused the submission headers. Often a funding issue,
    /// confirmed separately against balance and price.
    #[error("ledger nodes rejected the submission headers: {0}")]
    HeadersRejected(String),
    #[error("insufficient funds for submission")]
    InsufficientFunds,
    #[error("ledger transport error: {0}")]
    Transport(String),
    #[error("ledger rejected request: {0}")]
    Rejected(String),
}

impl LedgerError {
    pub fn is_funding_related(&self) -> bool {
        matches!(
            self,
            LedgerError::HeadersRejected(_) | LedgerError::InsufficientFunds
        )
    }
}

/// One signed data item ready to be bundled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedItem {
    /// Item id, derived from the signature.
    pub id: String,
    pub signature: Signature,
    pub fields: Fields,
    #[serde(skip)]
    pub data: Bytes,
}

impl SignedItem {
    /// Id of an item carrying `signature`.
    pub fn id_for(signature: &Signature) -> String {
        Signature(content_digest(signature.as_bytes()).to_vec()).to_base64url()
    }

    /// Substitutes a previously recorded signature and re-derives the id.
    pub fn replace_signature(&mut self, signature: Signature) {
        self.id = Self::id_for(&signature);
        self.signature = signature;
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A bundled submission accepted for broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub id: String,
    pub item_ids: Vec<String>,
}

/// Signing, bundling and broadcast against the pay-per-byte ledger.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Signs a single item over `data` and `fields`.
    async fn create_item(&self, data: Bytes, fields: &Fields) -> Result<SignedItem, LedgerError>;

    /// Rebuilds an item deterministically without signing it.
    async fn rebuild_item(&self, data: Bytes, fields: &Fields) -> Result<SignedItem, LedgerError>;

    /// Signs and bundles `items` into a new submission.
    async fn bundle(&self, items: &[SignedItem]) -> Result<Submission, LedgerError>;

    /// Bundles already-signed `items` again under an existing submission id.
    async fn rebundle(
        &self,
        submission_id: &str,
        items: &[SignedItem],
    ) -> Result<Submission, LedgerError>;

    async fn broadcast(&self, submission: &Submission) -> Result<(), LedgerError>;

    /// Cost of storing `bytes` bytes, in the ledger's smallest unit.
    async fn price(&self, bytes: u64) -> Result<u128, LedgerError>;

    async fn balance(&self) -> Result<u128, LedgerError>;
}
