use std::collections::HashMap;
use std::sync::Mutex;

use archivist_core::ContentId;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object {0} not found")]
    NotFound(ContentId),
    #[error("object store transport error: {0}")]
    Transport(String),
}

/// Read access to the object store holding pending content.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn fetch(&self, id: &ContentId) -> Result<Bytes, ObjectStoreError>;
}

/// Process-local store, keyed by content id.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<ContentId, Bytes>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `data` under its own content id and returns that id.
    pub fn put(&self, data: impl Into<Bytes>) -> ContentId {
        let data = data.into();
        let id = ContentId::of(&data);
        self.put_as(id.clone(), data);
        id
    }

    /// Stores `data` under an arbitrary id, matching or not.
    pub fn put_as(&self, id: ContentId, data: impl Into<Bytes>) {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, data.into());
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn fetch(&self, id: &ContentId) -> Result<Bytes, ObjectStoreError> {
        self.objects
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound(id.clone()))
    }
}
