use std::time::Duration;

use archivist_core::ContentId;
use archivist_node::{ObjectStore, ObjectStoreError};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode};

/// Fetches objects over HTTP as `GET {endpoint}/{bucket}/{content id}`.
pub struct HttpObjectStore {
    client: Client,
    endpoint: String,
    bucket: String,
    credentials: Option<(String, String)>,
}

impl HttpObjectStore {
    pub fn new(
        endpoint: &str,
        bucket: &str,
        credentials: Option<(String, String)>,
        timeout: Duration,
    ) -> Result<Self, ObjectStoreError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ObjectStoreError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            bucket: bucket.trim_matches('/').to_string(),
            credentials,
        })
    }

    fn object_url(&self, id: &ContentId) -> String {
        format!("{}/{}/{}", self.endpoint, self.bucket, id)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn fetch(&self, id: &ContentId) -> Result<Bytes, ObjectStoreError> {
        let mut request = self.client.get(self.object_url(id));
        if let Some((key, secret)) = &self.credentials {
            request = request.basic_auth(key, Some(secret));
        }
        let response = request
            .send()
            .await
            .map_err(|err| ObjectStoreError::Transport(err.to_string()))?;
        match response.status() {
            StatusCode::NOT_FOUND => Err(ObjectStoreError::NotFound(id.clone())),
            status if status.is_success() => response
                .bytes()
                .await
                .map_err(|err| ObjectStoreError::Transport(err.to_string())),
            status => Err(ObjectStoreError::Transport(format!(
                "object store returned {status} for {id}"
            ))),
        }
    }
}
