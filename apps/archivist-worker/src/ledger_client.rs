use std::time::Duration;

use archivist_core::{Fields, Signature};
use archivist_node::{Ledger, LedgerError, SignedItem, Submission};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// JSON client for the signing/bundling gateway that holds the wallet.
pub struct GatewayLedger {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct ItemRequest<'a> {
    data: String,
    fields: &'a Fields,
}

#[derive(Deserialize)]
struct ItemResponse {
    id: String,
    signature: Signature,
}

#[derive(Serialize)]
struct WireItem<'a> {
    id: &'a str,
    signature: &'a Signature,
    fields: &'a Fields,
    data: String,
}

#[derive(Serialize)]
struct BundleRequest<'a> {
    items: Vec<WireItem<'a>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmissionResponse {
    id: String,
    #[serde(default)]
    item_ids: Vec<String>,
}

#[derive(Deserialize)]
struct PriceResponse {
    price: String,
}

#[derive(Deserialize)]
struct BalanceResponse {
    balance: String,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl GatewayLedger {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, LedgerError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| LedgerError::Transport(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, LedgerError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(transport)?;
        decode(check(response).await?).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, LedgerError> {
        let response = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(transport)?;
        decode(check(response).await?).await
    }

    async fn item(
        &self,
        path: &str,
        data: Bytes,
        fields: &Fields,
    ) -> Result<SignedItem, LedgerError> {
        let request = ItemRequest {
            data: STANDARD.encode(&data),
            fields,
        };
        let response: ItemResponse = self.post_json(path, &request).await?;
        Ok(SignedItem {
            id: response.id,
            signature: response.signature,
            fields: fields.clone(),
            data,
        })
    }

    async fn submit_bundle(
        &self,
        path: &str,
        items: &[SignedItem],
    ) -> Result<Submission, LedgerError> {
        let request = BundleRequest {
            items: items
                .iter()
                .map(|item| WireItem {
                    id: &item.id,
                    signature: &item.signature,
                    fields: &item.fields,
                    data: STANDARD.encode(&item.data),
                })
                .collect(),
        };
        let response: SubmissionResponse = self.post_json(path, &request).await?;
        Ok(Submission {
            id: response.id,
            item_ids: response.item_ids,
        })
    }
}

fn transport(err: reqwest::Error) -> LedgerError {
    LedgerError::Transport(err.to_string())
}

async fn check(response: Response) -> Result<Response, LedgerError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await.unwrap_or_default();
    Err(error_for(status, &body))
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, LedgerError> {
    response
        .json()
        .await
        .map_err(|err| LedgerError::Transport(format!("invalid gateway response: {err}")))
}

/// Maps a failed gateway response to a ledger error by its `code`.
fn error_for(status: StatusCode, body: &[u8]) -> LedgerError {
    let parsed: ErrorBody = serde_json::from_slice(body).unwrap_or_default();
    let message = if parsed.message.is_empty() {
        format!("gateway returned {status}")
    } else {
        parsed.message
    };
    match parsed.code.as_str() {
        "headers_rejected" => LedgerError::HeadersRejected(message),
        "insufficient_funds" => LedgerError::InsufficientFunds,
        _ if status.is_client_error() => LedgerError::Rejected(message),
        _ => LedgerError::Transport(message),
    }
}

fn parse_amount(raw: &str) -> Result<u128, LedgerError> {
    raw.trim()
        .parse()
        .map_err(|_| LedgerError::Transport(format!("invalid amount from gateway: {raw:?}")))
}

#[async_trait]
impl Ledger for GatewayLedger {
    async fn create_item(&self, data: Bytes, fields: &Fields) -> Result<SignedItem, LedgerError> {
        self.item("/items", data, fields).await
    }

    async fn rebuild_item(&self, data: Bytes, fields: &Fields) -> Result<SignedItem, LedgerError> {
        self.item("/items/rebuild", data, fields).await
    }

    async fn bundle(&self, items: &[SignedItem]) -> Result<Submission, LedgerError> {
        self.submit_bundle("/bundles", items).await
    }

    async fn rebundle(
        &self,
        submission_id: &str,
        items: &[SignedItem],
    ) -> Result<Submission, LedgerError> {
        self.submit_bundle(&format!("/bundles/{submission_id}/rebundle"), items)
            .await
    }

    async fn broadcast(&self, submission: &Submission) -> Result<(), LedgerError> {
        let response = self
            .client
            .post(self.url(&format!("/bundles/{}/broadcast", submission.id)))
            .send()
            .await
            .map_err(transport)?;
        check(response).await?;
        debug!("ledger: broadcast {}", submission.id);
        Ok(())
    }

    async fn price(&self, bytes: u64) -> Result<u128, LedgerError> {
        let response: PriceResponse = self.get_json(&format!("/price/{bytes}")).await?;
        parse_amount(&response.price)
    }

    async fn balance(&self) -> Result<u128, LedgerError> {
        let response: BalanceResponse = self.get_json("/balance").await?;
        parse_amount(&response.balance)
    }
}
