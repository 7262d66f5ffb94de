use std::time::{SystemTime, UNIX_EPOCH};

use archivist_core::{ContentId, Fields, Signature};
use serde::{Deserialize, Serialize};

/// Intake topic; consumed as a plain queue.
pub const UPLOAD: &str = "upload";
/// Unconfirmed submissions to rebuild and broadcast again.
pub const REUPLOAD: &str = "reupload";
/// Delayed confirmation check for a whole submission.
pub const VERIFY_BUNDLED_TX: &str = "verifyBundledTx";
/// Delayed retry for a single item after a failed attempt.
pub const VERIFY_CHUNK_ID: &str = "verifyChunkId";
/// Long-horizon confirmation check for a single submitted item.
pub const VERIFY_CHUNK_ID_LONG: &str = "verifyChunkIdLong";

/// Tag carrying the integration major version on enqueued items.
pub const FIELD_VERSION_MAJOR: &str = "__pn_integration_version_major";
pub const FIELD_VERSION_MINOR: &str = "__pn_integration_version_minor";
pub const FIELD_CHUNK_ID: &str = "__pn_chunk_id";
pub const FIELD_CHUNK_ID_VERSIONED: &str = "__pn_chunk_1.8_id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    pub chunk_id: ContentId,
    #[serde(default)]
    pub fields: Fields,
}

impl UploadRequest {
    /// Request tagged with the standard integration fields.
    pub fn with_integration_fields(chunk_id: ContentId) -> Self {
        let fields = [
            (FIELD_VERSION_MAJOR, "1"),
            (FIELD_VERSION_MINOR, "8"),
            (FIELD_CHUNK_ID, chunk_id.as_str()),
            (FIELD_CHUNK_ID_VERSIONED, chunk_id.as_str()),
        ]
        .into_iter()
        .collect();
        Self { chunk_id, fields }
    }
}

/// Everything needed to check, and if needed rebuild, one submission.
/// The four lists are parallel: entry `i` of each describes item `i`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySubmission {
    pub txid: String,
    pub created_at: u64,
    pub chunk_ids: Vec<ContentId>,
    pub signatures: Vec<Signature>,
    pub fields: Vec<Fields>,
}

impl VerifySubmission {
    pub fn is_consistent(&self) -> bool {
        self.chunk_ids.len() == self.signatures.len() && self.chunk_ids.len() == self.fields.len()
    }

    pub fn restamped(&self) -> Self {
        Self {
            created_at: now_millis(),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyChunk {
    #[serde(flatten)]
    pub request: UploadRequest,
    pub created_at: u64,
}

impl VerifyChunk {
    pub fn now(request: UploadRequest) -> Self {
        Self {
            request,
            created_at: now_millis(),
        }
    }
}

/// Milliseconds since the unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use archivist_core::{ContentId, Signature};
    use serde_json::json;

    use super::{UploadRequest, VerifyChunk, VerifySubmission};

    const ID: &str = "c2cfe318ecfcf4d02391b1734a259e2dfa15aa43b3b64d4d0e6a13686f3fc70c";

    #[test]
    fn upload_request_uses_camel_case_and_defaults_fields() {
        let req: UploadRequest =
            serde_json::from_value(json!({ "chunkId": ID })).expect("decode upload");
        assert_eq!(req.chunk_id.as_str(), ID);
        assert!(req.fields.is_empty());
    }

    #[test]
    fn integration_fields_are_ordered() {
        let req = UploadRequest::with_integration_fields(ContentId::parse(ID).expect("id"));
        let names: Vec<&str> = req.fields.iter().map(|(k, _)| k).collect();
        assert_eq!(
            names,
            vec![
                "__pn_integration_version_major",
                "__pn_integration_version_minor",
                "__pn_chunk_id",
                "__pn_chunk_1.8_id"
            ]
        );
        assert_eq!(req.fields.get("__pn_chunk_id"), Some(ID));
    }

    #[test]
    fn verify_chunk_flattens_the_request() {
        let chunk = VerifyChunk {
            request: UploadRequest::with_integration_fields(ContentId::parse(ID).expect("id")),
            created_at: 1_700_000_000_000,
        };
        let value = serde_json::to_value(&chunk).expect("encode");
        assert_eq!(value["chunkId"], ID);
        assert_eq!(value["createdAt"], 1_700_000_000_000_u64);
        assert_eq!(value["fields"]["__pn_integration_version_minor"], "8");
    }

    #[test]
    fn verify_submission_wire_shape() {
        let msg: VerifySubmission = serde_json::from_value(json!({
            "txid": "tx-1",
            "createdAt": 5,
            "chunkIds": [ID],
            "signatures": ["-_8B"],
            "fields": [{ "a": "1" }]
        }))
        .expect("decode");
        assert!(msg.is_consistent());
        assert_eq!(msg.signatures, vec![Signature(vec![0xfb, 0xff, 0x01])]);
        assert!(msg.restamped().created_at > 5);
    }

    #[test]
    fn mismatched_lists_are_inconsistent() {
        let msg = VerifySubmission {
            txid: "tx".to_string(),
            created_at: 0,
            chunk_ids: vec![ContentId::parse(ID).expect("id")],
            signatures: vec![],
            fields: vec![],
        };
        assert!(!msg.is_consistent());
    }
}
