//! Core archivist primitives shared across crates.
//!
//! Includes the content-id type, hash helper, ordered metadata fields,
//! signature bytes, and base errors.

pub mod error;
pub mod hash;
pub mod types;

pub use error::ArchivistError;
pub use types::{ContentId, Fields, Signature, CONTENT_ID_HEX_LEN};
