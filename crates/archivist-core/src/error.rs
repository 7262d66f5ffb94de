use thiserror::Error;

/// Rejections raised while parsing wire-level primitives.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArchivistError {
    #[error("invalid content id: {0}")]
    InvalidContentId(&'static str),
    #[error("invalid signature: {0}")]
    InvalidSignature(&'static str),
}

#[cfg(test)]
mod tests {
    use crate::{ContentId, Signature};

    use super::ArchivistError;

    #[test]
    fn parse_failures_name_the_primitive() {
        assert_eq!(
            ContentId::parse("abc").unwrap_err().to_string(),
            "invalid content id: expected 64 hex chars"
        );
        assert_eq!(
            Signature::from_base64url("not base64!").unwrap_err(),
            ArchivistError::InvalidSignature("not base64url")
        );
    }
}
