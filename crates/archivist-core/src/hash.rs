/// Computes the 32-byte BLAKE3 digest used to address stored content.
pub fn content_digest(input: &[u8]) -> [u8; 32] {
    *blake3::hash(input).as_bytes()
}

/// Hex-encoded content digest, i.e. the textual content id of `input`.
pub fn content_digest_hex(input: &[u8]) -> String {
    hex::encode(content_digest(input))
}

#[cfg(test)]
mod tests {
    use super::{content_digest, content_digest_hex};

    #[test]
    fn hash_is_deterministic() {
        let input = b"archivist";
        assert_eq!(content_digest(input), content_digest(input));
    }

    #[test]
    fn hash_changes_when_input_changes() {
        assert_ne!(content_digest(b"chunk-a"), content_digest(b"chunk-b"));
    }

    #[test]
    fn hex_digest_is_64_lowercase_chars() {
        let id = content_digest_hex(b"chunk");
        assert_eq!(id.len(), 64);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }
}
