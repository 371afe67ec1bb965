//! Canonical mapping between user keys and log subject tokens.

use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Encodes and decodes the subject-safe token used in place of a raw key.
///
/// Keys may contain arbitrary UTF-8, including `.` and whitespace, which are
/// not safe to embed directly in a subject. Base64 (standard alphabet,
/// padded) of the key's UTF-8 bytes is a reversible, subject-safe encoding:
/// the alphabet contains no `.` and the encoding is injective, so distinct
/// keys never collide.
pub struct SubjectCodec;

impl SubjectCodec {
    /// Encodes `key` into a subject-safe token.
    pub fn encode(key: &str) -> String {
        STANDARD.encode(key.as_bytes())
    }

    /// Decodes a token produced by [`SubjectCodec::encode`] back into the
    /// original key.
    pub fn decode(token: &str) -> Result<String, DecodeError> {
        let bytes = STANDARD.decode(token)?;
        String::from_utf8(bytes).map_err(DecodeError::Utf8)
    }

    /// Builds the subject used for PUT events on `key` within `stream`.
    pub fn put_subject(stream: &str, key: &str) -> String {
        format!("{stream}.{}-put", Self::encode(key))
    }

    /// Builds the subject used for DELETE events on `key` within `stream`.
    pub fn delete_subject(stream: &str, key: &str) -> String {
        format!("{stream}.{}-delete", Self::encode(key))
    }

    /// Builds the wildcard subject filter covering every event in `stream`.
    pub fn stream_filter(stream: &str) -> String {
        format!("{stream}.*")
    }
}

/// Failure decoding a subject token back into a key.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The token was not valid base64.
    #[error("invalid base64 token: {0}")]
    Base64(#[from] base64::DecodeError),
    /// The decoded bytes were not valid UTF-8.
    #[error("decoded token is not valid UTF-8: {0}")]
    Utf8(std::string::FromUtf8Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_is_lossless_for_special_keys() {
        let keys = [
            "plain",
            "!@#$%^&*()_+",
            "has.dots.in.it",
            "has whitespace here",
            "emoji-🔑-key",
            "",
        ];
        for key in keys {
            let token = SubjectCodec::encode(key);
            assert!(!token.contains('.'), "token must be subject-safe: {token}");
            let decoded = SubjectCodec::decode(&token).unwrap();
            assert_eq!(decoded, key);
        }
    }

    #[test]
    fn distinct_keys_never_collide() {
        let a = SubjectCodec::encode("abc");
        let b = SubjectCodec::encode("abd");
        assert_ne!(a, b);
    }

    #[test]
    fn subjects_are_namespaced_by_stream_and_kind() {
        let put = SubjectCodec::put_subject("orders", "k1");
        let del = SubjectCodec::delete_subject("orders", "k1");
        assert!(put.starts_with("orders."));
        assert!(put.ends_with("-put"));
        assert!(del.ends_with("-delete"));
        assert_ne!(put, del);
    }
}
