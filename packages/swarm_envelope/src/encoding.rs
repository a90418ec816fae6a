//! Text-safe encoding for sealed payloads: standard, padded base64.

/// Encode bytes as standard padded base64.
pub fn base64_encode(bytes: &[u8]) -> String {
    data_encoding::BASE64.encode(bytes)
}

/// Decode standard padded base64.
pub fn base64_decode(s: &str) -> Result<Vec<u8>, data_encoding::DecodeError> {
    data_encoding::BASE64.decode(s.trim().as_bytes())
}
