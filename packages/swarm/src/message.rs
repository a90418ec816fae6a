//! The participant message field: `{msg, i, enc}`.
//!
//! `msg` is the text, sealed when `enc` is true. `i` is the sender's
//! sequence number and is what change detection compares.

use serde_json::{Value, json};
use swarm_envelope::{CryptoError, Sealer};
use tracing::debug;

const TEXT_KEY: &str = "msg";
const ENCRYPTED_KEY: &str = "enc";

pub fn encode_message(
    sealer: &Sealer,
    text: &str,
    sequence_key: &str,
    sequence: u64,
) -> Result<Value, CryptoError> {
    let sealed = sealer.seal_text(text)?;
    let mut entry = json!({ TEXT_KEY: sealed, ENCRYPTED_KEY: true });
    entry[sequence_key] = json!(sequence);
    Ok(entry)
}

/// Text of a message entry. A sealed text that does not open is returned
/// as-is; `None` when the entry carries no text at all.
pub fn decode_message(sealer: &Sealer, entry: &Value) -> Option<String> {
    let text = match entry.get(TEXT_KEY) {
        Some(Value::String(s)) if !s.is_empty() => s,
        Some(Value::Null) | None => return None,
        Some(Value::String(_)) => return None,
        Some(other) => return Some(other.to_string()),
    };

    let encrypted = entry
        .get(ENCRYPTED_KEY)
        .and_then(Value::as_bool)
        .unwrap_or(false);
    if !encrypted {
        return Some(text.clone());
    }

    match sealer.open_text(text) {
        Ok(plain) => Some(plain),
        Err(e) => {
            debug!(error = %e, "message did not open, using raw text");
            Some(text.clone())
        }
    }
}
