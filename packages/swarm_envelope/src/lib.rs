//! Sealed transport envelopes.
//!
//! Every body exchanged with the credential service and every chat frame is
//! wrapped as `{"encrypted": true, "data": "<base64(nonce || ciphertext)>"}`.
//! This crate owns that format and nothing else: no I/O, no async.
//!
//! ```
//! use swarm_envelope::{Sealer, DEFAULT_KEY};
//!
//! let sealer = Sealer::new(&DEFAULT_KEY);
//! let envelope = sealer.seal(b"hello").unwrap();
//! assert_eq!(sealer.open(&envelope).unwrap(), b"hello");
//! ```

pub mod encoding;
pub mod envelope;
pub mod error;

pub use envelope::{DEFAULT_KEY, Envelope, KEY_LEN, NONCE_LEN, Sealer};
pub use error::CryptoError;
