//! # Cryptographic Primitives for the Roster
//!
//! Everything that touches key material or signature bytes flows through
//! here:
//!
//! - **keys** — the P-384 keypair: load from disk, or generate and persist
//!   once, then sign.
//! - **der** — conversion between the DER `SEQUENCE { r, s }` form that
//!   signing produces and the fixed 96-byte `r || s` form that raw
//!   verifiers consume.
//! - **signer** — binds signing to a user record's email.
//! - **verifier** — the consumer side: check one record, or a whole batch
//!   concurrently, keeping only what verifies.
//!
//! ## Signing input
//!
//! The signed message is always exactly the UTF-8 bytes of the email,
//! digested with SHA-384 and signed with ECDSA over P-384. No trimming, no
//! case folding. Changing any part of that triple invalidates every
//! signature already in storage.

pub mod der;
pub mod keys;
pub mod signer;
pub mod verifier;

pub use der::{to_raw, to_structured, CodecError};
pub use keys::{KeyError, KeyStore, PublicKeyInfo};
pub use signer::RecordSigner;
pub use verifier::{verify_and_filter, verify_one, SignatureVerifier, VerifyError};

/// The canonical bytes a record's signature covers.
///
/// Shared by the signer and the verifier so the two sides can never drift.
pub fn signable_payload(email: &str) -> &[u8] {
    email.as_bytes()
}

/// Non-empty and made only of `0-9a-f`. The only accepted spelling of a
/// record signature.
pub fn is_lower_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}
