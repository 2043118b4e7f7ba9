//! # Signature Verification
//!
//! The consumer side of the roster: given records and the public key the
//! server advertised, decide which records to trust.
//!
//! A record that fails verification is not an error. It is a `false`,
//! logged at debug level, and the record is dropped from the trusted set.
//! The only batch-level failures are an unusable public key and a
//! verification task that could not run; both mean "no answer", which is
//! never the same as "no trusted users".
//!
//! ## Signature text
//!
//! The `signature` field must be non-empty lowercase hex. Uppercase digits
//! are rejected rather than folded, so that every single-bit change to the
//! text changes the outcome instead of decoding to the same bytes.

use std::sync::Arc;

use futures::future::join_all;
use p384::ecdsa::signature::DigestVerifier;
use p384::ecdsa::{Signature, VerifyingKey};
use p384::pkcs8::DecodePublicKey;
use sha2::{Digest, Sha384};
use thiserror::Error;

use super::der;
use super::{is_lower_hex, signable_payload};
use crate::user::UserRecord;

#[derive(Debug, Error)]
pub enum VerifyError {
    /// The advertised key cannot be used, so no record can be checked.
    #[error("public key is not a valid P-384 SPKI PEM")]
    InvalidPublicKey,

    #[error("verification task failed: {0}")]
    TaskFailed(String),
}

/// Why a single record was rejected. Only used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    BadHex,
    Malformed,
    OutOfRange,
    Mismatch,
}

/// A parsed public key ready to check record signatures.
///
/// Parsing happens once; checks are `&self` and can run on any number of
/// threads at once.
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    key: VerifyingKey,
}

impl SignatureVerifier {
    /// Parses an SPKI PEM public key. Fails if it is not a P-384 key.
    pub fn from_pem(public_key_pem: &str) -> Result<Self, VerifyError> {
        let key = VerifyingKey::from_public_key_pem(public_key_pem.trim())
            .map_err(|_| VerifyError::InvalidPublicKey)?;
        Ok(Self { key })
    }

    pub fn from_key(key: VerifyingKey) -> Self {
        Self { key }
    }

    /// Checks a hex DER signature over `email`.
    pub fn verify(&self, email: &str, signature_hex: &str) -> bool {
        self.check(email, signature_hex).is_ok()
    }

    /// Checks a record's signature against its email.
    pub fn verify_record(&self, record: &UserRecord) -> bool {
        match self.check(&record.email, &record.signature) {
            Ok(()) => true,
            Err(reason) => {
                tracing::debug!(id = record.id, ?reason, "record rejected");
                false
            }
        }
    }

    fn check(&self, email: &str, signature_hex: &str) -> Result<(), Rejection> {
        let der_bytes = decode_lower_hex(signature_hex).ok_or(Rejection::BadHex)?;
        let raw = der::to_raw(&der_bytes).map_err(|_| Rejection::Malformed)?;
        let signature = Signature::from_slice(&raw).map_err(|_| Rejection::OutOfRange)?;
        let digest = Sha384::new_with_prefix(signable_payload(email));
        self.key
            .verify_digest(digest, &signature)
            .map_err(|_| Rejection::Mismatch)
    }
}

fn decode_lower_hex(s: &str) -> Option<Vec<u8>> {
    if !is_lower_hex(s) {
        return None;
    }
    hex::decode(s).ok()
}

/// Whether `record` carries a valid signature under `public_key_pem`.
///
/// Never fails: an unparsable key or signature is simply `false`.
pub fn verify_one(record: &UserRecord, public_key_pem: &str) -> bool {
    match SignatureVerifier::from_pem(public_key_pem) {
        Ok(verifier) => verifier.verify_record(record),
        Err(_) => {
            tracing::debug!(id = record.id, "public key unusable, record rejected");
            false
        }
    }
}

/// Returns the records whose signatures verify, in input order.
///
/// Each record is checked on the blocking pool, all at once, and the results
/// are joined before anything is returned. The input is only read.
///
/// # Errors
///
/// [`VerifyError::InvalidPublicKey`] if the key cannot be parsed, before any
/// record is looked at. [`VerifyError::TaskFailed`] if a check panicked or
/// was cancelled; no partial result is returned in that case.
pub async fn verify_and_filter(
    records: &[UserRecord],
    public_key_pem: &str,
) -> Result<Vec<UserRecord>, VerifyError> {
    let verifier = Arc::new(SignatureVerifier::from_pem(public_key_pem)?);

    let checks = records.iter().cloned().map(|record| {
        let verifier = Arc::clone(&verifier);
        tokio::task::spawn_blocking(move || {
            let trusted = verifier.verify_record(&record);
            (trusted, record)
        })
    });

    let mut trusted = Vec::with_capacity(records.len());
    for outcome in join_all(checks).await {
        let (ok, record) = outcome.map_err(|e| VerifyError::TaskFailed(e.to_string()))?;
        if ok {
            trusted.push(record);
        }
    }

    tracing::debug!(
        total = records.len(),
        trusted = trusted.len(),
        rejected = records.len() - trusted.len(),
        "batch verified"
    );
    Ok(trusted)
}
