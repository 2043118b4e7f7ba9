//! Record signing.
//!
//! A record's signature covers its email and nothing else, hex-encoded DER.

use std::sync::Arc;

use super::keys::{KeyError, KeyStore};
use super::signable_payload;

/// Produces the `signature` field of a user record.
#[derive(Debug, Clone)]
pub struct RecordSigner {
    keys: Arc<KeyStore>,
}

impl RecordSigner {
    pub fn new(keys: Arc<KeyStore>) -> Self {
        Self { keys }
    }

    /// Signs `email` exactly as given and returns lowercase hex DER.
    ///
    /// No trimming or case folding happens here. Callers validate the email
    /// before signing.
    pub fn sign(&self, email: &str) -> Result<String, KeyError> {
        let der = self.keys.sign(signable_payload(email))?;
        tracing::debug!(sig_len = der.len(), "record signed");
        Ok(hex::encode(der))
    }

    /// The key store this signer draws from.
    pub fn key_store(&self) -> &Arc<KeyStore> {
        &self.keys
    }
}
