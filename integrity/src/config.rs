//! # Protocol Configuration & Constants
//!
//! Every fixed parameter of the signing pipeline lives here. Changing the
//! algorithm triple (message, digest, curve) invalidates every signature
//! already issued, so treat the first section as frozen.

// ---------------------------------------------------------------------------
// Signature Parameters
// ---------------------------------------------------------------------------

/// Signature scheme advertised alongside the public key.
pub const SIGNATURE_ALGORITHM: &str = "ECDSA";

/// Named curve, in the OpenSSL spelling consumers expect.
pub const CURVE_NAME: &str = "secp384r1";

/// Digest applied to the signed message before ECDSA.
pub const HASH_ALGORITHM: &str = "SHA-384";

/// Width of one P-384 scalar in bytes. Both halves of a raw signature are
/// left-padded to this size.
pub const COORDINATE_SIZE: usize = 48;

/// Length of the fixed-width `r || s` signature form.
pub const RAW_SIGNATURE_LENGTH: usize = COORDINATE_SIZE * 2;

/// Upper bound on a DER-encoded P-384 signature: SEQUENCE header plus two
/// INTEGERs of up to 49 bytes each (48 + sign byte).
pub const MAX_DER_SIGNATURE_LENGTH: usize = 2 + 2 * (2 + COORDINATE_SIZE + 1);

// ---------------------------------------------------------------------------
// Key Storage
// ---------------------------------------------------------------------------

/// Directory (relative to the data directory) that holds the keypair.
pub const KEYS_DIR_NAME: &str = "keys";

/// PKCS#8 PEM private key file.
pub const PRIVATE_KEY_FILE: &str = "private.pem";

/// SPKI PEM public key file.
pub const PUBLIC_KEY_FILE: &str = "public.pem";

/// Advisory lock taken while loading or generating keys so that two
/// processes sharing a data directory never both write key files.
pub const KEYGEN_LOCK_FILE: &str = ".keygen.lock";

/// Permissions for the keys directory on Unix.
pub const KEYS_DIR_MODE: u32 = 0o700;

/// Permissions for the private key file on Unix.
pub const PRIVATE_KEY_MODE: u32 = 0o600;

// ---------------------------------------------------------------------------
// Server Defaults
// ---------------------------------------------------------------------------

/// Default HTTP API port.
pub const DEFAULT_API_PORT: u16 = 3000;

/// Default Prometheus metrics port.
pub const DEFAULT_METRICS_PORT: u16 = 9464;

/// Trailing window, in days, for the signup statistics endpoint.
pub const DEFAULT_STATS_DAYS: u32 = 7;

/// MIME type of the protobuf export.
pub const EXPORT_CONTENT_TYPE: &str = "application/x-protobuf";
