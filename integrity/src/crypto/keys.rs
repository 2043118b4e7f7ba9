//! # Key Management
//!
//! The deployment's single long-lived P-384 keypair.
//!
//! On first boot the keypair is generated and written as two PEM files:
//! `private.pem` (PKCS#8) and `public.pem` (SPKI). Every later boot loads
//! them. After [`KeyStore::initialize`] returns, the keys are read-only and
//! can be shared across any number of signing threads without locking.
//!
//! ## Single writer
//!
//! Initialization is serialized twice over: an in-process mutex for
//! threads sharing one `KeyStore`, and an exclusive `fs2` file lock for
//! processes sharing one keys directory. The private key is created with
//! `create_new`, so even if both guards were bypassed a second generator
//! fails instead of replacing a key that signatures already depend on.
//!
//! ## What is never done
//!
//! - A private key file that exists but does not parse is never
//!   overwritten. That is reported as [`KeyError::Corrupt`].
//! - Key bytes are never logged or included in `Debug` output.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use fs2::FileExt;
use p384::ecdsa::signature::DigestSigner;
use p384::ecdsa::{Signature, SigningKey, VerifyingKey};
use p384::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use p384::{PublicKey, SecretKey};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha384};
use thiserror::Error;

use crate::config::{
    CURVE_NAME, HASH_ALGORITHM, KEYGEN_LOCK_FILE, KEYS_DIR_MODE, KEYS_DIR_NAME, PRIVATE_KEY_FILE,
    PRIVATE_KEY_MODE, PUBLIC_KEY_FILE, SIGNATURE_ALGORITHM,
};

/// Errors from the key lifecycle.
#[derive(Debug, Error)]
pub enum KeyError {
    /// The keypair has not been loaded or generated yet.
    #[error("keypair not initialized")]
    NotInitialized,

    /// No private key is loaded, or the signing primitive refused.
    #[error("signing failed")]
    SigningFailed,

    #[error("key storage I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A private key file is present but unusable. It is left untouched.
    #[error("private key at {path} exists but cannot be parsed; refusing to replace it")]
    Corrupt { path: PathBuf },

    #[error("key encoding failed")]
    Encoding,

    #[error("could not lock key directory {path}: {source}")]
    LockFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> KeyError + '_ {
    move |source| KeyError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// The public half of the keypair plus the algorithm triple it is used
/// with. This is the only key material ever handed to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyInfo {
    /// SPKI public key, PEM-wrapped.
    pub public_key: String,
    pub algorithm: String,
    pub curve: String,
    pub hash: String,
}

impl PublicKeyInfo {
    /// Wraps a PEM public key with this deployment's algorithm names.
    pub fn new(public_key: String) -> Self {
        Self {
            public_key,
            algorithm: SIGNATURE_ALGORITHM.to_string(),
            curve: CURVE_NAME.to_string(),
            hash: HASH_ALGORITHM.to_string(),
        }
    }

    /// Whether the advertised algorithm triple is the one records are
    /// signed with.
    pub fn is_supported(&self) -> bool {
        self.algorithm == SIGNATURE_ALGORITHM
            && self.curve == CURVE_NAME
            && self.hash == HASH_ALGORITHM
    }
}

struct LoadedKeys {
    signing_key: SigningKey,
    public_pem: String,
}

/// Owner of the deployment keypair.
///
/// Construct with [`KeyStore::new`], call [`initialize`](Self::initialize)
/// once at startup, then share behind an `Arc`.
pub struct KeyStore {
    dir: PathBuf,
    keys: OnceLock<LoadedKeys>,
    init: Mutex<()>,
}

impl KeyStore {
    /// A store rooted at `keys_dir`. Nothing touches the disk until
    /// [`initialize`](Self::initialize).
    pub fn new(keys_dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: keys_dir.into(),
            keys: OnceLock::new(),
            init: Mutex::new(()),
        }
    }

    /// A store using the conventional `keys/` subdirectory of a data dir.
    pub fn in_data_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(KEYS_DIR_NAME))
    }

    /// Creates and initializes a store in one step.
    pub fn open(keys_dir: impl Into<PathBuf>) -> Result<Self, KeyError> {
        let store = Self::new(keys_dir);
        store.initialize()?;
        Ok(store)
    }

    /// The directory holding the key files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_initialized(&self) -> bool {
        self.keys.get().is_some()
    }

    /// Loads the keypair, generating and persisting it first if absent.
    ///
    /// Safe to call repeatedly and from several threads: the first caller
    /// does the work, the rest wait for it and return `Ok(())`.
    pub fn initialize(&self) -> Result<(), KeyError> {
        let _guard = self.init.lock();
        if self.keys.get().is_some() {
            return Ok(());
        }

        self.ensure_dir()?;
        let lock = self.lock_dir()?;
        let loaded = match self.load()? {
            Some(keys) => keys,
            None => self.generate()?,
        };
        // Dropping the handle releases the advisory lock.
        drop(lock);

        let _ = self.keys.set(loaded);
        Ok(())
    }

    /// The SPKI public key in PEM form.
    pub fn public_key(&self) -> Result<&str, KeyError> {
        self.keys
            .get()
            .map(|k| k.public_pem.as_str())
            .ok_or(KeyError::NotInitialized)
    }

    /// The public key plus algorithm metadata, as served to consumers.
    pub fn public_key_info(&self) -> Result<PublicKeyInfo, KeyError> {
        Ok(PublicKeyInfo::new(self.public_key()?.to_string()))
    }

    /// The verifying half of the keypair.
    pub fn verifying_key(&self) -> Result<VerifyingKey, KeyError> {
        self.keys
            .get()
            .map(|k| *k.signing_key.verifying_key())
            .ok_or(KeyError::NotInitialized)
    }

    /// ECDSA-signs `SHA-384(message)` and returns the DER-encoded signature.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, KeyError> {
        let keys = self.keys.get().ok_or(KeyError::SigningFailed)?;
        let digest = Sha384::new_with_prefix(message);
        let signature: Signature = keys
            .signing_key
            .try_sign_digest(digest)
            .map_err(|_| KeyError::SigningFailed)?;
        Ok(signature.to_der().as_bytes().to_vec())
    }

    // -- Storage ------------------------------------------------------------

    fn private_path(&self) -> PathBuf {
        self.dir.join(PRIVATE_KEY_FILE)
    }

    fn public_path(&self) -> PathBuf {
        self.dir.join(PUBLIC_KEY_FILE)
    }

    fn ensure_dir(&self) -> Result<(), KeyError> {
        if self.dir.is_dir() {
            return Ok(());
        }
        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(KEYS_DIR_MODE))
                .map_err(io_err(&self.dir))?;
        }
        tracing::info!(path = %self.dir.display(), "keys directory created");
        Ok(())
    }

    fn lock_dir(&self) -> Result<File, KeyError> {
        let path = self.dir.join(KEYGEN_LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err(&path))?;
        file.lock_exclusive()
            .map_err(|source| KeyError::LockFailed { path, source })?;
        Ok(file)
    }

    /// Loads the keypair from disk. `Ok(None)` means there is no private
    /// key yet and one should be generated.
    ///
    /// The public key is always re-derived from the private key. A missing
    /// or mismatched `public.pem` is rewritten from it.
    fn load(&self) -> Result<Option<LoadedKeys>, KeyError> {
        let private_path = self.private_path();
        let private_pem = match fs::read_to_string(&private_path) {
            Ok(pem) => pem,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(&private_path)(e)),
        };

        let secret = SecretKey::from_pkcs8_pem(&private_pem).map_err(|_| KeyError::Corrupt {
            path: private_path.clone(),
        })?;
        let public_pem = encode_public(&secret)?;

        let public_path = self.public_path();
        match fs::read_to_string(&public_path) {
            Ok(on_disk) => {
                let matches = PublicKey::from_public_key_pem(&on_disk)
                    .map(|pk| pk == secret.public_key())
                    .unwrap_or(false);
                if !matches {
                    tracing::warn!(
                        path = %public_path.display(),
                        "public key file does not match private key, rewriting"
                    );
                    write_file(&public_path, public_pem.as_bytes())?;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::info!(path = %public_path.display(), "public key missing, re-deriving");
                write_file(&public_path, public_pem.as_bytes())?;
            }
            Err(e) => return Err(io_err(&public_path)(e)),
        }

        tracing::info!(dir = %self.dir.display(), "keypair loaded from files");
        Ok(Some(LoadedKeys {
            signing_key: SigningKey::from(&secret),
            public_pem,
        }))
    }

    fn generate(&self) -> Result<LoadedKeys, KeyError> {
        tracing::info!(dir = %self.dir.display(), curve = CURVE_NAME, "generating keypair");

        let secret = SecretKey::random(&mut OsRng);
        let private_pem = secret
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|_| KeyError::Encoding)?;
        let public_pem = encode_public(&secret)?;

        write_private(&self.private_path(), private_pem.as_bytes())?;
        write_file(&self.public_path(), public_pem.as_bytes())?;

        tracing::info!(dir = %self.dir.display(), "keypair generated and saved");
        Ok(LoadedKeys {
            signing_key: SigningKey::from(&secret),
            public_pem,
        })
    }
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("dir", &self.dir)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

fn encode_public(secret: &SecretKey) -> Result<String, KeyError> {
    secret
        .public_key()
        .to_public_key_pem(LineEnding::LF)
        .map_err(|_| KeyError::Encoding)
}

/// Creates the private key file. Fails if it already exists.
fn write_private(path: &Path, contents: &[u8]) -> Result<(), KeyError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(PRIVATE_KEY_MODE);
    }
    let mut file = options.open(path).map_err(io_err(path))?;
    file.write_all(contents).map_err(io_err(path))?;
    file.sync_all().map_err(io_err(path))
}

fn write_file(path: &Path, contents: &[u8]) -> Result<(), KeyError> {
    let mut file = File::create(path).map_err(io_err(path))?;
    file.write_all(contents).map_err(io_err(path))?;
    file.sync_all().map_err(io_err(path))
}
