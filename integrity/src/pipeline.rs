//! # Integrity Pipeline
//!
//! The consumer-side refresh:
//!
//! ```text
//! public key ─┐
//!             ├─> decode export ─> verify_and_filter ─> trusted set
//! export ─────┘
//! ```
//!
//! Both fetches run concurrently; verification starts only once both have
//! arrived. A refresh either commits a complete trusted set or commits
//! nothing. When it fails, the previously committed set stays in place.
//!
//! ## Supersession
//!
//! Every refresh takes a ticket when it starts. A finished refresh commits
//! only if no refresh with a later ticket has committed already, so a slow
//! run can never overwrite a newer one. Dropping a refresh future before it
//! finishes commits nothing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use crate::crypto::{verify_and_filter, KeyStore, PublicKeyInfo, VerifyError};
use crate::export::{self, ExportError};
use crate::user::{UserRecord, UserStore};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A collaborator could not deliver the key or the export.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    UpstreamUnavailable(#[from] SourceError),

    /// The advertised key uses a scheme records are not signed with.
    #[error("unsupported key scheme {algorithm}/{curve}/{hash}")]
    UnsupportedKey {
        algorithm: String,
        curve: String,
        hash: String,
    },

    #[error(transparent)]
    Decoding(#[from] ExportError),

    #[error(transparent)]
    Verification(#[from] VerifyError),
}

// ---------------------------------------------------------------------------
// ExportSource
// ---------------------------------------------------------------------------

/// Where the pipeline gets its two inputs.
#[async_trait]
pub trait ExportSource: Send + Sync {
    /// The key records are expected to be signed with.
    async fn public_key(&self) -> Result<PublicKeyInfo, SourceError>;

    /// The encoded `UserList`.
    async fn export(&self) -> Result<Vec<u8>, SourceError>;
}

#[async_trait]
impl<S: ExportSource + ?Sized> ExportSource for Arc<S> {
    async fn public_key(&self) -> Result<PublicKeyInfo, SourceError> {
        (**self).public_key().await
    }

    async fn export(&self) -> Result<Vec<u8>, SourceError> {
        (**self).export().await
    }
}

/// In-process source reading straight from a key store and user store.
#[derive(Debug, Clone)]
pub struct LocalSource {
    keys: Arc<KeyStore>,
    users: Arc<UserStore>,
}

impl LocalSource {
    pub fn new(keys: Arc<KeyStore>, users: Arc<UserStore>) -> Self {
        Self { keys, users }
    }
}

#[async_trait]
impl ExportSource for LocalSource {
    async fn public_key(&self) -> Result<PublicKeyInfo, SourceError> {
        self.keys
            .public_key_info()
            .map_err(|e| SourceError::Unavailable(e.to_string()))
    }

    async fn export(&self) -> Result<Vec<u8>, SourceError> {
        let records = self
            .users
            .list()
            .map_err(|e| SourceError::Unavailable(e.to_string()))?;
        export::encode(&records).map_err(|e| SourceError::Unavailable(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// IntegrityPipeline
// ---------------------------------------------------------------------------

/// Result of one completed refresh.
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    /// Records that verified, in export order.
    pub trusted: Arc<Vec<UserRecord>>,
    /// Records in the export before filtering.
    pub received: usize,
    /// Whether this run became the current set. `false` means a newer
    /// refresh had already committed.
    pub committed: bool,
}

impl RefreshOutcome {
    pub fn rejected(&self) -> usize {
        self.received - self.trusted.len()
    }
}

struct Snapshot {
    ticket: u64,
    records: Arc<Vec<UserRecord>>,
}

/// Holds the current trusted set and refreshes it from an [`ExportSource`].
pub struct IntegrityPipeline<S> {
    source: S,
    current: RwLock<Snapshot>,
    next_ticket: AtomicU64,
}

impl<S: ExportSource> IntegrityPipeline<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            current: RwLock::new(Snapshot {
                ticket: 0,
                records: Arc::new(Vec::new()),
            }),
            next_ticket: AtomicU64::new(0),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// The last committed trusted set. Empty until a refresh succeeds.
    pub fn current(&self) -> Arc<Vec<UserRecord>> {
        Arc::clone(&self.current.read().records)
    }

    /// Whether any refresh has committed yet.
    pub fn is_loaded(&self) -> bool {
        self.current.read().ticket > 0
    }

    /// Fetches, decodes and verifies the roster, then commits the trusted
    /// subset unless a newer refresh already has.
    pub async fn refresh(&self) -> Result<RefreshOutcome, PipelineError> {
        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(ticket, "refresh started");

        let trusted_and_count = fetch_and_verify(&self.source).await;
        let (trusted, received) = match trusted_and_count {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(ticket, error = %e, "refresh failed, keeping previous set");
                return Err(e);
            }
        };
        let trusted = Arc::new(trusted);

        let committed = {
            let mut current = self.current.write();
            if ticket > current.ticket {
                *current = Snapshot {
                    ticket,
                    records: Arc::clone(&trusted),
                };
                true
            } else {
                false
            }
        };

        if committed {
            tracing::info!(
                ticket,
                received,
                trusted = trusted.len(),
                "refresh committed"
            );
        } else {
            tracing::debug!(ticket, "refresh superseded, discarded");
        }

        Ok(RefreshOutcome {
            trusted,
            received,
            committed,
        })
    }
}

/// One stateless pass: the trusted records and how many were received.
pub async fn fetch_and_verify<S: ExportSource + ?Sized>(
    source: &S,
) -> Result<(Vec<UserRecord>, usize), PipelineError> {
    let (key, bytes) = tokio::try_join!(source.public_key(), source.export())?;

    if !key.is_supported() {
        return Err(PipelineError::UnsupportedKey {
            algorithm: key.algorithm,
            curve: key.curve,
            hash: key.hash,
        });
    }

    let records = export::decode(&bytes)?;
    let received = records.len();
    let trusted = verify_and_filter(&records, &key.public_key).await?;
    Ok((trusted, received))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::RecordSigner;
    use crate::user::{NewUser, Role, Status};
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    type Payload = Result<Vec<u8>, String>;

    /// Serves scripted exports in order; the last one repeats. The first
    /// export call can be held until `gate` is notified.
    struct ScriptedSource {
        key: Result<PublicKeyInfo, String>,
        exports: Vec<Payload>,
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl ScriptedSource {
        fn new(key: PublicKeyInfo, exports: Vec<Payload>) -> Self {
            Self {
                key: Ok(key),
                exports,
                calls: AtomicUsize::new(0),
                gate: None,
            }
        }
    }

    #[async_trait]
    impl ExportSource for ScriptedSource {
        async fn public_key(&self) -> Result<PublicKeyInfo, SourceError> {
            self.key.clone().map_err(SourceError::Unavailable)
        }

        async fn export(&self) -> Result<Vec<u8>, SourceError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                if let Some(gate) = &self.gate {
                    gate.notified().await;
                }
            }
            let idx = n.min(self.exports.len() - 1);
            self.exports[idx].clone().map_err(SourceError::Unavailable)
        }
    }

    struct Fixture {
        _tmp: TempDir,
        keys: Arc<KeyStore>,
        signer: RecordSigner,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let keys = Arc::new(KeyStore::open(tmp.path().join("keys")).unwrap());
        let signer = RecordSigner::new(Arc::clone(&keys));
        Fixture {
            _tmp: tmp,
            keys,
            signer,
        }
    }

    impl Fixture {
        fn record(&self, id: u64, email: &str) -> UserRecord {
            UserRecord {
                id,
                email: email.to_string(),
                role: Role::User,
                status: Status::Active,
                created_at: "2026-02-03T04:05:06.789Z".to_string(),
                signature: self.signer.sign(email).unwrap(),
            }
        }

        fn payload(&self, records: &[UserRecord]) -> Payload {
            Ok(export::encode(records).unwrap())
        }

        fn key(&self) -> PublicKeyInfo {
            self.keys.public_key_info().unwrap()
        }
    }

    fn ids(records: &[UserRecord]) -> Vec<u64> {
        records.iter().map(|r| r.id).collect()
    }

    #[tokio::test]
    async fn refresh_commits_only_verified_records() {
        let fx = fixture();
        let mut tampered = fx.record(2, "bob@example.com");
        tampered.email = "mallory@example.com".to_string();
        let roster = vec![
            fx.record(1, "alice@example.com"),
            tampered,
            fx.record(3, "carol@example.com"),
        ];

        let source = ScriptedSource::new(fx.key(), vec![fx.payload(&roster)]);
        let pipeline = IntegrityPipeline::new(source);
        let outcome = pipeline.refresh().await.unwrap();

        assert!(outcome.committed);
        assert_eq!(outcome.received, 3);
        assert_eq!(outcome.rejected(), 1);
        assert_eq!(ids(&pipeline.current()), vec![1, 3]);
        assert!(pipeline.is_loaded());
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_set() {
        let fx = fixture();
        let roster = vec![fx.record(1, "alice@example.com")];
        let source = ScriptedSource::new(
            fx.key(),
            vec![fx.payload(&roster), Err("connection refused".to_string())],
        );
        let pipeline = IntegrityPipeline::new(source);

        pipeline.refresh().await.unwrap();
        let err = pipeline.refresh().await.unwrap_err();

        assert!(matches!(err, PipelineError::UpstreamUnavailable(_)));
        assert_eq!(ids(&pipeline.current()), vec![1]);
    }

    #[tokio::test]
    async fn missing_key_is_upstream_failure_not_empty_roster() {
        let fx = fixture();
        let mut source = ScriptedSource::new(fx.key(), vec![fx.payload(&[])]);
        source.key = Err("404".to_string());
        let pipeline = IntegrityPipeline::new(source);

        assert!(matches!(
            pipeline.refresh().await,
            Err(PipelineError::UpstreamUnavailable(_))
        ));
        assert!(!pipeline.is_loaded());
    }

    #[tokio::test]
    async fn corrupt_export_fails_decoding() {
        let fx = fixture();
        let source = ScriptedSource::new(fx.key(), vec![Ok(vec![0xff, 0xff])]);
        let pipeline = IntegrityPipeline::new(source);
        assert!(matches!(
            pipeline.refresh().await,
            Err(PipelineError::Decoding(_))
        ));
    }

    #[tokio::test]
    async fn unusable_key_fails_verification() {
        let fx = fixture();
        let key = PublicKeyInfo::new("garbage".to_string());
        let roster = vec![fx.record(1, "alice@example.com")];
        let source = ScriptedSource::new(key, vec![fx.payload(&roster)]);
        let pipeline = IntegrityPipeline::new(source);
        assert!(matches!(
            pipeline.refresh().await,
            Err(PipelineError::Verification(VerifyError::InvalidPublicKey))
        ));
    }

    #[tokio::test]
    async fn foreign_scheme_is_refused() {
        let fx = fixture();
        let mut key = fx.key();
        key.curve = "prime256v1".to_string();
        let pipeline = IntegrityPipeline::new(ScriptedSource::new(key, vec![fx.payload(&[])]));
        assert!(matches!(
            pipeline.refresh().await,
            Err(PipelineError::UnsupportedKey { .. })
        ));
    }

    #[tokio::test]
    async fn slow_refresh_never_overwrites_newer_one() {
        let fx = fixture();
        let old = vec![fx.record(1, "old@example.com")];
        let new = vec![fx.record(2, "new@example.com")];
        let gate = Arc::new(Notify::new());
        let mut source =
            ScriptedSource::new(fx.key(), vec![fx.payload(&old), fx.payload(&new)]);
        source.gate = Some(Arc::clone(&gate));
        let pipeline = IntegrityPipeline::new(source);

        let slow = pipeline.refresh();
        tokio::pin!(slow);
        assert!(futures::poll!(&mut slow).is_pending());

        let fast = pipeline.refresh().await.unwrap();
        assert!(fast.committed);

        gate.notify_one();
        let late = slow.await.unwrap();
        assert!(!late.committed);
        assert_eq!(ids(&late.trusted), vec![1]);
        assert_eq!(ids(&pipeline.current()), vec![2]);
    }

    #[tokio::test]
    async fn abandoned_refresh_commits_nothing() {
        let fx = fixture();
        let roster = vec![fx.record(1, "alice@example.com")];
        let gate = Arc::new(Notify::new());
        let mut source = ScriptedSource::new(fx.key(), vec![fx.payload(&roster)]);
        source.gate = Some(gate);
        let pipeline = IntegrityPipeline::new(source);

        {
            let abandoned = pipeline.refresh();
            tokio::pin!(abandoned);
            assert!(futures::poll!(&mut abandoned).is_pending());
        }
        assert!(!pipeline.is_loaded());

        pipeline.refresh().await.unwrap();
        assert_eq!(ids(&pipeline.current()), vec![1]);
    }

    #[tokio::test]
    async fn local_source_round_trip() {
        let fx = fixture();
        let users = Arc::new(UserStore::open_temporary(fx.signer.clone()).unwrap());
        for email in ["a@example.com", "b@example.com"] {
            users
                .create(NewUser {
                    email: email.to_string(),
                    role: Role::Guest,
                    status: Status::Active,
                })
                .unwrap();
        }

        let pipeline = IntegrityPipeline::new(LocalSource::new(Arc::clone(&fx.keys), users));
        let outcome = pipeline.refresh().await.unwrap();
        assert_eq!(outcome.received, 2);
        assert_eq!(outcome.trusted.len(), 2);
    }
}
