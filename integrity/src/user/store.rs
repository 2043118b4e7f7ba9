//! # UserStore — Persistent User Records
//!
//! The roster's storage, built on sled. Every write that sets or changes an
//! email also signs it, so a record on disk always carries a signature over
//! its current email.
//!
//! ## Tree Layout
//!
//! | Tree     | Key               | Value                |
//! |----------|-------------------|----------------------|
//! | `users`  | `id` (8B BE)      | `bincode(UserRecord)`|
//! | `emails` | `email` (UTF-8)   | `id` (8B BE)         |
//! | `meta`   | key (UTF-8)       | value (bytes)        |
//!
//! Ids are handed out from a counter in `meta` and never reused, even after
//! a delete. Writes go through one mutex so the email index cannot be raced.

use std::path::Path;

use chrono::{Days, NaiveDate};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use sled::{Db, Tree};

use super::types::{is_valid_email, now_timestamp, NewUser, UserRecord, UserUpdate};
use crate::crypto::{KeyError, RecordSigner};

// ---------------------------------------------------------------------------
// Error Type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("user not found: {0}")]
    NotFound(u64),

    #[error("email already exists")]
    DuplicateEmail,

    #[error("invalid email format")]
    InvalidEmail,

    #[error("signing failed: {0}")]
    Signing(#[from] KeyError),
}

pub type StoreResult<T> = Result<T, StoreError>;

const META_NEXT_ID: &[u8] = b"next_user_id";

/// Users created on one calendar day (UTC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyCount {
    /// `YYYY-MM-DD`.
    pub date: String,
    pub count: u64,
}

// ---------------------------------------------------------------------------
// UserStore
// ---------------------------------------------------------------------------

/// Persistent, signing user store.
///
/// Reads are lock-free. Writes are serialized.
pub struct UserStore {
    db: Db,
    users: Tree,
    emails: Tree,
    meta: Tree,
    signer: RecordSigner,
    write_lock: Mutex<()>,
}

impl UserStore {
    /// Open or create a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P, signer: RecordSigner) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db, signer)
    }

    /// A store that lives only as long as this value. For tests.
    pub fn open_temporary(signer: RecordSigner) -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db, signer)
    }

    fn from_db(db: Db, signer: RecordSigner) -> StoreResult<Self> {
        let users = db.open_tree("users")?;
        let emails = db.open_tree("emails")?;
        let meta = db.open_tree("meta")?;
        Ok(Self {
            db,
            users,
            emails,
            meta,
            signer,
            write_lock: Mutex::new(()),
        })
    }

    // -- Reads --------------------------------------------------------------

    pub fn get(&self, id: u64) -> StoreResult<Option<UserRecord>> {
        match self.users.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn get_by_email(&self, email: &str) -> StoreResult<Option<UserRecord>> {
        match self.emails.get(email.as_bytes())? {
            Some(id_bytes) => self.get(decode_id(&id_bytes)?),
            None => Ok(None),
        }
    }

    /// Every user, newest first. Ties on `created_at` go to the higher id.
    pub fn list(&self) -> StoreResult<Vec<UserRecord>> {
        let mut records = Vec::with_capacity(self.users.len());
        for entry in self.users.iter() {
            let (_key, value) = entry?;
            records.push(decode_record(&value)?);
        }
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(records)
    }

    pub fn count(&self) -> usize {
        self.users.len()
    }

    /// Signups per UTC day for the `days` days ending on `today`, oldest
    /// first. Days with no signups are present with a zero count.
    pub fn daily_counts(&self, days: u32, today: NaiveDate) -> StoreResult<Vec<DailyCount>> {
        if days == 0 {
            return Ok(Vec::new());
        }
        let start = today
            .checked_sub_days(Days::new(u64::from(days - 1)))
            .unwrap_or(NaiveDate::MIN);

        let mut counts: Vec<u64> = vec![0; days as usize];
        for entry in self.users.iter() {
            let (_key, value) = entry?;
            let record = decode_record(&value)?;
            let Some(created) = record.created_at_time() else {
                tracing::warn!(id = record.id, "stored record has unparsable createdAt");
                continue;
            };
            let day = created.date_naive();
            if day < start || day > today {
                continue;
            }
            let offset = (day - start).num_days() as usize;
            counts[offset] += 1;
        }

        Ok(counts
            .into_iter()
            .enumerate()
            .filter_map(|(offset, count)| {
                let date = start.checked_add_days(Days::new(offset as u64))?;
                Some(DailyCount {
                    date: date.format("%Y-%m-%d").to_string(),
                    count,
                })
            })
            .collect())
    }

    // -- Writes -------------------------------------------------------------

    /// Validates, signs and stores a new user.
    pub fn create(&self, new_user: NewUser) -> StoreResult<UserRecord> {
        let _guard = self.write_lock.lock();

        if !is_valid_email(&new_user.email) {
            return Err(StoreError::InvalidEmail);
        }
        if self.emails.contains_key(new_user.email.as_bytes())? {
            return Err(StoreError::DuplicateEmail);
        }

        let signature = self.signer.sign(&new_user.email)?;
        let id = self.next_id()?;
        let record = UserRecord {
            id,
            email: new_user.email,
            role: new_user.role,
            status: new_user.status,
            created_at: now_timestamp(),
            signature,
        };

        self.put(&record, None)?;
        tracing::info!(id, role = %record.role, "user created");
        Ok(record)
    }

    /// Applies a partial update.
    ///
    /// A new email is validated, checked for uniqueness and re-signed. Role
    /// and status changes leave the signature alone. An empty update
    /// returns the record unchanged.
    pub fn update(&self, id: u64, update: UserUpdate) -> StoreResult<UserRecord> {
        let _guard = self.write_lock.lock();

        let existing = self.get(id)?.ok_or(StoreError::NotFound(id))?;
        if update.is_empty() {
            return Ok(existing);
        }

        let mut record = existing.clone();
        let mut old_email = None;
        let resigned = update.email.is_some();

        if let Some(email) = update.email {
            if !is_valid_email(&email) {
                return Err(StoreError::InvalidEmail);
            }
            if let Some(holder) = self.emails.get(email.as_bytes())? {
                if decode_id(&holder)? != id {
                    return Err(StoreError::DuplicateEmail);
                }
            }
            record.signature = self.signer.sign(&email)?;
            if email != existing.email {
                old_email = Some(existing.email.clone());
            }
            record.email = email;
        }
        if let Some(role) = update.role {
            record.role = role;
        }
        if let Some(status) = update.status {
            record.status = status;
        }

        self.put(&record, old_email.as_deref())?;
        tracing::info!(id, resigned, "user updated");
        Ok(record)
    }

    pub fn delete(&self, id: u64) -> StoreResult<()> {
        let _guard = self.write_lock.lock();

        let existing = self.get(id)?.ok_or(StoreError::NotFound(id))?;
        let key = id.to_be_bytes();
        (&self.users, &self.emails)
            .transaction(|(users, emails)| {
                users.remove(&key)?;
                emails.remove(existing.email.as_bytes())?;
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(tx_error)?;
        self.db.flush()?;

        tracing::info!(id, "user deleted");
        Ok(())
    }

    /// Writes a record and its email index entry in one transaction,
    /// dropping `old_email` from the index if the email changed.
    fn put(&self, record: &UserRecord, old_email: Option<&str>) -> StoreResult<()> {
        let key = record.id.to_be_bytes();
        let bytes =
            bincode::serialize(record).map_err(|e| StoreError::Serialization(e.to_string()))?;

        (&self.users, &self.emails)
            .transaction(|(users, emails)| {
                users.insert(&key, bytes.as_slice())?;
                if let Some(old) = old_email {
                    emails.remove(old.as_bytes())?;
                }
                emails.insert(record.email.as_bytes(), &key)?;
                Ok::<(), ConflictableTransactionError<()>>(())
            })
            .map_err(tx_error)?;
        self.db.flush()?;
        Ok(())
    }

    /// Next unused id. Starts at 1. Caller holds the write lock.
    fn next_id(&self) -> StoreResult<u64> {
        let current = match self.meta.get(META_NEXT_ID)? {
            Some(bytes) => decode_id(&bytes)?,
            None => 1,
        };
        self.meta.insert(META_NEXT_ID, &(current + 1).to_be_bytes())?;
        Ok(current)
    }
}

impl std::fmt::Debug for UserStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserStore")
            .field("users", &self.users.len())
            .finish()
    }
}

fn decode_record(bytes: &[u8]) -> StoreResult<UserRecord> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_id(bytes: &[u8]) -> StoreResult<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Serialization("invalid id bytes".to_string()))?;
    Ok(u64::from_be_bytes(raw))
}

fn tx_error(e: TransactionError<()>) -> StoreError {
    match e {
        TransactionError::Storage(e) => StoreError::Sled(e),
        TransactionError::Abort(()) => StoreError::Serialization("transaction aborted".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KeyStore, SignatureVerifier};
    use crate::user::types::format_timestamp;
    use crate::user::{Role, Status};
    use chrono::{TimeZone, Utc};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        store: UserStore,
        verifier: SignatureVerifier,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let keys = Arc::new(KeyStore::open(tmp.path().join("keys")).unwrap());
        let verifier = SignatureVerifier::from_pem(keys.public_key().unwrap()).unwrap();
        let store = UserStore::open_temporary(RecordSigner::new(keys)).unwrap();
        Fixture {
            _tmp: tmp,
            store,
            verifier,
        }
    }

    fn new_user(email: &str) -> NewUser {
        NewUser {
            email: email.to_string(),
            role: Role::User,
            status: Status::Active,
        }
    }

    #[test]
    fn create_signs_and_assigns_ids() {
        let fx = fixture();
        let a = fx.store.create(new_user("a@example.com")).unwrap();
        let b = fx.store.create(new_user("b@example.com")).unwrap();

        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert!(fx.verifier.verify_record(&a));
        assert!(fx.verifier.verify_record(&b));
        assert!(a.created_at.ends_with('Z'));
        assert_eq!(fx.store.get(1).unwrap(), Some(a.clone()));
        assert_eq!(fx.store.get_by_email("a@example.com").unwrap(), Some(a));
    }

    #[test]
    fn create_rejects_bad_and_duplicate_emails() {
        let fx = fixture();
        assert!(matches!(
            fx.store.create(new_user("not-an-email")),
            Err(StoreError::InvalidEmail)
        ));
        fx.store.create(new_user("a@example.com")).unwrap();
        assert!(matches!(
            fx.store.create(new_user("a@example.com")),
            Err(StoreError::DuplicateEmail)
        ));
        assert_eq!(fx.store.count(), 1);
    }

    #[test]
    fn email_update_resigns() {
        let fx = fixture();
        let created = fx.store.create(new_user("old@example.com")).unwrap();
        let updated = fx
            .store
            .update(
                created.id,
                UserUpdate {
                    email: Some("new@example.com".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(updated.email, "new@example.com");
        assert_ne!(updated.signature, created.signature);
        assert!(fx.verifier.verify_record(&updated));
        assert!(fx.store.get_by_email("old@example.com").unwrap().is_none());
        assert_eq!(
            fx.store.get_by_email("new@example.com").unwrap().map(|r| r.id),
            Some(created.id)
        );
    }

    #[test]
    fn role_and_status_updates_keep_the_signature() {
        let fx = fixture();
        let created = fx.store.create(new_user("a@example.com")).unwrap();
        let updated = fx
            .store
            .update(
                created.id,
                UserUpdate {
                    role: Some(Role::Admin),
                    status: Some(Status::Inactive),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(updated.role, Role::Admin);
        assert_eq!(updated.status, Status::Inactive);
        assert_eq!(updated.signature, created.signature);
    }

    #[test]
    fn empty_update_is_a_no_op() {
        let fx = fixture();
        let created = fx.store.create(new_user("a@example.com")).unwrap();
        let same = fx.store.update(created.id, UserUpdate::default()).unwrap();
        assert_eq!(same, created);
    }

    #[test]
    fn update_checks_existence_and_uniqueness() {
        let fx = fixture();
        let a = fx.store.create(new_user("a@example.com")).unwrap();
        fx.store.create(new_user("b@example.com")).unwrap();

        assert!(matches!(
            fx.store.update(99, UserUpdate::default()),
            Err(StoreError::NotFound(99))
        ));
        let taken = UserUpdate {
            email: Some("b@example.com".into()),
            ..Default::default()
        };
        assert!(matches!(
            fx.store.update(a.id, taken),
            Err(StoreError::DuplicateEmail)
        ));
        let bad = UserUpdate {
            email: Some("".into()),
            ..Default::default()
        };
        assert!(matches!(
            fx.store.update(a.id, bad),
            Err(StoreError::InvalidEmail)
        ));

        // Re-submitting your own email is allowed.
        let own = UserUpdate {
            email: Some("a@example.com".into()),
            ..Default::default()
        };
        assert!(fx.store.update(a.id, own).is_ok());
    }

    #[test]
    fn delete_frees_the_email_but_not_the_id() {
        let fx = fixture();
        let a = fx.store.create(new_user("a@example.com")).unwrap();
        fx.store.delete(a.id).unwrap();

        assert!(fx.store.get(a.id).unwrap().is_none());
        assert!(matches!(
            fx.store.delete(a.id),
            Err(StoreError::NotFound(_))
        ));

        let again = fx.store.create(new_user("a@example.com")).unwrap();
        assert_eq!(again.id, 2);
    }

    #[test]
    fn list_is_newest_first() {
        let fx = fixture();
        for email in ["a@example.com", "b@example.com", "c@example.com"] {
            fx.store.create(new_user(email)).unwrap();
        }
        let ids: Vec<u64> = fx.store.list().unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn daily_counts_fill_the_window() {
        let fx = fixture();
        fx.store.create(new_user("a@example.com")).unwrap();
        fx.store.create(new_user("b@example.com")).unwrap();
        let today = Utc::now().date_naive();

        // Backdate one record by rewriting it directly.
        let mut old = fx.store.get(1).unwrap().unwrap();
        let three_days_ago = today.checked_sub_days(Days::new(3)).unwrap();
        old.created_at = format_timestamp(
            Utc.from_utc_datetime(&three_days_ago.and_hms_opt(12, 0, 0).unwrap()),
        );
        fx.store.put(&old, None).unwrap();

        let counts = fx.store.daily_counts(7, today).unwrap();
        assert_eq!(counts.len(), 7);
        assert_eq!(counts[6].date, today.format("%Y-%m-%d").to_string());
        assert_eq!(counts[6].count, 1);
        assert_eq!(counts[3].count, 1);
        assert_eq!(counts.iter().map(|c| c.count).sum::<u64>(), 2);
    }

    #[test]
    fn daily_counts_of_zero_days_is_empty() {
        let fx = fixture();
        let today = Utc::now().date_naive();
        assert!(fx.store.daily_counts(0, today).unwrap().is_empty());
    }

    #[test]
    fn concurrent_creates_keep_emails_unique() {
        let fx = fixture();
        let store = &fx.store;
        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| scope.spawn(move || store.create(new_user("race@example.com"))))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn reopening_preserves_records() {
        let tmp = TempDir::new().unwrap();
        let keys = Arc::new(KeyStore::open(tmp.path().join("keys")).unwrap());
        let path = tmp.path().join("db");
        {
            let store = UserStore::open(&path, RecordSigner::new(Arc::clone(&keys))).unwrap();
            store.create(new_user("a@example.com")).unwrap();
        }
        // sled's flusher thread can hold the directory lock briefly after drop.
        let store = (0..50)
            .find_map(|_| {
                match UserStore::open(&path, RecordSigner::new(Arc::clone(&keys))) {
                    Ok(store) => Some(store),
                    Err(_) => {
                        std::thread::sleep(std::time::Duration::from_millis(20));
                        None
                    }
                }
            })
            .expect("database lock released after drop");
        assert_eq!(store.count(), 1);
        let next = store.create(new_user("b@example.com")).unwrap();
        assert_eq!(next.id, 2);
    }
}
