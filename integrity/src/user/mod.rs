//! # Users
//!
//! ```text
//! types.rs  — UserRecord, Role, Status, create/update payloads, validation
//! store.rs  — sled-backed persistence that signs on every email write
//! ```

pub mod store;
pub mod types;

pub use store::{DailyCount, StoreError, StoreResult, UserStore};
pub use types::{is_valid_email, NewUser, Role, Status, UnknownVariant, UserRecord, UserUpdate};
