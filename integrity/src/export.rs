//! # Export Codec
//!
//! The roster on the wire: a protobuf `UserList` as defined in
//! `proto/user.proto`.
//!
//! ```text
//! message User     { int32 id = 1; string email = 2; string role = 3;
//!                    string status = 4; string createdAt = 5;
//!                    string signature = 6; }
//! message UserList { repeated User users = 1; int32 total = 2; }
//! ```
//!
//! Encoding refuses records that would not survive the trip (ids outside
//! `int32`, unparsable timestamps, signatures that are not lowercase hex).
//! Decoding is strict about everything a consumer will trust: unknown roles
//! or statuses, non-positive ids, empty emails or signatures, and a `total`
//! that disagrees with the number of users all fail the whole payload.
//! Unknown fields are skipped, as protobuf intends.

use prost::Message;
use thiserror::Error;

use crate::crypto::is_lower_hex;
use crate::user::types::parse_timestamp;
use crate::user::{Role, Status, UserRecord};

#[derive(Debug, Error)]
pub enum ExportError {
    /// A record cannot be represented in the wire schema.
    #[error("record {index} cannot be encoded: {reason}")]
    EncodingInvalid { index: usize, reason: String },

    /// The bytes are not a well-formed `UserList`.
    #[error("export payload could not be decoded: {0}")]
    DecodingFailed(String),
}

// ---------------------------------------------------------------------------
// Wire Messages
// ---------------------------------------------------------------------------

/// `User` as it appears on the wire.
#[derive(Clone, PartialEq, Message)]
pub struct UserMessage {
    #[prost(int32, tag = "1")]
    pub id: i32,
    #[prost(string, tag = "2")]
    pub email: String,
    #[prost(string, tag = "3")]
    pub role: String,
    #[prost(string, tag = "4")]
    pub status: String,
    #[prost(string, tag = "5")]
    pub created_at: String,
    #[prost(string, tag = "6")]
    pub signature: String,
}

/// `UserList` as it appears on the wire.
#[derive(Clone, PartialEq, Message)]
pub struct UserList {
    #[prost(message, repeated, tag = "1")]
    pub users: Vec<UserMessage>,
    #[prost(int32, tag = "2")]
    pub total: i32,
}

/// A decoded export: the records plus the count the producer declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEnvelope {
    pub users: Vec<UserRecord>,
    pub total: usize,
}

// ---------------------------------------------------------------------------
// Encode
// ---------------------------------------------------------------------------

/// Serializes `records` as a `UserList` with `total = records.len()`.
pub fn encode(records: &[UserRecord]) -> Result<Vec<u8>, ExportError> {
    let total = i32::try_from(records.len()).map_err(|_| ExportError::EncodingInvalid {
        index: records.len(),
        reason: "too many records for an int32 total".to_string(),
    })?;

    let users = records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            to_message(record).map_err(|reason| ExportError::EncodingInvalid { index, reason })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let bytes = UserList { users, total }.encode_to_vec();
    tracing::debug!(records = records.len(), bytes = bytes.len(), "roster encoded");
    Ok(bytes)
}

fn to_message(record: &UserRecord) -> Result<UserMessage, String> {
    let id = i32::try_from(record.id)
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| format!("id {} is outside 1..=2147483647", record.id))?;
    if record.email.is_empty() {
        return Err("email is empty".to_string());
    }
    if parse_timestamp(&record.created_at).is_none() {
        return Err(format!("createdAt {:?} is not RFC 3339", record.created_at));
    }
    if !is_lower_hex(&record.signature) {
        return Err("signature is not lowercase hex".to_string());
    }

    Ok(UserMessage {
        id,
        email: record.email.clone(),
        role: record.role.as_str().to_string(),
        status: record.status.as_str().to_string(),
        created_at: record.created_at.clone(),
        signature: record.signature.clone(),
    })
}

// ---------------------------------------------------------------------------
// Decode
// ---------------------------------------------------------------------------

/// Parses a `UserList` and returns its records in wire order.
pub fn decode(bytes: &[u8]) -> Result<Vec<UserRecord>, ExportError> {
    decode_envelope(bytes).map(|envelope| envelope.users)
}

/// Parses a `UserList`, keeping the declared total.
pub fn decode_envelope(bytes: &[u8]) -> Result<ExportEnvelope, ExportError> {
    let list = UserList::decode(bytes).map_err(|e| ExportError::DecodingFailed(e.to_string()))?;

    let total = usize::try_from(list.total)
        .map_err(|_| ExportError::DecodingFailed(format!("negative total {}", list.total)))?;
    if total != list.users.len() {
        return Err(ExportError::DecodingFailed(format!(
            "total {} does not match {} users",
            total,
            list.users.len()
        )));
    }

    let users = list
        .users
        .into_iter()
        .enumerate()
        .map(|(index, message)| {
            from_message(message)
                .map_err(|reason| ExportError::DecodingFailed(format!("user {index}: {reason}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ExportEnvelope { users, total })
}

fn from_message(message: UserMessage) -> Result<UserRecord, String> {
    let id = u64::try_from(message.id)
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| format!("id {} is not positive", message.id))?;
    if message.email.is_empty() {
        return Err("email is missing".to_string());
    }
    if message.signature.is_empty() {
        return Err("signature is missing".to_string());
    }
    let role = message.role.parse::<Role>().map_err(|e| e.to_string())?;
    let status = message.status.parse::<Status>().map_err(|e| e.to_string())?;

    Ok(UserRecord {
        id,
        email: message.email,
        role,
        status,
        created_at: message.created_at,
        signature: message.signature,
    })
}
