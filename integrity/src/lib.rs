// Copyright (c) 2026 Roster Contributors. MIT License.
// See LICENSE for details.

//! # Roster Integrity — Core Library
//!
//! A user roster that carries its own proof of authenticity. Every user
//! record's email is signed by a server-held P-384 key when the record is
//! created or its email changes. The whole roster can be exported as a
//! compact protobuf message, and anyone holding only the public key can
//! re-check each record before trusting it.
//!
//! ## Architecture
//!
//! - **crypto** — key lifecycle ([`crypto::KeyStore`]), DER/raw signature
//!   conversion ([`crypto::der`]), record signing and verification.
//! - **export** — the wire-stable `UserList` protobuf codec.
//! - **user** — the `UserRecord` domain types and the sled-backed store.
//! - **pipeline** — the consumer-side refresh: fetch key, fetch export,
//!   decode, verify, filter.
//! - **config** — algorithm names, sizes, file names and defaults.
//!
//! ## Trust model
//!
//! Only per-record signatures are checked. The export envelope itself is
//! not signed, so an intermediary can drop valid records without detection;
//! it cannot forge or alter a record that survives.

pub mod config;
pub mod crypto;
pub mod export;
pub mod pipeline;
pub mod user;
