//! Infrastructure layer for Cadenza.
//!
//! Contains implementations of the storage ports defined in
//! `cadenza-core`: SQLite-backed workflow storage, audit ledger, issue
//! mappings, pending approvals, and the completion-signal idempotency
//! ledger.

pub mod sqlite;
