//! aerodb-conflict - Conflict detection and resolution for multi-master replication
//!
//! Remote changes are applied per origin epoch in one engine transaction.
//! Conflicts are detected by interpreted check programs run inside the
//! engine, resolved in the same transaction (refresh, exceptions row) and
//! counted; only temporary and fatal errors reach the caller.

pub mod cli;
pub mod config;
pub mod conflict;
pub mod engine;
pub mod observability;
