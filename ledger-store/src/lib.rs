//! Ledger Store
//!
//! Per-identity, per-currency balances over interchangeable storage backends.
//!
//! # Architecture
//!
//! - **Bounded Cache**: resident accounts are authoritative; evictions are written back
//! - **Single Writer**: one store actor performs every backend write in order
//! - **Reconciliation Queue**: mutations for non-resident identities are logged
//!   and applied once the account is loaded
//! - **Pluggable Storage**: flat files, SQLite (sqlx) or RocksDB documents

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]
//!
//! # Invariants
//!
//! - A resident account is the source of truth for its identity
//! - Every unresolved mutation is applied at most once
//! - A reload never observes a state older than the last write-back
//! - Ranking order is balance descending, identity ascending

pub mod actor;
pub mod cache;
pub mod config;
pub mod currency;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod metrics;
pub mod migration;
pub mod storage;
pub mod types;

// Re-exports
pub use actor::ReconcileReport;
pub use config::{BackendKind, Config, StorageConfig};
pub use currency::{Currency, CurrencyRegistry};
pub use error::{Error, Result};
pub use identity::{IdentityResolver, SessionDirectory};
pub use ledger::Ledger;
pub use migration::{BalanceSource, CurrencyMapping, MigrationConfig, MigrationReport};
pub use types::{
    Account, AccountId, MutationOutcome, NewTransaction, PendingTransaction, TransactionKind,
};
