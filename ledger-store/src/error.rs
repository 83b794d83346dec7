//! Error types for the ledger

use crate::types::AccountId;
use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Currency id is not configured
    #[error("Unknown currency: {0}")]
    UnknownCurrency(String),

    /// Identity has no stored record and could not be resolved to a live entity
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Withdraw precondition failed
    #[error(
        "Insufficient balance for {account} in {currency}: requested {requested}, available {available}"
    )]
    InsufficientBalance {
        /// Account that was debited
        account: AccountId,
        /// Currency id
        currency: String,
        /// Requested amount
        requested: Decimal,
        /// Balance at the time of the request
        available: Decimal,
    },

    /// Amount rejected before touching any state
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// Currency cannot be moved between accounts
    #[error("Currency {0} is not transferable")]
    NotTransferable(String),

    /// Connection to the backing store is lost or not established
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Stored record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation not provided by the selected backend
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Storage error reported by a driver
    #[error("Storage error: {0}")]
    Storage(String),

    /// Concurrency error (store worker gone, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the next reconciliation tick may succeed where this call failed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::BackendUnavailable(_) | Error::Storage(_) | Error::Io(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Error::BackendUnavailable(err.to_string())
            }
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Error::Serialization(err.to_string())
            }
            other => Error::Storage(other.to_string()),
        }
    }
}

impl From<rust_decimal::Error> for Error {
    fn from(err: rust_decimal::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
