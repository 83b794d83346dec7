//! Storage backends
//!
//! Every backend persists whole [`Account`] records and answers ranking
//! queries. Backends that keep a mutation log (relational, document) also
//! accept mutations for identities that are not resident; those are later
//! applied by the reconciliation scan in the store actor.
//!
//! # Backends
//!
//! - [`FileBackend`] - one JSON document per identity, no ranking, no log
//! - [`RelationalBackend`] - SQLite tables via sqlx
//! - [`DocumentBackend`] - RocksDB column families with secondary indexes

mod document;
mod file;
mod relational;

pub use document::DocumentBackend;
pub use file::FileBackend;
pub use relational::RelationalBackend;

use crate::config::{BackendKind, StorageConfig};
use crate::error::{Error, Result};
use crate::types::{Account, AccountId, NewTransaction, PendingTransaction};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;

/// Persistence driver for accounts and (optionally) the mutation log
#[async_trait]
pub trait Backend: Send + Sync {
    /// Technology behind this driver
    fn kind(&self) -> BackendKind;

    /// Release connections; later calls fail with `BackendUnavailable`
    async fn disconnect(&self) -> Result<()>;

    /// Whether the driver can currently serve requests
    async fn is_connected(&self) -> bool;

    /// Stored record for `id`, `None` if never written
    async fn read_account(&self, id: &AccountId) -> Result<Option<Account>>;

    /// Insert or fully replace the stored record (idempotent)
    async fn upsert_account(&self, account: &Account) -> Result<()>;

    /// One page of accounts ordered by `currency` balance descending, ties by
    /// identity ascending. `page` is 1-based. Each returned account carries
    /// only the ranked currency.
    async fn query_top(&self, currency: &str, page: usize, page_size: usize)
        -> Result<Vec<Account>>;

    /// Whether mutations for non-resident identities can be queued here
    fn supports_mutation_log(&self) -> bool {
        false
    }

    /// Append a mutation record and return its sequence number
    async fn append_mutation(&self, _tx: &NewTransaction) -> Result<u64> {
        Err(Error::Unsupported(format!(
            "{} backend has no mutation log",
            self.kind()
        )))
    }

    /// Unprocessed mutations in append order
    async fn unresolved_mutations(&self) -> Result<Vec<PendingTransaction>> {
        Ok(Vec::new())
    }

    /// Flag a mutation as applied; the record is retained
    async fn mark_processed(&self, _id: u64) -> Result<()> {
        Err(Error::Unsupported(format!(
            "{} backend has no mutation log",
            self.kind()
        )))
    }

    /// Every mutation recorded for `id`, processed or not, in append order
    async fn mutation_history(&self, _id: &AccountId) -> Result<Vec<PendingTransaction>> {
        Ok(Vec::new())
    }
}

/// Open the backend selected by `config`
pub async fn connect(config: &StorageConfig) -> Result<Arc<dyn Backend>> {
    tracing::info!(kind = %config.kind, url = %config.url, "Connecting storage backend");

    let backend: Arc<dyn Backend> = match config.kind {
        BackendKind::File => Arc::new(FileBackend::connect(config).await?),
        BackendKind::Relational => Arc::new(RelationalBackend::connect(config).await?),
        BackendKind::Document => Arc::new(DocumentBackend::open(config)?),
    };

    Ok(backend)
}

/// Zero-based row offset of a 1-based page
pub(crate) fn page_offset(page: usize, page_size: usize) -> usize {
    page.max(1).saturating_sub(1).saturating_mul(page_size)
}

/// Byte key that sorts larger amounts first under plain byte comparison.
///
/// Exact for every `Decimal`: sign class, then decimal exponent, then the
/// significant digits and a terminator. No key is a prefix of another, so
/// bytes appended after it (an identity) only order equal amounts.
pub(crate) fn rank_key(amount: Decimal) -> Vec<u8> {
    const NEGATIVE: u8 = 0x00;
    const ZERO: u8 = 0x01;
    const POSITIVE: u8 = 0x02;

    let normalized = amount.normalize();
    let mantissa = normalized.mantissa();

    let mut ascending = Vec::with_capacity(32);
    if mantissa == 0 {
        ascending.push(ZERO);
    } else {
        let digits = mantissa.unsigned_abs().to_string();
        // Integer digit count, negative below 0.1; fits a byte for any scale <= 28
        let exponent = digits.len() as i32 - normalized.scale() as i32;
        let exponent = (exponent + 128) as u8;

        if mantissa > 0 {
            ascending.push(POSITIVE);
            ascending.push(exponent);
            ascending.extend_from_slice(digits.as_bytes());
            ascending.push(0x00);
        } else {
            ascending.push(NEGATIVE);
            ascending.push(!exponent);
            ascending.extend(digits.bytes().map(|b| !b));
            ascending.push(0xFF);
        }
    }

    ascending.into_iter().map(|b| !b).collect()
}
