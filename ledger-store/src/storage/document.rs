//! Document backend using RocksDB
//!
//! # Column Families
//!
//! - `accounts` - account documents as JSON (key: identity bytes)
//! - `mutations` - mutation log, bincode (key: big-endian sequence)
//! - `pending` - unprocessed mutations (key: sequence)
//! - `account_mutations` - per-identity history (key: identity || sequence)
//! - `ranking` - balance index (key: currency || 0x00 || rank key || identity)
//!
//! Column families are created on open when missing, which makes index
//! creation idempotent. Every document write and its index updates go into
//! one `WriteBatch`. RocksDB calls block, so each one runs on tokio's blocking
//! pool.

use super::{page_offset, rank_key, Backend};
use crate::config::{BackendKind, StorageConfig};
use crate::error::{Error, Result};
use crate::types::{Account, AccountId, NewTransaction, PendingTransaction};
use async_trait::async_trait;
use parking_lot::RwLock;
use rocksdb::{
    BlockBasedOptions, ColumnFamily, ColumnFamilyDescriptor, DBCompressionType, Direction,
    IteratorMode, Options, WriteBatch, DB,
};
use rust_decimal::Decimal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

const CF_ACCOUNTS: &str = "accounts";
const CF_MUTATIONS: &str = "mutations";
const CF_PENDING: &str = "pending";
const CF_ACCOUNT_MUTATIONS: &str = "account_mutations";
const CF_RANKING: &str = "ranking";

/// Account documents plus indexes in RocksDB
pub struct DocumentBackend {
    path: PathBuf,
    db: RwLock<Option<Arc<DB>>>,
    next_seq: AtomicU64,
}

impl std::fmt::Debug for DocumentBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentBackend")
            .field("path", &self.path)
            .field("next_seq", &self.next_seq.load(Ordering::Relaxed))
            .finish()
    }
}

impl DocumentBackend {
    /// Open or create the database at `<url>/<database>`
    pub fn open(config: &StorageConfig) -> Result<Self> {
        let path = PathBuf::from(&config.url).join(&config.database);
        std::fs::create_dir_all(&path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ACCOUNTS, Self::cf_options_documents()),
            ColumnFamilyDescriptor::new(CF_MUTATIONS, Self::cf_options_log()),
            ColumnFamilyDescriptor::new(CF_PENDING, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_ACCOUNT_MUTATIONS, Self::cf_options_index()),
            ColumnFamilyDescriptor::new(CF_RANKING, Self::cf_options_index()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, &path, cf_descriptors)
            .map_err(|e| Error::BackendUnavailable(format!("{:?}: {}", path, e)))?;

        let last_seq = Self::last_sequence(&db)?;

        tracing::info!(path = ?path, last_seq, "Opened RocksDB document store");

        Ok(Self {
            path,
            db: RwLock::new(Some(Arc::new(db))),
            next_seq: AtomicU64::new(last_seq + 1),
        })
    }

    // Column family options

    fn cf_options_documents() -> Options {
        let mut opts = Options::default();
        // Documents are read on every cache miss
        opts.set_compression_type(DBCompressionType::Lz4);
        opts
    }

    fn cf_options_log() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(DBCompressionType::Zstd);
        opts
    }

    fn cf_options_index() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(DBCompressionType::Lz4);
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn last_sequence(db: &DB) -> Result<u64> {
        let cf = cf_handle(db, CF_MUTATIONS)?;
        match db.iterator_cf(cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item?;
                decode_seq(&key)
            }
            None => Ok(0),
        }
    }

    fn db(&self) -> Result<Arc<DB>> {
        self.db
            .read()
            .clone()
            .ok_or_else(|| Error::BackendUnavailable("document store closed".into()))
    }

    /// Run a RocksDB call on the blocking pool
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&DB) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db()?;
        tokio::task::spawn_blocking(move || f(db.as_ref()))
            .await
            .map_err(|e| Error::Concurrency(format!("RocksDB task failed: {}", e)))?
    }

    fn load_document(db: &DB, id: &AccountId) -> Result<Option<Account>> {
        let cf = cf_handle(db, CF_ACCOUNTS)?;
        match db.get_cf(cf, id.as_uuid().as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn load_mutation(db: &DB, seq: u64) -> Result<PendingTransaction> {
        let cf = cf_handle(db, CF_MUTATIONS)?;
        let bytes = db
            .get_cf(cf, seq.to_be_bytes())?
            .ok_or_else(|| Error::Storage(format!("mutation {} not found", seq)))?;
        Ok(bincode::deserialize(&bytes)?)
    }
}

fn cf_handle<'a>(db: &'a DB, name: &str) -> Result<&'a ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
}

fn decode_seq(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .get(key.len().saturating_sub(8)..)
        .and_then(|tail| tail.try_into().ok())
        .ok_or_else(|| Error::Serialization("short sequence key".into()))?;
    Ok(u64::from_be_bytes(bytes))
}

fn ranking_prefix(currency: &str) -> Vec<u8> {
    let mut key = currency.as_bytes().to_vec();
    key.push(0);
    key
}

fn ranking_key(currency: &str, amount: Decimal, id: &AccountId) -> Vec<u8> {
    let mut key = ranking_prefix(currency);
    key.extend_from_slice(&rank_key(amount));
    key.extend_from_slice(id.as_uuid().as_bytes());
    key
}

fn history_key(id: &AccountId, seq: u64) -> Vec<u8> {
    let mut key = id.as_uuid().as_bytes().to_vec();
    key.extend_from_slice(&seq.to_be_bytes());
    key
}

fn id_from_ranking_key(key: &[u8]) -> Result<AccountId> {
    let bytes: [u8; 16] = key
        .get(key.len().saturating_sub(16)..)
        .and_then(|tail| tail.try_into().ok())
        .ok_or_else(|| Error::Serialization("short ranking key".into()))?;
    Ok(AccountId::new(Uuid::from_bytes(bytes)))
}

#[async_trait]
impl Backend for DocumentBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    async fn disconnect(&self) -> Result<()> {
        // Dropping the last handle closes the database and releases its lock
        if self.db.write().take().is_some() {
            tracing::info!(path = ?self.path, "RocksDB closed");
        }
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.db.read().is_some()
    }

    async fn read_account(&self, id: &AccountId) -> Result<Option<Account>> {
        let id = *id;
        self.blocking(move |db| Self::load_document(db, &id)).await
    }

    async fn upsert_account(&self, account: &Account) -> Result<()> {
        let account = account.clone();
        self.blocking(move |db| {
            let cf_accounts = cf_handle(db, CF_ACCOUNTS)?;
            let cf_ranking = cf_handle(db, CF_RANKING)?;

            let mut batch = WriteBatch::default();

            // Stale index entries of the previous version
            if let Some(previous) = Self::load_document(db, &account.id)? {
                for (currency, amount) in &previous.balances {
                    batch.delete_cf(cf_ranking, ranking_key(currency, *amount, &previous.id));
                }
            }

            batch.put_cf(
                cf_accounts,
                account.id.as_uuid().as_bytes(),
                serde_json::to_vec(&account)?,
            );
            for (currency, amount) in &account.balances {
                batch.put_cf(cf_ranking, ranking_key(currency, *amount, &account.id), b"");
            }

            db.write(batch)?;

            tracing::debug!(account_id = %account.id, "Account document written");
            Ok(())
        })
        .await
    }

    async fn query_top(
        &self,
        currency: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<Account>> {
        let currency = currency.to_string();
        self.blocking(move |db| {
            let cf_ranking = cf_handle(db, CF_RANKING)?;
            let prefix = ranking_prefix(&currency);

            let iter = db.iterator_cf(cf_ranking, IteratorMode::From(prefix.as_slice(), Direction::Forward));

            let mut accounts = Vec::with_capacity(page_size);
            for item in iter.skip(page_offset(page, page_size)) {
                if accounts.len() >= page_size {
                    break;
                }
                let (key, _) = item?;
                if !key.starts_with(&prefix) {
                    break;
                }

                let id = id_from_ranking_key(&key)?;
                match Self::load_document(db, &id)? {
                    Some(account) => accounts.push(account.project(&currency)),
                    None => tracing::warn!(account_id = %id, "Ranking entry without document"),
                }
            }

            Ok(accounts)
        })
        .await
    }

    fn supports_mutation_log(&self) -> bool {
        true
    }

    async fn append_mutation(&self, tx: &NewTransaction) -> Result<u64> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let record = PendingTransaction::from_new(seq, tx.clone());

        self.blocking(move |db| {
            let mut batch = WriteBatch::default();
            batch.put_cf(
                cf_handle(db, CF_MUTATIONS)?,
                seq.to_be_bytes(),
                bincode::serialize(&record)?,
            );
            if !record.processed {
                batch.put_cf(cf_handle(db, CF_PENDING)?, seq.to_be_bytes(), b"");
            }
            batch.put_cf(
                cf_handle(db, CF_ACCOUNT_MUTATIONS)?,
                history_key(&record.account_id, seq),
                b"",
            );
            db.write(batch)?;

            Ok(seq)
        })
        .await
    }

    async fn unresolved_mutations(&self) -> Result<Vec<PendingTransaction>> {
        self.blocking(|db| {
            let cf_pending = cf_handle(db, CF_PENDING)?;

            let mut pending = Vec::new();
            for item in db.iterator_cf(cf_pending, IteratorMode::Start) {
                let (key, _) = item?;
                pending.push(Self::load_mutation(db, decode_seq(&key)?)?);
            }
            Ok(pending)
        })
        .await
    }

    async fn mark_processed(&self, id: u64) -> Result<()> {
        self.blocking(move |db| {
            let mut record = Self::load_mutation(db, id)?;
            record.processed = true;

            let mut batch = WriteBatch::default();
            batch.put_cf(
                cf_handle(db, CF_MUTATIONS)?,
                id.to_be_bytes(),
                bincode::serialize(&record)?,
            );
            batch.delete_cf(cf_handle(db, CF_PENDING)?, id.to_be_bytes());
            db.write(batch)?;

            Ok(())
        })
        .await
    }

    async fn mutation_history(&self, id: &AccountId) -> Result<Vec<PendingTransaction>> {
        let prefix = id.as_uuid().as_bytes().to_vec();
        self.blocking(move |db| {
            let cf = cf_handle(db, CF_ACCOUNT_MUTATIONS)?;

            let mut history = Vec::new();
            for item in db.iterator_cf(cf, IteratorMode::From(prefix.as_slice(), Direction::Forward)) {
                let (key, _) = item?;
                if !key.starts_with(&prefix) {
                    break;
                }
                history.push(Self::load_mutation(db, decode_seq(&key)?)?);
            }
            Ok(history)
        })
        .await
    }
}
