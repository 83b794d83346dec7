//! Relational backend (SQLite through sqlx)
//!
//! # Tables
//!
//! - `accounts` - identity and display name
//! - `balances` - one row per (identity, currency); amounts stored as
//!   decimal strings next to a byte-ordered `rank_key` used for ranking
//! - `mutations` - append-only mutation log with a `processed` flag
//!
//! Schema changes are applied at connect time by a migration worker. Every
//! step is idempotent, so reconnecting to an existing database is a no-op.

use super::{page_offset, rank_key, Backend};
use crate::config::{BackendKind, StorageConfig};
use crate::error::{Error, Result};
use crate::types::{Account, AccountId, NewTransaction, PendingTransaction, TransactionKind};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::collections::BTreeMap;
use std::str::FromStr;

const CREATE_TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS accounts (
        account_id TEXT PRIMARY KEY NOT NULL,
        name TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS balances (
        account_id TEXT NOT NULL,
        currency_id TEXT NOT NULL,
        amount TEXT NOT NULL,
        rank_key BLOB,
        PRIMARY KEY (account_id, currency_id),
        FOREIGN KEY (account_id) REFERENCES accounts (account_id)
    )",
    "CREATE TABLE IF NOT EXISTS mutations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        account_id TEXT NOT NULL,
        currency_id TEXT NOT NULL,
        amount TEXT NOT NULL,
        kind TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
];

/// Applied after the base tables exist, in order
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "mutations.processed",
        "ALTER TABLE mutations ADD COLUMN processed INTEGER NOT NULL DEFAULT 0",
    ),
    (
        "balances.rank_key",
        "ALTER TABLE balances ADD COLUMN rank_key BLOB",
    ),
    (
        "idx_balances_rank",
        "CREATE INDEX IF NOT EXISTS idx_balances_rank ON balances (currency_id, rank_key, account_id)",
    ),
    (
        "idx_mutations_processed",
        "CREATE INDEX IF NOT EXISTS idx_mutations_processed ON mutations (processed, id)",
    ),
    (
        "idx_mutations_account",
        "CREATE INDEX IF NOT EXISTS idx_mutations_account ON mutations (account_id, currency_id)",
    ),
    (
        "idx_mutations_created",
        "CREATE INDEX IF NOT EXISTS idx_mutations_created ON mutations (created_at)",
    ),
];

/// Accounts and mutation log in SQL tables
#[derive(Debug)]
pub struct RelationalBackend {
    pool: SqlitePool,
}

impl RelationalBackend {
    /// Open the pool, create tables, then run migrations
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        tracing::info!(url = %config.url, "Connecting to database...");

        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| Error::Config(format!("Invalid database url {}: {}", config.url, e)))?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .connect_with(options)
            .await
            .map_err(|e| Error::BackendUnavailable(format!("{}: {}", config.url, e)))?;

        sqlx::query("SELECT 1").fetch_one(&pool).await?;
        tracing::info!("Database connection verified");

        for statement in CREATE_TABLES {
            sqlx::query(statement).execute(&pool).await?;
        }

        let worker = tokio::spawn(run_migrations(pool.clone()));
        match worker.await {
            Ok(applied) => tracing::info!(applied, "Schema migrations complete"),
            Err(e) => tracing::warn!(error = %e, "Migration worker stopped early"),
        }

        let backfilled = backfill_rank_keys(&pool).await?;
        if backfilled > 0 {
            tracing::info!(backfilled, "Ranking keys computed for existing balances");
        }

        Ok(Self { pool })
    }

    async fn load_balances(&self, id: &AccountId) -> Result<BTreeMap<String, Decimal>> {
        let rows = sqlx::query("SELECT currency_id, amount FROM balances WHERE account_id = ?")
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await?;

        let mut balances = BTreeMap::new();
        for row in rows {
            let currency: String = row.try_get("currency_id")?;
            let amount: String = row.try_get("amount")?;
            balances.insert(currency, Decimal::from_str(&amount)?);
        }
        Ok(balances)
    }

    async fn fetch_mutations(&self, sql: &str, bind: Option<String>) -> Result<Vec<PendingTransaction>> {
        let mut query = sqlx::query(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(mutation_from_row).collect()
    }
}

/// Apply every migration, tolerating ones already present
async fn run_migrations(pool: SqlitePool) -> usize {
    let mut applied = 0;
    for (name, statement) in MIGRATIONS {
        match sqlx::query(statement).execute(&pool).await {
            Ok(_) => {
                applied += 1;
                tracing::debug!(migration = name, "Migration applied");
            }
            Err(e) if e.to_string().contains("duplicate column") => {
                tracing::debug!(migration = name, "Migration already present");
            }
            Err(e) => {
                tracing::warn!(migration = name, error = %e, "Migration failed");
            }
        }
    }
    applied
}

/// Fill `rank_key` for rows written before the column existed
async fn backfill_rank_keys(pool: &SqlitePool) -> Result<usize> {
    let rows = sqlx::query(
        "SELECT account_id, currency_id, amount FROM balances WHERE rank_key IS NULL",
    )
    .fetch_all(pool)
    .await?;

    for row in &rows {
        let amount: String = row.try_get("amount")?;
        sqlx::query("UPDATE balances SET rank_key = ? WHERE account_id = ? AND currency_id = ?")
            .bind(rank_key(Decimal::from_str(&amount)?))
            .bind(row.try_get::<String, _>("account_id")?)
            .bind(row.try_get::<String, _>("currency_id")?)
            .execute(pool)
            .await?;
    }
    Ok(rows.len())
}

fn parse_account_id(raw: &str) -> Result<AccountId> {
    raw.parse()
        .map_err(|e| Error::Serialization(format!("bad account id {}: {}", raw, e)))
}

fn mutation_from_row(row: &SqliteRow) -> Result<PendingTransaction> {
    let id: i64 = row.try_get("id")?;
    let account_id: String = row.try_get("account_id")?;
    let amount: String = row.try_get("amount")?;
    let kind: String = row.try_get("kind")?;
    let processed: i64 = row.try_get("processed")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;

    Ok(PendingTransaction {
        id: id as u64,
        account_id: parse_account_id(&account_id)?,
        currency: row.try_get("currency_id")?,
        amount: Decimal::from_str(&amount)?,
        kind: TransactionKind::parse(&kind),
        processed: processed != 0,
        created_at,
    })
}

#[async_trait]
impl Backend for RelationalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Relational
    }

    async fn disconnect(&self) -> Result<()> {
        self.pool.close().await;
        tracing::info!("Database pool closed");
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn read_account(&self, id: &AccountId) -> Result<Option<Account>> {
        let row = sqlx::query("SELECT name FROM accounts WHERE account_id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let name: String = row.try_get("name")?;
        let balances = self.load_balances(id).await?;

        Ok(Some(Account::with_balances(*id, name, balances)))
    }

    async fn upsert_account(&self, account: &Account) -> Result<()> {
        let account_id = account.id.to_string();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO accounts (account_id, name) VALUES (?, ?)
             ON CONFLICT (account_id) DO UPDATE SET name = excluded.name",
        )
        .bind(&account_id)
        .bind(&account.name)
        .execute(&mut *tx)
        .await?;

        for (currency, amount) in &account.balances {
            sqlx::query(
                "INSERT INTO balances (account_id, currency_id, amount, rank_key) VALUES (?, ?, ?, ?)
                 ON CONFLICT (account_id, currency_id)
                 DO UPDATE SET amount = excluded.amount, rank_key = excluded.rank_key",
            )
            .bind(&account_id)
            .bind(currency)
            .bind(amount.to_string())
            .bind(rank_key(*amount))
            .execute(&mut *tx)
            .await?;
        }

        // Drop currencies no longer present in the map
        let stored: Vec<String> =
            sqlx::query_scalar("SELECT currency_id FROM balances WHERE account_id = ?")
                .bind(&account_id)
                .fetch_all(&mut *tx)
                .await?;
        for currency in stored {
            if !account.balances.contains_key(&currency) {
                sqlx::query("DELETE FROM balances WHERE account_id = ? AND currency_id = ?")
                    .bind(&account_id)
                    .bind(&currency)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;

        tracing::debug!(account_id = %account.id, "Account upserted");
        Ok(())
    }

    async fn query_top(
        &self,
        currency: &str,
        page: usize,
        page_size: usize,
    ) -> Result<Vec<Account>> {
        let rows = sqlx::query(
            "SELECT a.account_id, a.name, b.amount
             FROM balances b
             JOIN accounts a ON a.account_id = b.account_id
             WHERE b.currency_id = ?
             ORDER BY b.rank_key ASC, b.account_id ASC
             LIMIT ? OFFSET ?",
        )
        .bind(currency)
        .bind(page_size as i64)
        .bind(page_offset(page, page_size) as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut accounts = Vec::with_capacity(rows.len());
        for row in rows {
            let account_id: String = row.try_get("account_id")?;
            let amount: String = row.try_get("amount")?;
            let mut balances = BTreeMap::new();
            balances.insert(currency.to_string(), Decimal::from_str(&amount)?);
            accounts.push(Account::with_balances(
                parse_account_id(&account_id)?,
                row.try_get::<String, _>("name")?,
                balances,
            ));
        }

        Ok(accounts)
    }

    fn supports_mutation_log(&self) -> bool {
        true
    }

    async fn append_mutation(&self, tx: &NewTransaction) -> Result<u64> {
        let result = sqlx::query(
            "INSERT INTO mutations (account_id, currency_id, amount, kind, processed, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(tx.account_id.to_string())
        .bind(&tx.currency)
        .bind(tx.amount.to_string())
        .bind(tx.kind.as_str())
        .bind(tx.processed as i64)
        .bind(tx.created_at)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid() as u64)
    }

    async fn unresolved_mutations(&self) -> Result<Vec<PendingTransaction>> {
        self.fetch_mutations(
            "SELECT id, account_id, currency_id, amount, kind, processed, created_at
             FROM mutations WHERE processed = 0 ORDER BY id ASC",
            None,
        )
        .await
    }

    async fn mark_processed(&self, id: u64) -> Result<()> {
        let result = sqlx::query("UPDATE mutations SET processed = 1 WHERE id = ?")
            .bind(id as i64)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::Storage(format!("mutation {} not found", id)));
        }
        Ok(())
    }

    async fn mutation_history(&self, id: &AccountId) -> Result<Vec<PendingTransaction>> {
        self.fetch_mutations(
            "SELECT id, account_id, currency_id, amount, kind, processed, created_at
             FROM mutations WHERE account_id = ? ORDER BY id ASC",
            Some(id.to_string()),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn backend() -> (RelationalBackend, TempDir) {
        let temp = TempDir::new().unwrap();
        let url = format!("sqlite://{}", temp.path().join("ledger.db").display());
        let backend = RelationalBackend::connect(&StorageConfig::relational(url))
            .await
            .unwrap();
        (backend, temp)
    }

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn account_with(name: &str, currency: &str, amount: &str) -> Account {
        let mut account = Account::new(AccountId::random(), name);
        account.set_balance(currency, dec(amount));
        account
    }

    #[tokio::test]
    async fn test_upsert_and_read() {
        let (backend, _temp) = backend().await;
        let mut account = account_with("Steve", "dollar", "100.25");
        account.set_balance("euro", dec("3"));

        backend.upsert_account(&account).await.unwrap();
        assert_eq!(backend.read_account(&account.id).await.unwrap(), Some(account.clone()));

        // Removing a currency removes its row
        account.balances.remove("euro");
        account.set_balance("dollar", dec("1"));
        backend.upsert_account(&account).await.unwrap();
        assert_eq!(backend.read_account(&account.id).await.unwrap(), Some(account));
    }

    #[tokio::test]
    async fn test_reconnect_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let url = format!("sqlite://{}", temp.path().join("ledger.db").display());

        let first = RelationalBackend::connect(&StorageConfig::relational(url.clone()))
            .await
            .unwrap();
        let account = account_with("Alex", "dollar", "5");
        first.upsert_account(&account).await.unwrap();
        first.disconnect().await.unwrap();
        assert!(!first.is_connected().await);

        let second = RelationalBackend::connect(&StorageConfig::relational(url))
            .await
            .unwrap();
        assert_eq!(second.read_account(&account.id).await.unwrap(), Some(account));
    }

    #[tokio::test]
    async fn test_ranking_order_and_paging() {
        let (backend, _temp) = backend().await;
        let amounts = ["5", "50", "20", "20", "0.5"];
        for (i, amount) in amounts.iter().enumerate() {
            let account = account_with(&format!("p{}", i), "dollar", amount);
            backend.upsert_account(&account).await.unwrap();
        }
        // Other currencies do not take part
        backend
            .upsert_account(&account_with("rich", "euro", "1000"))
            .await
            .unwrap();

        let first = backend.query_top("dollar", 1, 3).await.unwrap();
        let second = backend.query_top("dollar", 2, 3).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 2);

        let ranked: Vec<Decimal> = first
            .iter()
            .chain(second.iter())
            .map(|a| a.balance("dollar"))
            .collect();
        assert_eq!(ranked, vec![dec("50"), dec("20"), dec("20"), dec("5"), dec("0.5")]);

        // Ties break by identity ascending
        assert!(first[1].id < first[2].id);
        assert!(first.iter().all(|a| a.balances.len() == 1));
    }

    #[tokio::test]
    async fn test_ranking_separates_last_digit() {
        let (backend, _temp) = backend().await;
        // Both amounts round to the same f64
        let mut ids = [AccountId::random(), AccountId::random()];
        ids.sort();
        let mut low = Account::new(ids[0], "low");
        low.set_balance("dollar", dec("12345678901234567.01"));
        let mut high = Account::new(ids[1], "high");
        high.set_balance("dollar", dec("12345678901234567.02"));
        backend.upsert_account(&low).await.unwrap();
        backend.upsert_account(&high).await.unwrap();

        let top = backend.query_top("dollar", 1, 10).await.unwrap();
        assert_eq!(top.iter().map(|a| a.id).collect::<Vec<_>>(), vec![high.id, low.id]);
        assert_eq!(top[0].balance("dollar"), dec("12345678901234567.02"));
    }

    #[tokio::test]
    async fn test_missing_rank_keys_are_backfilled() {
        let temp = TempDir::new().unwrap();
        let url = format!("sqlite://{}", temp.path().join("ledger.db").display());

        let first = RelationalBackend::connect(&StorageConfig::relational(url.clone()))
            .await
            .unwrap();
        let rich = account_with("rich", "dollar", "90");
        let poor = account_with("poor", "dollar", "9");
        first.upsert_account(&poor).await.unwrap();
        first.upsert_account(&rich).await.unwrap();
        sqlx::query("UPDATE balances SET rank_key = NULL")
            .execute(&first.pool)
            .await
            .unwrap();
        first.disconnect().await.unwrap();

        let second = RelationalBackend::connect(&StorageConfig::relational(url))
            .await
            .unwrap();
        let top = second.query_top("dollar", 1, 10).await.unwrap();
        assert_eq!(top.iter().map(|a| a.id).collect::<Vec<_>>(), vec![rich.id, poor.id]);
    }

    #[tokio::test]
    async fn test_mutation_log_lifecycle() {
        let (backend, _temp) = backend().await;
        let id = AccountId::random();

        let a = backend
            .append_mutation(&NewTransaction::new(id, "dollar", dec("10"), TransactionKind::Deposit, false))
            .await
            .unwrap();
        let b = backend
            .append_mutation(&NewTransaction::new(id, "dollar", dec("3"), TransactionKind::Withdraw, false))
            .await
            .unwrap();
        assert!(b > a);

        let pending = backend.unresolved_mutations().await.unwrap();
        assert_eq!(pending.iter().map(|t| t.id).collect::<Vec<_>>(), vec![a, b]);
        assert_eq!(pending[1].kind, TransactionKind::Withdraw);

        backend.mark_processed(a).await.unwrap();
        let pending = backend.unresolved_mutations().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, b);

        // Processed records stay for audit
        let history = backend.mutation_history(&id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history[0].processed);

        assert!(backend.mark_processed(9_999).await.is_err());
    }
}
