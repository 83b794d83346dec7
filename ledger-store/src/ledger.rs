//! Ledger facade
//!
//! Ties the cache, the store actor and the selected backend into the
//! balance API used by the rest of the server.
//!
//! # Example
//!
//! ```no_run
//! use ledger_store::{AccountId, Config, Ledger, SessionDirectory};
//! use rust_decimal::Decimal;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> ledger_store::Result<()> {
//!     let sessions = Arc::new(SessionDirectory::new());
//!     let ledger = Ledger::open(Config::default(), sessions.clone()).await?;
//!
//!     let id = AccountId::random();
//!     sessions.join(id, "Steve");
//!     ledger.deposit(id, "dollar", Decimal::new(10000, 2)).await?;
//!
//!     ledger.shutdown().await
//! }
//! ```
//!
//! Mutations on a resident account are applied in memory and the account is
//! handed to the store actor. Backends with a mutation log accept deposits,
//! withdrawals and sets for non-resident identities without loading them:
//! the mutation is appended unresolved and applied by a later
//! reconciliation pass once the account is loaded.

use crate::actor::{spawn_store_actor, ReconcileReport, StoreHandle};
use crate::cache::AccountCache;
use crate::config::{BackendKind, Config, StorageConfig};
use crate::currency::{Currency, CurrencyRegistry};
use crate::identity::IdentityResolver;
use crate::metrics::Metrics;
use crate::migration::{BalanceSource, MigrationReport};
use crate::storage::{self, Backend};
use crate::types::{
    Account, AccountId, MutationOutcome, NewTransaction, PendingTransaction, TransactionKind,
};
use crate::{Error, Result};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;

/// Backend plus the cache and worker bound to it
struct Engine {
    backend: Arc<dyn Backend>,
    cache: Arc<AccountCache>,
    store: StoreHandle,
    worker: JoinHandle<()>,
}

impl Engine {
    fn start(backend: Arc<dyn Backend>, config: &Config, metrics: &Metrics) -> Self {
        let (store, cache, worker) = spawn_store_actor(
            backend.clone(),
            &config.cache,
            config.reconciliation.interval(),
            metrics.clone(),
        );
        Self {
            backend,
            cache,
            store,
            worker,
        }
    }

    /// Evict everything, let the worker finish within `grace`, then disconnect
    async fn stop(mut self, grace: Duration) -> Result<()> {
        let drained = self.cache.drain();

        let stopped = tokio::time::timeout(grace, async {
            self.store.shutdown().await?;
            (&mut self.worker)
                .await
                .map_err(|e| Error::Concurrency(format!("Store actor panicked: {}", e)))
        })
        .await;

        match stopped {
            Ok(Ok(())) => {
                tracing::info!(drained, unwritten = self.store.unwritten(), "Store actor drained");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Store actor did not stop cleanly");
            }
            Err(_) => {
                tracing::warn!(
                    unwritten = self.store.unwritten(),
                    "Shutdown grace period elapsed, abandoning pending writes"
                );
                self.worker.abort();
            }
        }

        self.backend.disconnect().await
    }
}

/// Per-identity async locks
#[derive(Default)]
struct IdentityLocks {
    locks: DashMap<AccountId, Arc<Mutex<()>>>,
}

impl IdentityLocks {
    async fn acquire(&self, id: AccountId) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(id).or_default().clone();
        lock.lock_owned().await
    }

    /// Forget the lock once nobody holds or waits on it
    fn release(&self, id: &AccountId, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.locks.remove_if(id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

fn unavailable(err: Error) -> Error {
    if err.is_transient() {
        Error::BackendUnavailable(err.to_string())
    } else {
        err
    }
}

fn apply_checked(
    account: &mut Account,
    kind: TransactionKind,
    currency: &str,
    amount: Decimal,
) -> Result<Decimal> {
    if kind == TransactionKind::Withdraw && !account.has_enough(currency, amount) {
        return Err(Error::InsufficientBalance {
            account: account.id,
            currency: currency.to_string(),
            requested: amount,
            available: account.balance(currency),
        });
    }
    Ok(account.apply(kind, currency, amount))
}

/// Balance store for every identity and configured currency
pub struct Ledger {
    config: Config,
    currencies: Arc<CurrencyRegistry>,
    resolver: Arc<dyn IdentityResolver>,
    engine: RwLock<Engine>,
    locks: IdentityLocks,
    metrics: Metrics,
}

impl Ledger {
    /// Open ledger with configuration
    pub async fn open(config: Config, resolver: Arc<dyn IdentityResolver>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let currencies = Arc::new(CurrencyRegistry::load_dir(&config.currencies_dir)?);
        Self::with_currencies(config, currencies, resolver).await
    }

    /// Open ledger with an already loaded currency registry
    pub async fn with_currencies(
        config: Config,
        currencies: Arc<CurrencyRegistry>,
        resolver: Arc<dyn IdentityResolver>,
    ) -> Result<Self> {
        let metrics =
            Metrics::new().map_err(|e| Error::Config(format!("Failed to create metrics: {}", e)))?;
        let backend = storage::connect(&config.storage).await?;
        let engine = Engine::start(backend, &config, &metrics);

        tracing::info!(
            service = %config.service_name,
            backend = %config.storage.kind,
            currencies = currencies.len(),
            "Ledger opened"
        );

        Ok(Self {
            config,
            currencies,
            resolver,
            engine: RwLock::new(engine),
            locks: IdentityLocks::default(),
            metrics,
        })
    }

    // Lookup

    /// Account for `id`, loading or creating it on a cache miss
    pub async fn get_account(&self, id: AccountId) -> Result<Account> {
        let engine = self.engine.read().await;
        if let Some(account) = engine.cache.get(&id) {
            self.metrics.cache_hits.inc();
            return Ok(account);
        }

        let guard = self.locks.acquire(id).await;
        let result = self.load_account(&engine, id).await;
        self.locks.release(&id, guard);
        result
    }

    /// Balance of one currency; zero for currencies the account does not hold
    pub async fn balance(&self, id: AccountId, currency: &str) -> Result<Decimal> {
        Ok(self.get_account(id).await?.balance(currency))
    }

    /// Whether the account holds at least `amount` of `currency`
    pub async fn has_enough_balance(
        &self,
        id: AccountId,
        currency: &str,
        amount: Decimal,
    ) -> Result<bool> {
        self.currencies.require(currency)?;
        Ok(self.get_account(id).await?.has_enough(currency, amount))
    }

    /// Caller must hold the identity lock
    async fn load_account(&self, engine: &Engine, id: AccountId) -> Result<Account> {
        if let Some(account) = engine.cache.get(&id) {
            self.metrics.cache_hits.inc();
            return Ok(account);
        }
        self.metrics.cache_misses.inc();

        // A snapshot still on its way to the backend is newer than the stored record
        if let Some(staged) = engine.store.staged(&id) {
            engine.cache.insert(staged.clone());
            return Ok(staged);
        }

        match engine.backend.read_account(&id).await {
            Ok(Some(account)) => {
                tracing::debug!(account_id = %id, "Account loaded");
                engine.cache.insert(account.clone());
                Ok(account)
            }
            Ok(None) => self.create_account(engine, id).await,
            Err(Error::Serialization(e)) => {
                tracing::error!(account_id = %id, error = %e, "Stored account is unreadable");
                Err(Error::AccountNotFound(id))
            }
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn create_account(&self, engine: &Engine, id: AccountId) -> Result<Account> {
        let name = self
            .resolver
            .resolve(&id)
            .await
            .ok_or(Error::AccountNotFound(id))?;

        let mut account = Account::new(id, name);
        account.reconcile_defaults(&self.currencies);

        tracing::info!(account_id = %id, name = %account.name, "Account created");

        engine.cache.insert(account.clone());
        engine.store.save(account.clone())?;
        Ok(account)
    }

    // Mutations

    /// Add `amount` to the balance
    pub async fn deposit(
        &self,
        id: AccountId,
        currency: &str,
        amount: Decimal,
    ) -> Result<MutationOutcome> {
        self.mutate(id, currency, TransactionKind::Deposit, amount).await
    }

    /// Subtract `amount`; fails with `InsufficientBalance` on a resident
    /// account that holds less
    pub async fn withdraw(
        &self,
        id: AccountId,
        currency: &str,
        amount: Decimal,
    ) -> Result<MutationOutcome> {
        self.mutate(id, currency, TransactionKind::Withdraw, amount).await
    }

    /// Replace the balance; returns the requested value
    pub async fn set_balance(
        &self,
        id: AccountId,
        currency: &str,
        amount: Decimal,
    ) -> Result<Decimal> {
        match self.mutate(id, currency, TransactionKind::Set, amount).await? {
            MutationOutcome::Applied { balance } => Ok(balance),
            MutationOutcome::Queued => Ok(amount),
        }
    }

    async fn mutate(
        &self,
        id: AccountId,
        currency: &str,
        kind: TransactionKind,
        amount: Decimal,
    ) -> Result<MutationOutcome> {
        let started = Instant::now();
        self.currencies.require(currency)?;
        if amount.is_sign_negative() {
            return Err(Error::InvalidAmount(format!("{} of {}", kind, amount)));
        }

        let engine = self.engine.read().await;
        let guard = self.locks.acquire(id).await;
        let result = self.mutate_locked(&engine, id, currency, kind, amount).await;
        self.locks.release(&id, guard);

        self.metrics.record_duration(started.elapsed().as_secs_f64());
        tracing::debug!(
            account_id = %id,
            currency,
            %kind,
            %amount,
            ok = result.is_ok(),
            "Mutation"
        );
        result
    }

    async fn mutate_locked(
        &self,
        engine: &Engine,
        id: AccountId,
        currency: &str,
        kind: TransactionKind,
        amount: Decimal,
    ) -> Result<MutationOutcome> {
        if let Some(applied) = engine
            .cache
            .update(&id, |account| apply_checked(account, kind, currency, amount))
        {
            self.metrics.cache_hits.inc();
            let balance = applied?;
            self.record_applied(engine, id, currency, kind, amount)?;
            return Ok(MutationOutcome::Applied { balance });
        }

        if engine.backend.supports_mutation_log() {
            engine
                .store
                .append_mutation(NewTransaction::new(id, currency, amount, kind, false))?;
            self.metrics.mutations_queued.inc();
            return Ok(MutationOutcome::Queued);
        }

        // No log to defer to: load and apply now
        let balance = self.apply_resident(engine, id, currency, kind, amount).await?;
        Ok(MutationOutcome::Applied { balance })
    }

    /// Load if needed and apply synchronously; caller must hold the identity lock
    async fn apply_resident(
        &self,
        engine: &Engine,
        id: AccountId,
        currency: &str,
        kind: TransactionKind,
        amount: Decimal,
    ) -> Result<Decimal> {
        for _ in 0..2 {
            if let Some(applied) = engine
                .cache
                .update(&id, |account| apply_checked(account, kind, currency, amount))
            {
                let balance = applied?;
                self.record_applied(engine, id, currency, kind, amount)?;
                return Ok(balance);
            }
            self.load_account(engine, id).await?;
        }
        Err(Error::AccountNotFound(id))
    }

    /// Audit record and write-back of a mutation applied in memory
    fn record_applied(
        &self,
        engine: &Engine,
        id: AccountId,
        currency: &str,
        kind: TransactionKind,
        amount: Decimal,
    ) -> Result<()> {
        if engine.backend.supports_mutation_log() {
            engine
                .store
                .append_mutation(NewTransaction::new(id, currency, amount, kind, true))?;
        }
        if let Some(account) = engine.cache.peek(&id) {
            engine.store.save(account)?;
        }
        Ok(())
    }

    /// Move `amount` between two accounts; both are loaded first
    pub async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        currency: &str,
        amount: Decimal,
    ) -> Result<(Decimal, Decimal)> {
        let started = Instant::now();
        let definition = self.currencies.require(currency)?;
        if !definition.transferable {
            return Err(Error::NotTransferable(currency.to_string()));
        }
        if amount.is_sign_negative() {
            return Err(Error::InvalidAmount(format!("transfer of {}", amount)));
        }
        if from == to {
            return Err(Error::InvalidAmount("transfer to the same account".into()));
        }

        let engine = self.engine.read().await;

        // Payee must exist before the payer is debited
        let guard = self.locks.acquire(to).await;
        let payee = self.load_account(&engine, to).await;
        self.locks.release(&to, guard);
        payee?;

        let guard = self.locks.acquire(from).await;
        let debited = self
            .apply_resident(&engine, from, currency, TransactionKind::Withdraw, amount)
            .await;
        self.locks.release(&from, guard);
        let from_balance = debited?;

        let guard = self.locks.acquire(to).await;
        let credited = self
            .apply_resident(&engine, to, currency, TransactionKind::Deposit, amount)
            .await;
        self.locks.release(&to, guard);

        let to_balance = match credited {
            Ok(balance) => balance,
            Err(e) => {
                tracing::warn!(account_id = %to, error = %e, "Transfer credit failed, refunding");
                let guard = self.locks.acquire(from).await;
                let refund = self
                    .apply_resident(&engine, from, currency, TransactionKind::Deposit, amount)
                    .await;
                self.locks.release(&from, guard);
                if let Err(refund_err) = refund {
                    tracing::error!(account_id = %from, error = %refund_err, "Transfer refund failed");
                }
                return Err(e);
            }
        };

        self.metrics.record_duration(started.elapsed().as_secs_f64());
        tracing::info!(%from, %to, currency, %amount, "Transfer");
        Ok((from_balance, to_balance))
    }

    /// Persist a caller-supplied account; replaces the resident copy if any
    pub async fn save_or_update(&self, account: Account) -> Result<()> {
        let engine = self.engine.read().await;
        let id = account.id;
        let guard = self.locks.acquire(id).await;

        if engine.cache.contains(&id) {
            engine.cache.insert(account.clone());
        }
        let result = engine.store.save(account);

        self.locks.release(&id, guard);
        result
    }

    // Ranking

    /// One page of holders of `currency`, highest balance first.
    ///
    /// Pages are 1-based; page 0 reads as page 1. Pending writes are flushed
    /// first so resident balances are ranked with their latest values.
    pub async fn top_balances(&self, currency: &str, page: usize) -> Result<Vec<Account>> {
        self.currencies.require(currency)?;
        let engine = self.engine.read().await;
        engine.store.sync().await?;
        engine
            .backend
            .query_top(currency, page.max(1), self.config.ranking.page_size)
            .await
            .map_err(unavailable)
    }

    // Session lifecycle

    /// Load the account of a connecting identity and add missing currencies
    pub async fn session_started(&self, id: AccountId) -> Result<Account> {
        let engine = self.engine.read().await;
        let guard = self.locks.acquire(id).await;

        let result = async {
            self.load_account(&engine, id).await?;
            let added = engine
                .cache
                .update(&id, |account| account.reconcile_defaults(&self.currencies))
                .unwrap_or(0);
            let account = engine.cache.peek(&id).ok_or(Error::AccountNotFound(id))?;
            if added > 0 {
                engine.store.save(account.clone())?;
            }
            Ok::<_, Error>(account)
        }
        .await;

        self.locks.release(&id, guard);
        result
    }

    /// Evict the account of a disconnecting identity (written back)
    pub async fn session_ended(&self, id: AccountId) {
        let engine = self.engine.read().await;
        if engine.cache.invalidate(&id) {
            tracing::debug!(account_id = %id, "Session ended, account evicted");
        }
    }

    // Maintenance

    /// Run one reconciliation pass now
    pub async fn reconcile_now(&self) -> Result<ReconcileReport> {
        let engine = self.engine.read().await;
        engine.store.reconcile().await
    }

    /// Wait until every write issued so far was handled
    pub async fn flush(&self) -> Result<()> {
        let engine = self.engine.read().await;
        engine.store.sync().await
    }

    /// Every mutation recorded for `id` (empty without a mutation log)
    pub async fn mutation_history(&self, id: AccountId) -> Result<Vec<PendingTransaction>> {
        let engine = self.engine.read().await;
        engine.store.sync().await?;
        engine.backend.mutation_history(&id).await.map_err(unavailable)
    }

    /// Connect `storage`, then drain and disconnect the current backend.
    ///
    /// On connect failure the current backend stays in place.
    pub async fn switch_backend(&self, storage: StorageConfig) -> Result<()> {
        let mut engine = self.engine.write().await;
        let backend = storage::connect(&storage).await?;

        let previous = std::mem::replace(
            &mut *engine,
            Engine::start(backend, &self.config, &self.metrics),
        );
        let from = previous.backend.kind();
        previous
            .stop(self.config.reconciliation.shutdown_grace())
            .await?;

        tracing::info!(%from, to = %storage.kind, "Storage backend switched");
        Ok(())
    }

    /// Import balances from an external economy for `ids`.
    ///
    /// Does nothing unless the migration config is active.
    pub async fn migrate(
        &self,
        source: &dyn BalanceSource,
        ids: &[AccountId],
    ) -> Result<MigrationReport> {
        let migration = &self.config.migration;
        let mut report = MigrationReport::default();
        if !migration.active {
            return Ok(report);
        }

        tracing::info!(source = %migration.source_id, identities = ids.len(), "Migration started");

        for &id in ids {
            report.accounts += 1;
            if let Err(e) = self.get_account(id).await {
                tracing::warn!(account_id = %id, error = %e, "Migration skipped identity");
                report.failed += 1;
                continue;
            }

            for mapping in &migration.mappings {
                if self.currencies.get(&mapping.target).is_none() {
                    tracing::warn!(target = %mapping.target, "Migration target currency unknown");
                    report.failed += 1;
                    continue;
                }

                match source.balance(&id, &mapping.source).await {
                    Ok(Some(amount)) if amount > Decimal::ZERO => {
                        match self.set_balance(id, &mapping.target, amount).await {
                            Ok(_) => report.migrated += 1,
                            Err(e) => {
                                tracing::warn!(account_id = %id, error = %e, "Migration write failed");
                                report.failed += 1;
                            }
                        }
                    }
                    Ok(_) => report.skipped += 1,
                    Err(e) => {
                        tracing::warn!(account_id = %id, source = %mapping.source, error = %e, "Migration read failed");
                        report.failed += 1;
                    }
                }
            }
        }

        tracing::info!(?report, "Migration finished");
        Ok(report)
    }

    // Accessors

    /// Render `amount` with the currency's format template
    pub fn format(&self, currency: &str, amount: Decimal) -> Result<String> {
        let definition = self.currencies.require(currency)?;
        Ok(definition.format(amount, self.config.formatting.short_amount_precision))
    }

    /// The primary currency
    pub fn primary_currency(&self) -> &Currency {
        self.currencies.primary()
    }

    /// Configured currencies
    pub fn currencies(&self) -> &CurrencyRegistry {
        &self.currencies
    }

    /// Configuration the ledger was opened with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Technology of the active backend
    pub async fn backend_kind(&self) -> BackendKind {
        self.engine.read().await.backend.kind()
    }

    /// Whether the active backend can serve requests
    pub async fn is_connected(&self) -> bool {
        let engine = self.engine.read().await;
        engine.backend.is_connected().await
    }

    /// Write back every resident account, stop the worker and disconnect.
    ///
    /// Pending writes get the configured grace period.
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("Shutting down ledger");
        let grace = self.config.reconciliation.shutdown_grace();
        self.engine.into_inner().stop(grace).await
    }
}
