//! Store worker: write-back and reconciliation
//!
//! All backend writes go through one task, so per-identity writes reach the
//! backend in the order they were issued.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                Ledger facade / cache                  │
//! │      save, append, evictions (never block)            │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       │ mpsc::unbounded_channel
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │               StoreActor (single task)                │
//! │  ┌────────────────────────────────────────────────┐  │
//! │  │ Upsert / AppendMutation -> backend             │  │
//! │  │ Timer: every interval -> reconcile()           │  │
//! │  │   expire idle accounts                         │  │
//! │  │   retry failed writes and appends              │  │
//! │  │   apply unresolved mutations to residents      │  │
//! │  └────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────┘
//! ```
//!
//! A snapshot handed to the worker stays visible through [`InflightWrites`]
//! until the backend accepted it. A cache miss consults that map first, so a
//! reload never observes a state older than the last eviction.

use crate::cache::{AccountCache, Eviction, EvictionListener};
use crate::config::CacheConfig;
use crate::metrics::Metrics;
use crate::storage::Backend;
use crate::types::{Account, AccountId, NewTransaction, PendingTransaction};
use crate::{Error, Result};
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

/// Message sent to the store actor
pub enum StoreMessage {
    /// Persist an account snapshot
    Upsert {
        account: Account,
        seq: u64,
    },

    /// Append a mutation record
    AppendMutation {
        tx: NewTransaction,
    },

    /// Reply once every earlier message was handled
    Sync {
        response: oneshot::Sender<()>,
    },

    /// Run one reconciliation pass now
    Reconcile {
        response: oneshot::Sender<Result<ReconcileReport>>,
    },

    /// Finish queued work and stop
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Idle accounts evicted
    pub expired: usize,
    /// Staged snapshots written on retry
    pub rewritten: usize,
    /// Unresolved mutations read from the log
    pub scanned: usize,
    /// Mutations applied and marked processed
    pub applied: usize,
    /// Mutations left for a later pass (account not resident)
    pub deferred: usize,
    /// Mutations left unresolved because marking them failed
    pub failed: usize,
}

/// Snapshots handed to the worker but not yet accepted by the backend
#[derive(Debug, Default)]
pub struct InflightWrites {
    seq: AtomicU64,
    pending: DashMap<AccountId, (u64, Account)>,
}

impl InflightWrites {
    fn stage(&self, account: Account) -> u64 {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.pending.insert(account.id, (seq, account));
        seq
    }

    /// Drop the staged snapshot if no newer one replaced it
    fn complete(&self, id: &AccountId, seq: u64) {
        self.pending.remove_if(id, |_, (staged, _)| *staged == seq);
    }

    /// Latest staged snapshot for `id`
    pub fn get(&self, id: &AccountId) -> Option<Account> {
        self.pending.get(id).map(|entry| entry.value().1.clone())
    }

    /// Whether `seq` is still the latest snapshot staged for `id`
    fn is_current(&self, id: &AccountId, seq: u64) -> bool {
        self.pending
            .get(id)
            .map(|entry| entry.value().0 == seq)
            .unwrap_or(false)
    }

    fn snapshot(&self) -> Vec<(u64, Account)> {
        self.pending
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of staged snapshots
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// No staged snapshots
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Actor that owns all backend writes
pub struct StoreActor {
    backend: Arc<dyn Backend>,
    cache: Arc<AccountCache>,
    inflight: Arc<InflightWrites>,
    mailbox: mpsc::UnboundedReceiver<StoreMessage>,
    failed_appends: Vec<NewTransaction>,
    interval: Duration,
    metrics: Metrics,
}

impl StoreActor {
    /// Create new actor
    pub fn new(
        backend: Arc<dyn Backend>,
        cache: Arc<AccountCache>,
        inflight: Arc<InflightWrites>,
        mailbox: mpsc::UnboundedReceiver<StoreMessage>,
        interval: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            backend,
            cache,
            inflight,
            mailbox,
            failed_appends: Vec::new(),
            interval,
            metrics,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                msg = self.mailbox.recv() => match msg {
                    Some(StoreMessage::Shutdown { response }) => {
                        self.drain().await;
                        let _ = response.send(());
                        break;
                    }
                    Some(msg) => self.handle_message(msg).await,
                    None => {
                        self.drain().await;
                        break;
                    }
                },

                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile().await {
                        tracing::error!(error = %e, "Reconciliation pass failed");
                    }
                }
            }
        }

        tracing::info!(
            unwritten = self.inflight.len(),
            unappended = self.failed_appends.len(),
            "Store actor stopped"
        );
    }

    /// Handle a single message
    async fn handle_message(&mut self, msg: StoreMessage) {
        match msg {
            StoreMessage::Upsert { account, seq } => {
                // A newer snapshot has its own message, or was already written
                if self.inflight.is_current(&account.id, seq) {
                    self.write(account, seq).await;
                }
            }

            StoreMessage::AppendMutation { tx } => {
                self.append(tx).await;
            }

            StoreMessage::Sync { response } => {
                let _ = response.send(());
            }

            StoreMessage::Reconcile { response } => {
                let result = self.reconcile().await;
                let _ = response.send(result);
            }

            StoreMessage::Shutdown { response } => {
                // Handled in main loop
                let _ = response.send(());
            }
        }
    }

    /// Handle what is already queued, then give every failed write one more try
    async fn drain(&mut self) {
        while let Ok(msg) = self.mailbox.try_recv() {
            self.handle_message(msg).await;
        }
        self.retry_failed().await;
    }

    async fn write(&self, account: Account, seq: u64) -> bool {
        match self.backend.upsert_account(&account).await {
            Ok(()) => {
                self.inflight.complete(&account.id, seq);
                true
            }
            Err(e) => {
                self.metrics.write_failures.inc();
                tracing::warn!(
                    account_id = %account.id,
                    error = %e,
                    "Account write failed, retrying on next pass"
                );
                false
            }
        }
    }

    async fn append(&mut self, tx: NewTransaction) {
        match self.backend.append_mutation(&tx).await {
            Ok(id) => {
                tracing::debug!(id, account_id = %tx.account_id, kind = %tx.kind, "Mutation appended");
            }
            Err(e) if e.is_transient() => {
                self.metrics.write_failures.inc();
                tracing::warn!(
                    account_id = %tx.account_id,
                    error = %e,
                    "Mutation append failed, retrying on next pass"
                );
                self.failed_appends.push(tx);
            }
            Err(e) => {
                tracing::error!(account_id = %tx.account_id, error = %e, "Mutation dropped");
            }
        }
    }

    async fn retry_failed(&mut self) -> usize {
        let mut rewritten = 0;
        for (seq, account) in self.inflight.snapshot() {
            if self.write(account, seq).await {
                rewritten += 1;
            }
        }

        for tx in std::mem::take(&mut self.failed_appends) {
            self.append(tx).await;
        }

        rewritten
    }

    /// One reconciliation pass
    async fn reconcile(&mut self) -> Result<ReconcileReport> {
        self.metrics.reconcile_runs.inc();

        let mut report = ReconcileReport {
            expired: self.cache.purge_expired(),
            ..Default::default()
        };
        report.rewritten = self.retry_failed().await;
        self.metrics.resident_accounts.set(self.cache.len() as i64);

        if !self.backend.supports_mutation_log() {
            return Ok(report);
        }

        let pending = self.backend.unresolved_mutations().await?;
        report.scanned = pending.len();

        let mut touched = BTreeSet::new();
        for tx in pending {
            if !self.cache.contains(&tx.account_id) {
                report.deferred += 1;
                continue;
            }

            // Marked before applying: a failed mark leaves the balance untouched
            if let Err(e) = self.backend.mark_processed(tx.id).await {
                report.failed += 1;
                tracing::warn!(id = tx.id, error = %e, "Could not mark mutation processed");
                continue;
            }

            if self.cache.update(&tx.account_id, |account| tx.apply_to(account)).is_some() {
                touched.insert(tx.account_id);
            } else {
                // Evicted while marking
                self.apply_outside_cache(&tx).await;
            }

            report.applied += 1;
            self.metrics.mutations_reconciled.inc();
        }

        for id in touched {
            if let Some(account) = self.cache.peek(&id) {
                let seq = self.inflight.stage(account.clone());
                self.write(account, seq).await;
            }
        }

        if report.scanned > 0 {
            tracing::debug!(?report, "Reconciliation pass");
        }

        Ok(report)
    }

    /// Apply a marked mutation to the staged or stored record and write it
    async fn apply_outside_cache(&self, tx: &PendingTransaction) {
        let base = match self.inflight.get(&tx.account_id) {
            Some(account) => Ok(Some(account)),
            None => self.backend.read_account(&tx.account_id).await,
        };

        match base {
            Ok(Some(mut account)) => {
                tx.apply_to(&mut account);
                let seq = self.inflight.stage(account.clone());
                self.write(account, seq).await;
            }
            Ok(None) => {
                tracing::error!(id = tx.id, account_id = %tx.account_id, "Processed mutation has no account record");
            }
            Err(e) => {
                tracing::error!(id = tx.id, account_id = %tx.account_id, error = %e, "Processed mutation could not be applied");
            }
        }
    }
}

/// Handle for sending messages to the actor
#[derive(Clone)]
pub struct StoreHandle {
    sender: mpsc::UnboundedSender<StoreMessage>,
    inflight: Arc<InflightWrites>,
    metrics: Metrics,
}

impl StoreHandle {
    fn send(&self, msg: StoreMessage) -> Result<()> {
        self.sender
            .send(msg)
            .map_err(|_| Error::Concurrency("Store actor mailbox closed".to_string()))
    }

    /// Stage a snapshot and enqueue its upsert
    pub fn save(&self, account: Account) -> Result<()> {
        let seq = self.inflight.stage(account.clone());
        self.send(StoreMessage::Upsert { account, seq })
    }

    /// Enqueue a mutation record
    pub fn append_mutation(&self, tx: NewTransaction) -> Result<()> {
        self.send(StoreMessage::AppendMutation { tx })
    }

    /// Snapshot staged for write-back but not yet persisted
    pub fn staged(&self, id: &AccountId) -> Option<Account> {
        self.inflight.get(id)
    }

    /// Number of snapshots not yet persisted
    pub fn unwritten(&self) -> usize {
        self.inflight.len()
    }

    /// Wait until every earlier message was handled
    pub async fn sync(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(StoreMessage::Sync { response: tx })?;
        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }

    /// Run a reconciliation pass now
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let (tx, rx) = oneshot::channel();
        self.send(StoreMessage::Reconcile { response: tx })?;
        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Ask the actor to finish queued work and stop
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(StoreMessage::Shutdown { response: tx })?;
        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }
}

impl EvictionListener for StoreHandle {
    fn on_evict(&self, eviction: Eviction) {
        self.metrics.evictions.inc();
        let account_id = eviction.account.id;
        if let Err(e) = self.save(eviction.account) {
            // Still staged, so reads keep seeing it
            tracing::error!(%account_id, cause = %eviction.cause, error = %e, "Eviction write-back not queued");
        }
    }
}

/// Spawn the store actor together with the cache that feeds it
pub fn spawn_store_actor(
    backend: Arc<dyn Backend>,
    cache_config: &CacheConfig,
    interval: Duration,
    metrics: Metrics,
) -> (StoreHandle, Arc<AccountCache>, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let inflight = Arc::new(InflightWrites::default());
    let handle = StoreHandle {
        sender: tx,
        inflight: inflight.clone(),
        metrics: metrics.clone(),
    };

    let cache = Arc::new(AccountCache::new(cache_config, Arc::new(handle.clone())));
    let actor = StoreActor::new(backend, cache.clone(), inflight, rx, interval, metrics);

    let join = tokio::spawn(async move {
        actor.run().await;
    });

    (handle, cache, join)
}
