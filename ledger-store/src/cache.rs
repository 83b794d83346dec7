//! Bounded account cache with write-back eviction
//!
//! The cache owns the authoritative in-memory copy of every resident
//! [`Account`]. Entries leave the cache for one of four reasons:
//!
//! - idle longer than the configured TTL
//! - resident count above the ceiling (least recently used goes first)
//! - explicit invalidation (session end)
//! - shutdown drain
//!
//! Every removal is emitted as an [`Eviction`] to an [`EvictionListener`]
//! (the store actor's handle), which stages the account for write-back and
//! enqueues the upsert. Listeners must not block: they run on whichever
//! thread triggered the eviction, under the cache lock. Replacing a resident
//! entry in place is not an eviction.

use crate::config::CacheConfig;
use crate::types::{Account, AccountId};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Why an account left the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionCause {
    /// Idle past the TTL
    Expired,
    /// Pushed out by the size ceiling
    Capacity,
    /// Invalidated by the caller
    Explicit,
    /// Drained on shutdown or backend switch
    Shutdown,
}

impl std::fmt::Display for EvictionCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EvictionCause::Expired => "expired",
            EvictionCause::Capacity => "capacity",
            EvictionCause::Explicit => "explicit",
            EvictionCause::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// An account removed from the cache, to be written back
#[derive(Debug, Clone)]
pub struct Eviction {
    /// Account state at removal time
    pub account: Account,
    /// Removal reason
    pub cause: EvictionCause,
}

/// Receiver of eviction events
pub trait EvictionListener: Send + Sync {
    /// Called once per evicted account; must only enqueue work
    fn on_evict(&self, eviction: Eviction);
}

impl EvictionListener for mpsc::UnboundedSender<Eviction> {
    fn on_evict(&self, eviction: Eviction) {
        if let Err(e) = self.send(eviction) {
            tracing::error!(
                account_id = %e.0.account.id,
                "Eviction receiver gone, evicted account not persisted"
            );
        }
    }
}

struct CacheEntry {
    account: Account,
    last_access: Instant,
    stamp: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<AccountId, CacheEntry>,
    /// Access stamp -> id, oldest first
    order: BTreeMap<u64, AccountId>,
    clock: u64,
}

impl CacheInner {
    fn next_stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, id: &AccountId) {
        let stamp = self.next_stamp();
        if let Some(entry) = self.entries.get_mut(id) {
            self.order.remove(&entry.stamp);
            entry.stamp = stamp;
            entry.last_access = Instant::now();
            self.order.insert(stamp, *id);
        }
    }

    fn remove(&mut self, id: &AccountId) -> Option<Account> {
        let entry = self.entries.remove(id)?;
        self.order.remove(&entry.stamp);
        Some(entry.account)
    }

    fn is_expired(&self, id: &AccountId, ttl: Duration) -> bool {
        self.entries
            .get(id)
            .map(|e| e.last_access.elapsed() > ttl)
            .unwrap_or(false)
    }
}

/// Time- and size-bounded map from identity to account
pub struct AccountCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    capacity: usize,
    listener: Arc<dyn EvictionListener>,
}

impl std::fmt::Debug for AccountCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountCache")
            .field("ttl", &self.ttl)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

impl AccountCache {
    /// Create a cache reporting evictions to `listener`
    pub fn new(config: &CacheConfig, listener: Arc<dyn EvictionListener>) -> Self {
        Self::with_limits(config.ttl(), config.max_accounts, listener)
    }

    /// Create a cache with explicit limits
    pub fn with_limits(
        ttl: Duration,
        capacity: usize,
        listener: Arc<dyn EvictionListener>,
    ) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            ttl,
            capacity: capacity.max(1),
            listener,
        }
    }

    fn emit(&self, account: Account, cause: EvictionCause) {
        tracing::debug!(account_id = %account.id, %cause, "Account evicted");
        self.listener.on_evict(Eviction { account, cause });
    }

    /// Clone of a resident account, refreshing its access time
    pub fn get(&self, id: &AccountId) -> Option<Account> {
        self.update(id, |account| account.clone())
    }

    /// Clone of a resident account without refreshing its access time
    pub fn peek(&self, id: &AccountId) -> Option<Account> {
        let inner = self.inner.lock();
        if inner.is_expired(id, self.ttl) {
            return None;
        }
        inner.entries.get(id).map(|e| e.account.clone())
    }

    /// Whether `id` is resident and not expired (does not refresh access time)
    pub fn contains(&self, id: &AccountId) -> bool {
        let inner = self.inner.lock();
        inner.entries.contains_key(id) && !inner.is_expired(id, self.ttl)
    }

    /// Mutate a resident account in place, refreshing its access time.
    ///
    /// Returns `None` when the account is not resident. An expired entry is
    /// evicted instead of being handed to `f`.
    pub fn update<R>(&self, id: &AccountId, f: impl FnOnce(&mut Account) -> R) -> Option<R> {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(id) {
            return None;
        }
        if inner.is_expired(id, self.ttl) {
            if let Some(account) = inner.remove(id) {
                self.emit(account, EvictionCause::Expired);
            }
            return None;
        }
        inner.touch(id);
        inner.entries.get_mut(id).map(|entry| f(&mut entry.account))
    }

    /// Insert or replace in place; may evict the least recently used entry
    pub fn insert(&self, account: Account) {
        let mut inner = self.inner.lock();
        let id = account.id;
        let stamp = inner.next_stamp();

        if let Some(entry) = inner.entries.get_mut(&id) {
            let old = entry.stamp;
            entry.account = account;
            entry.stamp = stamp;
            entry.last_access = Instant::now();
            inner.order.remove(&old);
            inner.order.insert(stamp, id);
            return;
        }

        inner.entries.insert(
            id,
            CacheEntry {
                account,
                last_access: Instant::now(),
                stamp,
            },
        );
        inner.order.insert(stamp, id);

        while inner.entries.len() > self.capacity {
            let oldest = match inner.order.iter().next() {
                Some((_, oldest)) => *oldest,
                None => break,
            };
            if let Some(evicted) = inner.remove(&oldest) {
                self.emit(evicted, EvictionCause::Capacity);
            }
        }
    }

    /// Remove and write back one account
    pub fn invalidate(&self, id: &AccountId) -> bool {
        let removed = self.inner.lock().remove(id);
        match removed {
            Some(account) => {
                self.emit(account, EvictionCause::Explicit);
                true
            }
            None => false,
        }
    }

    /// Evict every entry idle past the TTL; returns the number evicted
    pub fn purge_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        let mut expired = Vec::new();
        // Access order matches stamp order, so stop at the first live entry
        for id in inner.order.values() {
            if inner.is_expired(id, self.ttl) {
                expired.push(*id);
            } else {
                break;
            }
        }
        for id in &expired {
            if let Some(account) = inner.remove(id) {
                self.emit(account, EvictionCause::Expired);
            }
        }
        expired.len()
    }

    /// Evict everything through the write-back path; returns the number evicted
    pub fn drain(&self) -> usize {
        let mut inner = self.inner.lock();
        let entries = std::mem::take(&mut inner.entries);
        inner.order.clear();
        let count = entries.len();
        for (_, entry) in entries {
            self.emit(entry.account, EvictionCause::Shutdown);
        }
        count
    }

    /// Resident count
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether nothing is resident
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
