//! Resolution of identities to live entities

use crate::types::AccountId;
use async_trait::async_trait;
use dashmap::DashMap;

/// Looks up the display name of a live identity.
///
/// Accounts are only created for identities that resolve; an identity with
/// no stored record that fails to resolve yields `AccountNotFound`.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Display name, or `None` when the identity is not live
    async fn resolve(&self, id: &AccountId) -> Option<String>;
}

/// In-memory directory of connected identities
#[derive(Debug, Default)]
pub struct SessionDirectory {
    live: DashMap<AccountId, String>,
}

impl SessionDirectory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connected identity
    pub fn join(&self, id: AccountId, name: impl Into<String>) {
        self.live.insert(id, name.into());
    }

    /// Forget an identity
    pub fn leave(&self, id: &AccountId) {
        self.live.remove(id);
    }

    /// Whether `id` is registered
    pub fn is_live(&self, id: &AccountId) -> bool {
        self.live.contains_key(id)
    }

    /// Registered identities
    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// No registered identities
    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

#[async_trait]
impl IdentityResolver for SessionDirectory {
    async fn resolve(&self, id: &AccountId) -> Option<String> {
        self.live.get(id).map(|name| name.value().clone())
    }
}
