//! One-shot import of balances from an external economy

use crate::error::Result;
use crate::types::AccountId;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Import configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Run the import on the next `migrate` call
    pub active: bool,

    /// Name of the source economy (for logs)
    pub source_id: String,

    /// Source currency -> ledger currency
    pub mappings: Vec<CurrencyMapping>,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            active: false,
            source_id: "impactor".to_string(),
            mappings: vec![CurrencyMapping {
                source: "impactor:dollars".to_string(),
                target: "dollar".to_string(),
            }],
        }
    }
}

/// Maps one source currency onto a ledger currency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrencyMapping {
    /// Currency id in the source economy
    pub source: String,
    /// Currency id in this ledger
    pub target: String,
}

/// Read side of the external economy
#[async_trait]
pub trait BalanceSource: Send + Sync {
    /// Balance held by `id` in `currency`, `None` when the source has no entry
    async fn balance(&self, id: &AccountId, currency: &str) -> Result<Option<Decimal>>;
}

/// Outcome of an import run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Identities visited
    pub accounts: usize,
    /// Balances written
    pub migrated: usize,
    /// Mappings with nothing to import
    pub skipped: usize,
    /// Mappings or identities that failed
    pub failed: usize,
}
