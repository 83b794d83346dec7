//! Core types for the ledger
//!
//! All types are designed for:
//! - Deterministic serialization (ordered balance maps)
//! - Exact arithmetic (Decimal for money)
//! - Backend independence (no driver types leak out)

use crate::currency::CurrencyRegistry;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Ledger owner identity (a player's persistent unique id)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(Uuid);

impl AccountId {
    /// Wrap an existing UUID
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Fresh random identity
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for AccountId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl From<Uuid> for AccountId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// Per-identity balances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Owner identity
    pub id: AccountId,

    /// Display name (denormalized, may be stale)
    #[serde(default)]
    pub name: String,

    /// Currency id -> balance
    #[serde(default)]
    pub balances: BTreeMap<String, Decimal>,
}

impl Account {
    /// Empty account for a freshly resolved identity
    pub fn new(id: AccountId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            balances: BTreeMap::new(),
        }
    }

    /// Account with an existing balance map
    pub fn with_balances(
        id: AccountId,
        name: impl Into<String>,
        balances: BTreeMap<String, Decimal>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            balances,
        }
    }

    /// Balance for a currency; zero when the currency has no entry
    pub fn balance(&self, currency: &str) -> Decimal {
        self.balances.get(currency).copied().unwrap_or(Decimal::ZERO)
    }

    /// Add a signed delta to one currency and return the new balance
    pub fn apply_delta(&mut self, currency: &str, delta: Decimal) -> Decimal {
        let entry = self
            .balances
            .entry(currency.to_string())
            .or_insert(Decimal::ZERO);
        *entry += delta;
        *entry
    }

    /// Replace one currency's balance
    pub fn set_balance(&mut self, currency: &str, amount: Decimal) -> Decimal {
        self.balances.insert(currency.to_string(), amount);
        amount
    }

    /// Apply a mutation of the given kind and return the new balance
    pub fn apply(&mut self, kind: TransactionKind, currency: &str, amount: Decimal) -> Decimal {
        match kind {
            TransactionKind::Deposit => self.apply_delta(currency, amount),
            TransactionKind::Withdraw => self.apply_delta(currency, -amount),
            TransactionKind::Set => self.set_balance(currency, amount),
        }
    }

    /// Whether the balance covers `amount`
    pub fn has_enough(&self, currency: &str, amount: Decimal) -> bool {
        self.balance(currency) >= amount
    }

    /// Insert the configured default for every known currency missing here.
    ///
    /// Returns the number of entries added.
    pub fn reconcile_defaults(&mut self, currencies: &CurrencyRegistry) -> usize {
        let mut added = 0;
        for currency in currencies.iter() {
            if !self.balances.contains_key(&currency.id) {
                self.balances
                    .insert(currency.id.clone(), currency.default_balance);
                added += 1;
            }
        }
        added
    }

    /// Copy carrying only one currency (used by ranking results)
    pub fn project(&self, currency: &str) -> Self {
        let mut balances = BTreeMap::new();
        if let Some(amount) = self.balances.get(currency) {
            balances.insert(currency.to_string(), *amount);
        }
        Self {
            id: self.id,
            name: self.name.clone(),
            balances,
        }
    }
}

/// Kind of balance mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionKind {
    /// Add to the balance
    Deposit,
    /// Subtract from the balance
    Withdraw,
    /// Replace the balance
    Set,
}

impl TransactionKind {
    /// Stored representation
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "DEPOSIT",
            TransactionKind::Withdraw => "WITHDRAW",
            TransactionKind::Set => "SET",
        }
    }

    /// Parse the stored representation; unknown kinds read as deposits
    pub fn parse(s: &str) -> Self {
        match s {
            "WITHDRAW" => TransactionKind::Withdraw,
            "SET" => TransactionKind::Set,
            _ => TransactionKind::Deposit,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutation record about to be appended to the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTransaction {
    /// Target identity
    pub account_id: AccountId,
    /// Currency id
    pub currency: String,
    /// Magnitude (deposit/withdraw) or target value (set)
    pub amount: Decimal,
    /// Mutation kind
    pub kind: TransactionKind,
    /// Already applied to a resident account
    pub processed: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl NewTransaction {
    /// Build a record stamped with the current time
    pub fn new(
        account_id: AccountId,
        currency: impl Into<String>,
        amount: Decimal,
        kind: TransactionKind,
        processed: bool,
    ) -> Self {
        Self {
            account_id,
            currency: currency.into(),
            amount,
            kind,
            processed,
            created_at: Utc::now(),
        }
    }
}

/// Mutation record read back from the log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTransaction {
    /// Log sequence number (monotonic per backend)
    pub id: u64,
    /// Target identity
    pub account_id: AccountId,
    /// Currency id
    pub currency: String,
    /// Magnitude (deposit/withdraw) or target value (set)
    pub amount: Decimal,
    /// Mutation kind
    pub kind: TransactionKind,
    /// Resolved flag
    pub processed: bool,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl PendingTransaction {
    /// Promote a new record once the backend assigned it a sequence number
    pub fn from_new(id: u64, tx: NewTransaction) -> Self {
        Self {
            id,
            account_id: tx.account_id,
            currency: tx.currency,
            amount: tx.amount,
            kind: tx.kind,
            processed: tx.processed,
            created_at: tx.created_at,
        }
    }

    /// Signed effect on the balance (value itself for SET)
    pub fn signed_delta(&self) -> Decimal {
        match self.kind {
            TransactionKind::Withdraw => -self.amount,
            TransactionKind::Deposit | TransactionKind::Set => self.amount,
        }
    }

    /// Apply this record to `account` and return the new balance
    pub fn apply_to(&self, account: &mut Account) -> Decimal {
        match self.kind {
            TransactionKind::Set => account.set_balance(&self.currency, self.signed_delta()),
            TransactionKind::Deposit | TransactionKind::Withdraw => {
                account.apply_delta(&self.currency, self.signed_delta())
            }
        }
    }
}

/// Result of a deposit or withdraw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// Applied to a resident account
    Applied {
        /// Balance after the mutation
        balance: Decimal,
    },
    /// Recorded as an unresolved mutation for the reconciliation queue
    Queued,
}

impl MutationOutcome {
    /// Balance after the mutation, if it was applied synchronously
    pub fn balance(&self) -> Option<Decimal> {
        match self {
            MutationOutcome::Applied { balance } => Some(*balance),
            MutationOutcome::Queued => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::Currency;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_unknown_currency_resolves_to_zero() {
        let account = Account::new(AccountId::random(), "Steve");
        assert_eq!(account.balance("gold"), Decimal::ZERO);
    }

    #[test]
    fn test_apply_kinds() {
        let mut account = Account::new(AccountId::random(), "Steve");
        assert_eq!(
            account.apply(TransactionKind::Deposit, "dollar", dec("100.00")),
            dec("100.00")
        );
        assert_eq!(
            account.apply(TransactionKind::Withdraw, "dollar", dec("30.50")),
            dec("69.50")
        );
        assert_eq!(
            account.apply(TransactionKind::Set, "dollar", dec("5")),
            dec("5")
        );
        assert_eq!(account.balance("dollar"), dec("5"));
    }

    #[test]
    fn test_deltas_commute() {
        let id = AccountId::random();
        let mut a = Account::new(id, "a");
        let mut b = Account::new(id, "a");

        a.apply_delta("dollar", dec("10"));
        a.apply_delta("dollar", dec("-3"));
        b.apply_delta("dollar", dec("-3"));
        b.apply_delta("dollar", dec("10"));

        assert_eq!(a, b);
    }

    #[test]
    fn test_reconcile_defaults_keeps_existing() {
        let mut dollar = Currency::new(true, 2, "$");
        dollar.id = "dollar".into();
        dollar.default_balance = dec("25");
        let mut euro = Currency::new(false, 2, "€");
        euro.id = "euro".into();
        let registry = CurrencyRegistry::from_currencies(vec![dollar, euro]).unwrap();

        let mut account = Account::new(AccountId::random(), "Alex");
        account.set_balance("dollar", dec("7"));

        assert_eq!(account.reconcile_defaults(&registry), 1);
        assert_eq!(account.balance("dollar"), dec("7"));
        assert_eq!(account.balances.get("euro"), Some(&Decimal::ZERO));

        // Second run is a no-op
        assert_eq!(account.reconcile_defaults(&registry), 0);
    }

    #[test]
    fn test_pending_record_applies_signed_delta() {
        let id = AccountId::random();
        let mut account = Account::new(id, "Steve");
        account.set_balance("dollar", dec("10"));

        let record = |kind, amount: &str| {
            PendingTransaction::from_new(1, NewTransaction::new(id, "dollar", dec(amount), kind, false))
        };

        let withdraw = record(TransactionKind::Withdraw, "4");
        assert_eq!(withdraw.signed_delta(), dec("-4"));
        assert_eq!(withdraw.apply_to(&mut account), dec("6"));
        assert_eq!(record(TransactionKind::Deposit, "1.5").apply_to(&mut account), dec("7.5"));

        let set = record(TransactionKind::Set, "2");
        assert_eq!(set.signed_delta(), dec("2"));
        assert_eq!(set.apply_to(&mut account), dec("2"));
        assert_eq!(account.balance("dollar"), dec("2"));
    }

    #[test]
    fn test_transaction_kind_roundtrip_and_fallback() {
        for kind in [
            TransactionKind::Deposit,
            TransactionKind::Withdraw,
            TransactionKind::Set,
        ] {
            assert_eq!(TransactionKind::parse(kind.as_str()), kind);
        }
        assert_eq!(TransactionKind::parse("?"), TransactionKind::Deposit);
    }

    #[test]
    fn test_account_id_display_parse() {
        let id = AccountId::random();
        let parsed: AccountId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_project_keeps_single_currency() {
        let mut account = Account::new(AccountId::random(), "Alex");
        account.set_balance("dollar", dec("1"));
        account.set_balance("euro", dec("2"));

        let projected = account.project("euro");
        assert_eq!(projected.balances.len(), 1);
        assert_eq!(projected.balance("euro"), dec("2"));
    }
}
