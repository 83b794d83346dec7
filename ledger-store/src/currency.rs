//! Currency definitions and registry
//!
//! Currencies are loaded once at startup from a directory holding one TOML
//! file per currency. The file stem is the currency id; the id is never
//! stored inside the definition body. An empty directory is bootstrapped with
//! a primary `dollar` and a secondary `euro`.

use crate::error::{Error, Result};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

const DEFINITION_EXTENSION: &str = "toml";

/// A configured currency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Currency {
    /// Stable id, derived from the definition's file name
    #[serde(skip)]
    pub id: String,

    /// Default currency for commands that omit one
    pub primary: bool,

    /// Whether balances may move between accounts
    pub transferable: bool,

    /// Decimal places shown by `<amount>`
    pub decimals: u32,

    /// Balance given to new accounts
    pub default_balance: Decimal,

    /// Display symbol
    pub symbol: String,

    /// Output template (`<symbol>`, `<amount>`, `<short_amount>`, `<name>`)
    pub format: String,

    /// Name used for exactly one unit
    pub singular: String,

    /// Name used otherwise
    pub plural: String,

    /// Short-form suffixes, one per power of 1000
    pub suffixes: Vec<String>,
}

impl Default for Currency {
    fn default() -> Self {
        Self {
            id: String::new(),
            primary: false,
            transferable: true,
            decimals: 2,
            default_balance: Decimal::ZERO,
            symbol: "$".to_string(),
            format: "<symbol><short_amount> <name>".to_string(),
            singular: "Dollar".to_string(),
            plural: "Dollars".to_string(),
            suffixes: ["", "K", "M", "B", "T"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Currency {
    /// Transferable currency with a zero default balance
    pub fn new(primary: bool, decimals: u32, symbol: impl Into<String>) -> Self {
        Self {
            primary,
            decimals,
            symbol: symbol.into(),
            ..Self::default()
        }
    }

    /// Render `value` through the format template
    pub fn format(&self, value: Decimal, short_precision: u32) -> String {
        let mut out = String::with_capacity(self.format.len() + self.symbol.len() + 16);
        let mut rest = self.format.as_str();

        while let Some(pos) = rest.find('<') {
            out.push_str(&rest[..pos]);
            let tail = &rest[pos..];

            if let Some(after) = tail.strip_prefix("<symbol>") {
                out.push_str(&self.symbol);
                rest = after;
            } else if let Some(after) = tail.strip_prefix("<amount>") {
                out.push_str(&self.plain_amount(value));
                rest = after;
            } else if let Some(after) = tail.strip_prefix("<short_amount>") {
                out.push_str(&self.short_amount(value, short_precision));
                rest = after;
            } else if let Some(after) = tail.strip_prefix("<name>") {
                out.push_str(self.name_for(value));
                rest = after;
            } else {
                out.push('<');
                rest = &tail[1..];
            }
        }
        out.push_str(rest);
        out
    }

    /// Amount truncated to `decimals`, trailing zeros stripped
    pub fn plain_amount(&self, value: Decimal) -> String {
        value
            .round_dp_with_strategy(self.decimals, RoundingStrategy::ToZero)
            .normalize()
            .to_string()
    }

    /// Amount reduced by powers of 1000 with a suffix (e.g. `1.23M`)
    pub fn short_amount(&self, value: Decimal, short_precision: u32) -> String {
        let thousand = Decimal::from(1000);
        let last = self.suffixes.len().saturating_sub(1);
        let mut value = value;
        let mut index = 0;

        while value >= thousand && index < last {
            value = (value / thousand).round_dp_with_strategy(2, RoundingStrategy::ToZero);
            index += 1;
        }

        let digits = self.decimals.max(short_precision);
        let shown = value
            .round_dp_with_strategy(digits, RoundingStrategy::MidpointNearestEven)
            .normalize();
        let suffix = self.suffixes.get(index).map(String::as_str).unwrap_or("");
        format!("{}{}", shown, suffix)
    }

    fn name_for(&self, value: Decimal) -> &str {
        if value == Decimal::ONE {
            &self.singular
        } else {
            &self.plural
        }
    }
}

/// All configured currencies, keyed by id
#[derive(Debug, Clone)]
pub struct CurrencyRegistry {
    currencies: BTreeMap<String, Currency>,
    primary: String,
}

impl CurrencyRegistry {
    /// Build from already-identified currencies; exactly one must be primary
    pub fn from_currencies(currencies: Vec<Currency>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for currency in currencies {
            if currency.id.is_empty() {
                return Err(Error::Config("Currency without an id".to_string()));
            }
            map.insert(currency.id.clone(), currency);
        }

        let primaries: Vec<&String> = map
            .values()
            .filter(|c| c.primary)
            .map(|c| &c.id)
            .collect();
        let primary = match primaries.as_slice() {
            [one] => (*one).clone(),
            [] => return Err(Error::Config("No primary currency configured".to_string())),
            many => {
                return Err(Error::Config(format!(
                    "Exactly one primary currency allowed, found {}",
                    many.len()
                )))
            }
        };

        Ok(Self {
            currencies: map,
            primary,
        })
    }

    /// Built-in pair used when the definitions directory is empty
    pub fn defaults() -> Vec<Currency> {
        let mut dollar = Currency::new(true, 2, "$");
        dollar.id = "dollar".to_string();

        let mut euro = Currency::new(false, 2, "€");
        euro.id = "euro".to_string();
        euro.singular = "Euro".to_string();
        euro.plural = "Euros".to_string();

        vec![dollar, euro]
    }

    /// Load every `*.toml` definition in `dir`, bootstrapping defaults if none exist
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(DEFINITION_EXTENSION)
            {
                paths.push(path);
            }
        }
        paths.sort();

        if paths.is_empty() {
            let defaults = Self::defaults();
            for currency in &defaults {
                Self::write_definition(dir, currency)?;
            }
            tracing::info!(
                dir = %dir.display(),
                "No currency definitions found, wrote {} defaults",
                defaults.len()
            );
            return Self::from_currencies(defaults);
        }

        let mut currencies = Vec::with_capacity(paths.len());
        for path in paths {
            let id = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            let parsed = std::fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|content| {
                    toml::from_str::<Currency>(&content)
                        .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
                });
            match parsed {
                Ok(mut currency) => {
                    currency.id = id;
                    currencies.push(currency);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping unreadable currency definition");
                }
            }
        }

        let registry = Self::from_currencies(currencies)?;
        tracing::info!(
            count = registry.len(),
            primary = %registry.primary,
            "Loaded currency definitions"
        );
        Ok(registry)
    }

    fn write_definition(dir: &Path, currency: &Currency) -> Result<()> {
        let body = toml::to_string_pretty(currency)
            .map_err(|e| Error::Config(format!("Failed to encode currency: {}", e)))?;
        let path = dir.join(format!("{}.{}", currency.id, DEFINITION_EXTENSION));
        std::fs::write(path, body)?;
        Ok(())
    }

    /// Look up a currency
    pub fn get(&self, id: &str) -> Option<&Currency> {
        self.currencies.get(id)
    }

    /// Look up a currency or fail with `UnknownCurrency`
    pub fn require(&self, id: &str) -> Result<&Currency> {
        self.get(id)
            .ok_or_else(|| Error::UnknownCurrency(id.to_string()))
    }

    /// The primary currency
    pub fn primary(&self) -> &Currency {
        // Constructors guarantee the primary id is present
        &self.currencies[&self.primary]
    }

    /// Iterate in id order
    pub fn iter(&self) -> impl Iterator<Item = &Currency> {
        self.currencies.values()
    }

    /// Currency ids in order
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.currencies.keys().map(String::as_str)
    }

    /// Number of currencies
    pub fn len(&self) -> usize {
        self.currencies.len()
    }

    /// Whether no currency is configured
    pub fn is_empty(&self) -> bool {
        self.currencies.is_empty()
    }
}
