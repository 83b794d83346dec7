//! End-to-end tests of the ledger facade against every backend

use async_trait::async_trait;
use ledger_store::{
    storage::{Backend, FileBackend},
    AccountId, BackendKind, BalanceSource, Config, Currency, CurrencyRegistry, Error, Ledger,
    MutationOutcome, SessionDirectory, StorageConfig, TransactionKind,
};
use rust_decimal::Decimal;
use std::path::Path;
use std::sync::Arc;

const ALL_BACKENDS: [BackendKind; 3] = [
    BackendKind::File,
    BackendKind::Relational,
    BackendKind::Document,
];

const LOG_BACKENDS: [BackendKind; 2] = [BackendKind::Relational, BackendKind::Document];

fn storage_for(kind: BackendKind, dir: &Path) -> StorageConfig {
    match kind {
        BackendKind::File => StorageConfig::file(dir.join("accounts")),
        BackendKind::Relational => {
            StorageConfig::relational(format!("sqlite://{}", dir.join("ledger.db").display()))
        }
        BackendKind::Document => StorageConfig::document(dir.join("documents")),
    }
}

fn config_for(kind: BackendKind, dir: &Path) -> Config {
    let mut config = Config::default();
    config.data_dir = dir.to_path_buf();
    config.currencies_dir = dir.join("currencies");
    config.storage = storage_for(kind, dir);
    // Passes are driven with reconcile_now
    config.reconciliation.interval_ms = 3_600_000;
    config
}

async fn open(config: Config) -> (Ledger, Arc<SessionDirectory>) {
    let sessions = Arc::new(SessionDirectory::new());
    let ledger = Ledger::open(config, sessions.clone()).await.unwrap();
    (ledger, sessions)
}

fn dec(s: &str) -> Decimal {
    s.parse().unwrap()
}

#[tokio::test]
async fn test_deposit_withdraw_set_scenario() {
    for kind in ALL_BACKENDS {
        let temp_dir = tempfile::tempdir().unwrap();
        let (ledger, sessions) = open(config_for(kind, temp_dir.path())).await;

        let p1 = AccountId::random();
        sessions.join(p1, "P1");
        ledger.session_started(p1).await.unwrap();

        let outcome = ledger.deposit(p1, "dollar", dec("100")).await.unwrap();
        assert_eq!(outcome, MutationOutcome::Applied { balance: dec("100") }, "{}", kind);

        let err = ledger.withdraw(p1, "dollar", dec("150")).await.unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { .. }), "{}", kind);
        assert_eq!(ledger.balance(p1, "dollar").await.unwrap(), dec("100"));

        assert_eq!(ledger.set_balance(p1, "dollar", dec("50")).await.unwrap(), dec("50"));
        assert_eq!(ledger.balance(p1, "dollar").await.unwrap(), dec("50"));
        assert_eq!(ledger.balance(p1, "gold").await.unwrap(), Decimal::ZERO);

        ledger.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_balances_survive_restart() {
    for kind in ALL_BACKENDS {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = config_for(kind, temp_dir.path());
        let id = AccountId::random();

        {
            let (ledger, sessions) = open(config.clone()).await;
            sessions.join(id, "Steve");
            ledger.session_started(id).await.unwrap();
            ledger.deposit(id, "dollar", dec("12.34")).await.unwrap();
            ledger.deposit(id, "euro", dec("0.01")).await.unwrap();
            // No flush: shutdown writes back resident accounts
            ledger.shutdown().await.unwrap();
        }

        // Identity is offline now; the stored record must be found
        let (ledger, _sessions) = open(config).await;
        let account = ledger.get_account(id).await.unwrap();
        assert_eq!(account.name, "Steve", "{}", kind);
        assert_eq!(account.balance("dollar"), dec("12.34"), "{}", kind);
        assert_eq!(account.balance("euro"), dec("0.01"), "{}", kind);
        ledger.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_capacity_eviction_then_reload() {
    for kind in ALL_BACKENDS {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = config_for(kind, temp_dir.path());
        config.cache.max_accounts = 1;
        let (ledger, sessions) = open(config).await;

        let (a, b) = (AccountId::random(), AccountId::random());
        sessions.join(a, "a");
        sessions.join(b, "b");

        ledger.session_started(a).await.unwrap();
        ledger.deposit(a, "dollar", dec("7")).await.unwrap();

        // Loading b pushes a out; reading a right away must see the deposit
        ledger.session_started(b).await.unwrap();
        assert_eq!(ledger.balance(a, "dollar").await.unwrap(), dec("7"), "{}", kind);

        ledger.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_queued_mutations_apply_once_on_load() {
    for kind in LOG_BACKENDS {
        let temp_dir = tempfile::tempdir().unwrap();
        let (ledger, sessions) = open(config_for(kind, temp_dir.path())).await;

        let id = AccountId::random();
        sessions.join(id, "Steve");
        ledger.session_started(id).await.unwrap();
        ledger.deposit(id, "dollar", dec("10")).await.unwrap();
        ledger.session_ended(id).await;
        ledger.flush().await.unwrap();

        // Offline: recorded, not applied
        assert_eq!(
            ledger.deposit(id, "dollar", dec("5")).await.unwrap(),
            MutationOutcome::Queued
        );
        assert_eq!(
            ledger.withdraw(id, "dollar", dec("3")).await.unwrap(),
            MutationOutcome::Queued
        );
        assert_eq!(ledger.set_balance(id, "euro", dec("9")).await.unwrap(), dec("9"));

        let report = ledger.reconcile_now().await.unwrap();
        assert_eq!(report.applied, 0, "{}", kind);
        assert_eq!(report.deferred, 3, "{}", kind);

        // Loaded: the next pass applies everything
        assert_eq!(ledger.balance(id, "dollar").await.unwrap(), dec("10"));
        let report = ledger.reconcile_now().await.unwrap();
        assert_eq!(report.applied, 3, "{}", kind);
        assert_eq!(ledger.balance(id, "dollar").await.unwrap(), dec("12"), "{}", kind);
        assert_eq!(ledger.balance(id, "euro").await.unwrap(), dec("9"), "{}", kind);

        let report = ledger.reconcile_now().await.unwrap();
        assert_eq!(report.applied, 0, "{}", kind);
        assert_eq!(ledger.balance(id, "dollar").await.unwrap(), dec("12"));

        // Every record is kept for audit, all processed
        let history = ledger.mutation_history(id).await.unwrap();
        assert_eq!(history.len(), 4, "{}", kind);
        assert!(history.iter().all(|tx| tx.processed), "{}", kind);
        assert_eq!(history[2].kind, TransactionKind::Withdraw);

        ledger.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_top_balances_ranking() {
    for kind in LOG_BACKENDS {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = config_for(kind, temp_dir.path());
        config.ranking.page_size = 2;
        let (ledger, sessions) = open(config).await;

        let mut ids = Vec::new();
        for (i, value) in ["30", "10", "20", "20", "0"].iter().enumerate() {
            let id = AccountId::random();
            sessions.join(id, format!("p{}", i));
            ledger.session_started(id).await.unwrap();
            ledger.set_balance(id, "dollar", dec(value)).await.unwrap();
            ids.push((dec(value), id));
        }
        // Balance desc, identity asc
        ids.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        // No explicit flush: ranking must see queued writes
        let mut ranked = Vec::new();
        for page in 1..=3 {
            let entries = ledger.top_balances("dollar", page).await.unwrap();
            assert!(entries.len() <= 2);
            assert!(entries.iter().all(|a| a.balances.len() == 1));
            ranked.extend(entries.into_iter().map(|a| (a.balance("dollar"), a.id)));
        }
        assert_eq!(ranked, ids, "{}", kind);

        // Page 0 reads as page 1
        let zero = ledger.top_balances("dollar", 0).await.unwrap();
        let one = ledger.top_balances("dollar", 1).await.unwrap();
        assert_eq!(
            zero.iter().map(|a| a.id).collect::<Vec<_>>(),
            one.iter().map(|a| a.id).collect::<Vec<_>>()
        );

        assert!(matches!(
            ledger.top_balances("gold", 1).await,
            Err(Error::UnknownCurrency(_))
        ));

        ledger.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_file_backend_has_no_ranking() {
    let temp_dir = tempfile::tempdir().unwrap();
    let (ledger, sessions) = open(config_for(BackendKind::File, temp_dir.path())).await;
    let id = AccountId::random();
    sessions.join(id, "Steve");
    ledger.deposit(id, "dollar", dec("1")).await.unwrap();

    assert!(ledger.top_balances("dollar", 1).await.unwrap().is_empty());
    assert!(ledger.mutation_history(id).await.unwrap().is_empty());
    ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_save_or_update_replaces_resident_copy() {
    for kind in ALL_BACKENDS {
        let temp_dir = tempfile::tempdir().unwrap();
        let (ledger, sessions) = open(config_for(kind, temp_dir.path())).await;
        let id = AccountId::random();
        sessions.join(id, "Steve");

        let mut account = ledger.session_started(id).await.unwrap();
        account.set_balance("dollar", dec("99"));
        ledger.save_or_update(account).await.unwrap();

        assert_eq!(ledger.balance(id, "dollar").await.unwrap(), dec("99"), "{}", kind);
        ledger.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_switch_backend_drains_previous() {
    let temp_dir = tempfile::tempdir().unwrap();
    let (ledger, sessions) = open(config_for(BackendKind::File, temp_dir.path())).await;
    let id = AccountId::random();
    sessions.join(id, "Steve");
    ledger.deposit(id, "dollar", dec("7")).await.unwrap();

    ledger
        .switch_backend(storage_for(BackendKind::Document, temp_dir.path()))
        .await
        .unwrap();
    assert_eq!(ledger.backend_kind().await, BackendKind::Document);
    assert!(ledger.is_connected().await);

    // New store starts empty; the old one received the resident account
    assert_eq!(ledger.balance(id, "dollar").await.unwrap(), Decimal::ZERO);
    let files = FileBackend::connect(&storage_for(BackendKind::File, temp_dir.path()))
        .await
        .unwrap();
    let stored = files.read_account(&id).await.unwrap().unwrap();
    assert_eq!(stored.balance("dollar"), dec("7"));

    ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transfer_respects_transferable_flag() {
    let mut dollar = Currency::new(true, 2, "$");
    dollar.id = "dollar".into();
    let mut gems = Currency::new(false, 0, "♦");
    gems.id = "gems".into();
    gems.transferable = false;
    let currencies = Arc::new(CurrencyRegistry::from_currencies(vec![dollar, gems]).unwrap());

    let temp_dir = tempfile::tempdir().unwrap();
    let sessions = Arc::new(SessionDirectory::new());
    let ledger = Ledger::with_currencies(
        config_for(BackendKind::Relational, temp_dir.path()),
        currencies,
        sessions.clone(),
    )
    .await
    .unwrap();

    let (a, b) = (AccountId::random(), AccountId::random());
    sessions.join(a, "a");
    sessions.join(b, "b");
    ledger.session_started(a).await.unwrap();
    ledger.deposit(a, "gems", dec("5")).await.unwrap();
    ledger.deposit(a, "dollar", dec("5")).await.unwrap();

    let err = ledger.transfer(a, b, "gems", dec("1")).await.unwrap_err();
    assert!(matches!(err, Error::NotTransferable(_)));

    // Payee offline and not loaded yet: transfer loads it
    let (from, to) = ledger.transfer(a, b, "dollar", dec("2")).await.unwrap();
    assert_eq!((from, to), (dec("3"), dec("2")));

    ledger.shutdown().await.unwrap();
}

struct FixedSource;

#[async_trait]
impl BalanceSource for FixedSource {
    async fn balance(&self, id: &AccountId, currency: &str) -> ledger_store::Result<Option<Decimal>> {
        assert_eq!(currency, "impactor:dollars");
        // Even first byte: has a balance
        if id.as_uuid().as_bytes()[0] % 2 == 0 {
            Ok(Some(dec("42")))
        } else {
            Ok(None)
        }
    }
}

fn id_with_parity(even: bool) -> AccountId {
    loop {
        let id = AccountId::random();
        if (id.as_uuid().as_bytes()[0] % 2 == 0) == even {
            return id;
        }
    }
}

#[tokio::test]
async fn test_migration_imports_mapped_balances() {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = config_for(BackendKind::Document, temp_dir.path());
    config.migration.active = true;
    let (ledger, sessions) = open(config).await;

    let rich = id_with_parity(true);
    let empty = id_with_parity(false);
    let stranger = AccountId::random();
    sessions.join(rich, "rich");
    sessions.join(empty, "empty");

    let report = ledger
        .migrate(&FixedSource, &[rich, empty, stranger])
        .await
        .unwrap();
    assert_eq!(report.accounts, 3);
    assert_eq!(report.migrated, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 1);

    assert_eq!(ledger.balance(rich, "dollar").await.unwrap(), dec("42"));
    assert_eq!(ledger.balance(empty, "dollar").await.unwrap(), Decimal::ZERO);

    ledger.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_inactive_migration_is_noop() {
    let temp_dir = tempfile::tempdir().unwrap();
    let (ledger, _sessions) = open(config_for(BackendKind::File, temp_dir.path())).await;
    let report = ledger.migrate(&FixedSource, &[AccountId::random()]).await.unwrap();
    assert_eq!(report, Default::default());
    ledger.shutdown().await.unwrap();
}
