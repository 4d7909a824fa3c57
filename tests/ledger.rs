use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use checks_ledger::billing::models::{ActivationRequest, NewAccount};
use checks_ledger::billing::{
    Activation, Consumption, EntitlementLedger, Grant, GrantStatus, LedgerError, LedgerResult,
    LedgerSettings, LedgerStore, MemoryLedgerStore, PaymentActivation, PaymentRecord,
    TariffCatalog, UserAccount, UNLIMITED_CHECKS,
};
use futures_util::future::join_all;
use serde_json::json;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
}

fn ledger_with(free_checks: i64) -> (Arc<EntitlementLedger>, Arc<MemoryLedgerStore>) {
    let store = Arc::new(MemoryLedgerStore::new());
    let settings = LedgerSettings {
        default_free_checks: free_checks,
        ..LedgerSettings::default()
    };
    let ledger = EntitlementLedger::new(
        store.clone(),
        Arc::new(TariffCatalog::builtin()),
        settings,
    );
    (Arc::new(ledger), store)
}

fn payment(user_id: i64, tariff: &str, tx: &str) -> PaymentActivation {
    PaymentActivation {
        user_id,
        tariff_code: tariff.to_string(),
        transaction_id: tx.to_string(),
        amount: 1,
        currency: "XTR".to_string(),
        raw_payload: json!({ "telegram_payment_charge_id": tx }),
        display_name: Some("Tester".to_string()),
        locale: Some("en".to_string()),
    }
}

// key: ledger-tests -> scenario A
#[tokio::test]
async fn first_payment_creates_account_and_grant() {
    let (ledger, _) = ledger_with(3);

    let activation = ledger
        .record_payment_and_activate(payment(1, "LITE", "tx1"), t0())
        .await
        .unwrap();

    assert!(activation.created);
    let grant = activation.grant;
    assert_eq!(grant.checks_limit, 10);
    assert_eq!(grant.checks_remaining, 10);
    assert_eq!(grant.expires_at, None);
    assert_eq!(grant.status, GrantStatus::Active);
    assert!(!grant.unlimited);

    let account = ledger.find_account(1).await.unwrap().expect("account created");
    assert_eq!(account.free_checks_remaining, 3);
    assert_eq!(account.display_name.as_deref(), Some("Tester"));
}

// key: ledger-tests -> scenario B
#[tokio::test]
async fn redelivered_transaction_returns_existing_grant() {
    let (ledger, _) = ledger_with(3);
    let first = ledger
        .record_payment_and_activate(payment(1, "LITE", "tx1"), t0())
        .await
        .unwrap();
    let second = ledger
        .record_payment_and_activate(
            payment(1, "LITE", "tx1"),
            t0() + ChronoDuration::minutes(5),
        )
        .await
        .unwrap();

    assert!(!second.created);
    assert_eq!(second.grant, first.grant);

    let grants = ledger.list_grants(1, t0()).await.unwrap();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0].checks_remaining, 10);
    assert_eq!(ledger.list_payment_history(1, 20).await.unwrap().len(), 1);
}

#[tokio::test]
async fn concurrent_duplicates_create_one_grant() {
    let (ledger, _) = ledger_with(3);

    let deliveries = (0..8).map(|_| {
        let ledger = ledger.clone();
        async move {
            ledger
                .record_payment_and_activate(payment(4, "LITE", "tx-race"), t0())
                .await
        }
    });
    let results: Vec<Activation> = join_all(deliveries)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(results.iter().filter(|a| a.created).count(), 1);
    let grant_id = results[0].grant.id;
    assert!(results.iter().all(|a| a.grant.id == grant_id));
    assert_eq!(ledger.list_grants(4, t0()).await.unwrap().len(), 1);
}

// key: ledger-tests -> scenario C
#[tokio::test]
async fn timed_grant_expires_strictly_after_window() {
    let (ledger, _) = ledger_with(3);
    let activation = ledger
        .record_payment_and_activate(payment(2, "MAX", "tx-max"), t0())
        .await
        .unwrap();
    assert!(activation.grant.unlimited);
    assert_eq!(activation.grant.checks_limit, UNLIMITED_CHECKS);

    let active = ledger
        .get_active_grant(2, t0() + ChronoDuration::seconds(100))
        .await
        .unwrap();
    assert_eq!(active.map(|g| g.transaction_id), Some("tx-max".to_string()));

    let at_boundary = ledger
        .get_active_grant(2, t0() + ChronoDuration::seconds(172_800))
        .await
        .unwrap();
    assert!(at_boundary.is_some());

    let expired = ledger
        .get_active_grant(2, t0() + ChronoDuration::seconds(172_801))
        .await
        .unwrap();
    assert!(expired.is_none());

    let grants = ledger.list_grants(2, t0()).await.unwrap();
    assert_eq!(grants[0].status, GrantStatus::Expired);

    // non-active grants stay that way even when observed at an earlier instant
    let earlier = ledger.get_active_grant(2, t0()).await.unwrap();
    assert!(earlier.is_none());
}

// key: ledger-tests -> scenario D
#[tokio::test]
async fn unknown_tariff_is_rejected_without_mutation() {
    let (ledger, _) = ledger_with(3);

    let err = ledger
        .record_payment_and_activate(payment(3, "UNKNOWN", "tx-unknown"), t0())
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::UnknownTariff(ref code) if code == "UNKNOWN"));
    assert!(err.is_rejection());
    assert!(ledger.find_account(3).await.unwrap().is_none());
    assert!(ledger.list_payment_history(3, 20).await.unwrap().is_empty());
    assert!(ledger
        .grant_by_transaction("tx-unknown")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn blank_transaction_id_is_rejected() {
    let (ledger, _) = ledger_with(3);
    let err = ledger
        .record_payment_and_activate(payment(3, "LITE", "   "), t0())
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::InvalidPayload(_)));
    assert!(ledger.find_account(3).await.unwrap().is_none());
}

// key: ledger-tests -> scenario E
#[tokio::test]
async fn concurrent_consumption_never_overdraws() {
    let (ledger, _) = ledger_with(0);
    ledger
        .record_payment_and_activate(payment(5, "LITE", "tx-lite"), t0())
        .await
        .unwrap();

    let attempts = (0..11).map(|_| {
        let ledger = ledger.clone();
        async move { ledger.consume_check(5, t0()).await }
    });
    let results = join_all(attempts).await;

    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 10);
    let failures: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
    assert_eq!(failures.len(), 1);
    assert!(matches!(failures[0], LedgerError::NoEntitlement { user_id: 5 }));

    let grant = ledger
        .grant_by_transaction("tx-lite")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(grant.checks_remaining, 0);
    assert_eq!(grant.status, GrantStatus::Exhausted);
}

#[tokio::test]
async fn consumption_falls_back_to_free_allotment() {
    let (ledger, _) = ledger_with(2);
    ledger.ensure_account(6, None, None, t0()).await.unwrap();

    let first = ledger.consume_check(6, t0()).await.unwrap();
    assert_eq!(
        first,
        Consumption::FreeAllotment {
            user_id: 6,
            remaining: 1
        }
    );
    ledger.consume_check(6, t0()).await.unwrap();
    let err = ledger.consume_check(6, t0()).await.unwrap_err();
    assert!(matches!(err, LedgerError::NoEntitlement { user_id: 6 }));

    let account = ledger.find_account(6).await.unwrap().unwrap();
    assert_eq!(account.free_checks_remaining, 0);
}

#[tokio::test]
async fn grants_are_consumed_before_free_checks() {
    let (ledger, _) = ledger_with(3);
    ledger
        .record_payment_and_activate(payment(7, "LITE", "tx-7"), t0())
        .await
        .unwrap();

    let consumption = ledger.consume_check(7, t0()).await.unwrap();
    assert!(matches!(consumption, Consumption::Grant { ref grant } if grant.checks_remaining == 9));
    assert_eq!(consumption.remaining(), 9);

    let account = ledger.find_account(7).await.unwrap().unwrap();
    assert_eq!(account.free_checks_remaining, 3);
}

#[tokio::test]
async fn consume_for_unknown_user_has_no_entitlement() {
    let (ledger, _) = ledger_with(3);
    let err = ledger.consume_check(404, t0()).await.unwrap_err();
    assert!(matches!(err, LedgerError::NoEntitlement { user_id: 404 }));
}

#[tokio::test]
async fn expired_newest_grant_falls_back_to_older_one() {
    let (ledger, _) = ledger_with(0);
    ledger
        .record_payment_and_activate(payment(8, "LITE", "tx-old"), t0())
        .await
        .unwrap();
    ledger
        .record_payment_and_activate(
            payment(8, "MAX", "tx-new"),
            t0() + ChronoDuration::hours(1),
        )
        .await
        .unwrap();

    let during = ledger
        .consume_check(8, t0() + ChronoDuration::hours(2))
        .await
        .unwrap();
    assert!(matches!(during, Consumption::Grant { ref grant } if grant.transaction_id == "tx-new"));

    let after = ledger
        .consume_check(8, t0() + ChronoDuration::days(3))
        .await
        .unwrap();
    match after {
        Consumption::Grant { grant } => {
            assert_eq!(grant.transaction_id, "tx-old");
            assert_eq!(grant.checks_remaining, 9);
        }
        other => panic!("unexpected consumption {other:?}"),
    }
}

#[tokio::test]
async fn equal_purchase_times_pick_highest_grant_id() {
    let (ledger, _) = ledger_with(0);
    let first = ledger
        .record_payment_and_activate(payment(9, "LITE", "tx-a"), t0())
        .await
        .unwrap();
    let second = ledger
        .record_payment_and_activate(payment(9, "LITE", "tx-b"), t0())
        .await
        .unwrap();
    assert!(second.grant.id > first.grant.id);

    let active = ledger.get_active_grant(9, t0()).await.unwrap().unwrap();
    assert_eq!(active.id, second.grant.id);
}

#[tokio::test]
async fn ensure_account_never_resets_balances() {
    let (ledger, _) = ledger_with(3);
    ledger
        .ensure_account(10, Some("First".to_string()), None, t0())
        .await
        .unwrap();
    ledger.consume_check(10, t0()).await.unwrap();

    let again = ledger
        .ensure_account(10, Some("Second".to_string()), None, t0())
        .await
        .unwrap();
    assert_eq!(again.free_checks_remaining, 2);
    assert_eq!(again.display_name.as_deref(), Some("First"));
}

#[tokio::test]
async fn payment_history_is_newest_first_and_limited() {
    let (ledger, _) = ledger_with(3);
    for (index, tx) in ["tx-1", "tx-2", "tx-3"].iter().enumerate() {
        ledger
            .record_payment_and_activate(
                payment(11, "LITE", tx),
                t0() + ChronoDuration::minutes(index as i64),
            )
            .await
            .unwrap();
    }
    // same timestamp as tx-3; insertion order breaks the tie
    ledger
        .record_payment_and_activate(payment(11, "LITE", "tx-4"), t0() + ChronoDuration::minutes(2))
        .await
        .unwrap();

    let history = ledger.list_payment_history(11, 20).await.unwrap();
    let order: Vec<_> = history.iter().map(|p| p.transaction_id.as_str()).collect();
    assert_eq!(order, vec!["tx-4", "tx-3", "tx-2", "tx-1"]);

    let limited = ledger.list_payment_history(11, 2).await.unwrap();
    assert_eq!(limited.len(), 2);

    assert!(ledger.list_payment_history(11, 0).await.unwrap().is_empty());
    assert!(ledger.list_payment_history(11, -5).await.unwrap().is_empty());

    // limits above the configured maximum are capped
    let capped = ledger.list_payment_history(11, 10_000).await.unwrap();
    assert_eq!(capped.len(), 4);
}

#[tokio::test]
async fn payment_record_round_trips() {
    let (ledger, _) = ledger_with(3);
    ledger
        .record_payment_and_activate(payment(12, "ULTRA", "tx-ultra"), t0())
        .await
        .unwrap();

    let record: PaymentRecord = ledger
        .list_payment_history(12, 1)
        .await
        .unwrap()
        .pop()
        .unwrap();
    assert_eq!(record.tariff_code, "ULTRA");
    assert_eq!(record.amount, 1);
    assert_eq!(record.currency, "XTR");
    assert_eq!(record.recorded_at, t0());
    assert_eq!(
        record.raw_payload,
        json!({ "telegram_payment_charge_id": "tx-ultra" })
    );

    let grant = ledger
        .grant_by_transaction("tx-ultra")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        grant.expires_at,
        Some(t0() + ChronoDuration::seconds(15_552_000))
    );
}

struct StalledStore;

#[async_trait]
impl LedgerStore for StalledStore {
    async fn ensure_account(&self, _account: NewAccount) -> LedgerResult<UserAccount> {
        futures_util::future::pending().await
    }

    async fn find_account(&self, _user_id: i64) -> LedgerResult<Option<UserAccount>> {
        futures_util::future::pending().await
    }

    async fn activate(&self, _request: ActivationRequest) -> LedgerResult<Activation> {
        futures_util::future::pending().await
    }

    async fn consume(&self, _user_id: i64, _now: DateTime<Utc>) -> LedgerResult<Consumption> {
        futures_util::future::pending().await
    }

    async fn active_grant(&self, _user_id: i64, _now: DateTime<Utc>) -> LedgerResult<Option<Grant>> {
        futures_util::future::pending().await
    }

    async fn list_grants(&self, _user_id: i64, _now: DateTime<Utc>) -> LedgerResult<Vec<Grant>> {
        futures_util::future::pending().await
    }

    async fn grant_by_transaction(&self, _transaction_id: &str) -> LedgerResult<Option<Grant>> {
        futures_util::future::pending().await
    }

    async fn payment_history(&self, _user_id: i64, _limit: i64) -> LedgerResult<Vec<PaymentRecord>> {
        futures_util::future::pending().await
    }
}

#[tokio::test]
async fn stalled_storage_times_out() {
    let ledger = EntitlementLedger::new(
        Arc::new(StalledStore),
        Arc::new(TariffCatalog::builtin()),
        LedgerSettings {
            storage_timeout: Duration::from_millis(20),
            ..LedgerSettings::default()
        },
    );

    let err = ledger.consume_check(1, t0()).await.unwrap_err();
    assert!(matches!(err, LedgerError::StorageTimeout(_)));
    assert!(err.is_storage_failure());
}
