use once_cell::sync::Lazy;
use std::fs;
use std::time::Duration;

use crate::billing::{CatalogError, LedgerSettings, SyncRetryPolicy, TariffCatalog};

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_string(name).and_then(|value| value.parse::<T>().ok())
}

/// PostgreSQL connection string. When unset the service keeps the ledger in memory.
pub static DATABASE_URL: Lazy<Option<String>> = Lazy::new(|| env_string("DATABASE_URL"));

/// Maximum pool size. Defaults to `5`.
pub static DATABASE_MAX_CONNECTIONS: Lazy<u32> =
    Lazy::new(|| env_parsed("DATABASE_MAX_CONNECTIONS").unwrap_or(5));

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `3000`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// When set to a truthy value, allows the application to continue running even if database
/// migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// key: ledger-config -> free allotment for first contact
pub static FREE_CHECKS_DEFAULT: Lazy<i64> = Lazy::new(|| {
    env_parsed::<i64>("FREE_CHECKS_DEFAULT")
        .filter(|value| *value >= 0)
        .unwrap_or(3)
});

pub static STORAGE_TIMEOUT_MS: Lazy<u64> = Lazy::new(|| {
    env_parsed::<u64>("STORAGE_TIMEOUT_MS")
        .filter(|value| *value > 0)
        .unwrap_or(5_000)
});

pub static HISTORY_LIMIT_MAX: Lazy<i64> = Lazy::new(|| {
    env_parsed::<i64>("HISTORY_LIMIT_MAX")
        .filter(|value| *value > 0)
        .unwrap_or(100)
});

/// Path to a JSON tariff catalog. Takes precedence over `TARIFF_CATALOG_JSON`.
pub static TARIFF_CATALOG_PATH: Lazy<Option<String>> =
    Lazy::new(|| env_string("TARIFF_CATALOG_PATH"));

/// Inline JSON tariff catalog.
pub static TARIFF_CATALOG_JSON: Lazy<Option<String>> =
    Lazy::new(|| env_string("TARIFF_CATALOG_JSON"));

/// Bot token used for activation messages. Without it notifications are only logged.
pub static TELEGRAM_BOT_TOKEN: Lazy<Option<String>> =
    Lazy::new(|| env_string("TELEGRAM_BOT_TOKEN"));

pub static TELEGRAM_API_BASE: Lazy<String> = Lazy::new(|| {
    env_string("TELEGRAM_API_BASE").unwrap_or_else(|| "https://api.telegram.org".to_string())
});

/// Base url of the consumer system that mirrors new entitlements. Sync is off when unset.
pub static SYNC_API_URL: Lazy<Option<String>> = Lazy::new(|| env_string("SYNC_API_URL"));

pub static SYNC_MAX_ATTEMPTS: Lazy<u32> = Lazy::new(|| {
    env_parsed::<u32>("SYNC_MAX_ATTEMPTS")
        .filter(|value| *value > 0)
        .unwrap_or(3)
});

pub static SYNC_RETRY_BASE_MS: Lazy<u64> =
    Lazy::new(|| env_parsed("SYNC_RETRY_BASE_MS").unwrap_or(500));

pub static DISPATCH_QUEUE_CAPACITY: Lazy<usize> = Lazy::new(|| {
    env_parsed::<usize>("DISPATCH_QUEUE_CAPACITY")
        .filter(|value| *value > 0)
        .unwrap_or(64)
});

pub fn ledger_settings() -> LedgerSettings {
    LedgerSettings {
        default_free_checks: *FREE_CHECKS_DEFAULT,
        storage_timeout: Duration::from_millis(*STORAGE_TIMEOUT_MS),
        history_limit_max: *HISTORY_LIMIT_MAX,
    }
}

pub fn sync_retry_policy() -> SyncRetryPolicy {
    SyncRetryPolicy {
        max_attempts: *SYNC_MAX_ATTEMPTS,
        base_delay: Duration::from_millis(*SYNC_RETRY_BASE_MS),
    }
}

/// Loads the tariff catalog from `TARIFF_CATALOG_PATH`, then `TARIFF_CATALOG_JSON`, falling
/// back to the built-in plans.
pub fn load_catalog() -> Result<TariffCatalog, CatalogError> {
    catalog_from_sources(
        TARIFF_CATALOG_PATH.as_deref(),
        TARIFF_CATALOG_JSON.as_deref(),
    )
}

pub fn catalog_from_sources(
    path: Option<&str>,
    inline: Option<&str>,
) -> Result<TariffCatalog, CatalogError> {
    if let Some(path) = path {
        let raw = fs::read_to_string(path)
            .map_err(|err| CatalogError::Parse(format!("failed to read {path}: {err}")))?;
        return TariffCatalog::from_json(&raw);
    }
    if let Some(raw) = inline {
        return TariffCatalog::from_json(raw);
    }
    Ok(TariffCatalog::builtin())
}
