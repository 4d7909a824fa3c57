pub mod adapters;
pub mod api;
pub mod catalog;
pub mod confirmation;
pub mod dispatch;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod models;
pub mod query;
pub mod replies;
pub mod store;

pub use adapters::{
    EntitlementSync, HttpEntitlementSync, LogNotifier, NotificationSink, TelegramNotifier,
};
pub use api::{
    confirm_payment, consume_check, get_history, get_snapshot, get_subscription, list_grants,
    list_tariffs, ApiResponse, HistoryQuery, DEFAULT_HISTORY_LIMIT,
};
pub use catalog::{
    CatalogError, GrantSize, Tariff, TariffCatalog, MAX_VALIDITY_SECONDS, STARS_CURRENCY,
};
pub use confirmation::{
    ConfirmationEvent, ConfirmationReceipt, ConfirmationStage, InvoicePayload,
    PaymentConfirmationHandler,
};
pub use dispatch::{
    start_dispatch_worker, DispatchError, DispatchHandle, SideEffectJob, SyncRetryPolicy,
};
pub use error::{LedgerError, LedgerResult};
pub use ledger::{EntitlementLedger, LedgerSettings};
pub use memory::MemoryLedgerStore;
pub use models::{
    Activation, Consumption, Grant, GrantStatus, PaymentActivation, PaymentRecord, PaymentStatus,
    UserAccount, UNLIMITED_CHECKS,
};
pub use query::{
    CheckCount, EntitlementQueryService, EntitlementSnapshot, PaymentHistoryEntry,
    SubscriptionView, TariffView,
};
pub use replies::{Locale, HISTORY_REPLY_LIMIT};
pub use store::LedgerStore;
