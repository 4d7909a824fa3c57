use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Executor, PgPool, Postgres, Row};

use crate::billing::error::{LedgerError, LedgerResult};
use crate::billing::models::{
    Activation, ActivationRequest, Consumption, Grant, GrantStatus, NewAccount, NewGrant,
    NewPayment, PaymentRecord, PaymentStatus, UserAccount,
};
use crate::billing::store::LedgerStore;

const GRANT_COLUMNS: &str = "id, user_id, tariff_code, unlimited, checks_limit, checks_remaining, \
     purchased_at, expires_at, transaction_id, status";

/// key: ledger-store-postgres -> sqlx-backed ledger
///
/// `transaction_id` is unique on payments and grants; activation relies on
/// `ON CONFLICT DO NOTHING` inside the same transaction as the grant insert, and
/// consumption serializes per user by locking the account row.
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LedgerStore for PgLedgerStore {
    async fn ensure_account(&self, account: NewAccount) -> LedgerResult<UserAccount> {
        let mut tx = self.pool.begin().await?;
        insert_account_if_absent(&mut *tx, &account).await?;
        let stored = fetch_account(&mut *tx, account.user_id)
            .await?
            .ok_or_else(|| {
                LedgerError::StorageUnavailable(format!(
                    "account {} missing after upsert",
                    account.user_id
                ))
            })?;
        tx.commit().await?;
        Ok(stored)
    }

    async fn find_account(&self, user_id: i64) -> LedgerResult<Option<UserAccount>> {
        Ok(fetch_account(&self.pool, user_id).await?)
    }

    async fn activate(&self, request: ActivationRequest) -> LedgerResult<Activation> {
        let mut tx = self.pool.begin().await?;
        insert_account_if_absent(&mut *tx, &request.account).await?;

        let inserted = insert_payment_if_absent(&mut *tx, &request.payment).await?;
        if !inserted {
            tx.rollback().await?;
            let existing = fetch_grant_by_transaction(&self.pool, &request.payment.transaction_id)
                .await?
                .ok_or_else(|| {
                    LedgerError::StorageUnavailable(format!(
                        "payment {} has no grant",
                        request.payment.transaction_id
                    ))
                })?;
            return Ok(Activation {
                grant: existing,
                created: false,
            });
        }

        let grant = insert_grant(&mut *tx, &request.grant).await?;
        tx.commit().await?;

        Ok(Activation {
            grant,
            created: true,
        })
    }

    async fn consume(&self, user_id: i64, now: DateTime<Utc>) -> LedgerResult<Consumption> {
        let mut tx = self.pool.begin().await?;

        let locked: Option<i64> = sqlx::query_scalar(
            "SELECT user_id FROM ledger_accounts WHERE user_id = $1 FOR UPDATE",
        )
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;
        if locked.is_none() {
            tx.rollback().await?;
            return Err(LedgerError::NoEntitlement { user_id });
        }

        observe_grants(&mut *tx, user_id, now).await?;

        if let Some(grant) = fetch_active_grant(&mut *tx, user_id).await? {
            let row = sqlx::query(&format!(
                r#"
                UPDATE ledger_grants
                SET checks_remaining = checks_remaining - 1,
                    status = CASE WHEN checks_remaining - 1 <= 0 THEN 'exhausted' ELSE status END
                WHERE id = $1
                RETURNING {GRANT_COLUMNS}
                "#
            ))
            .bind(grant.id)
            .fetch_one(&mut *tx)
            .await?;
            let grant = map_grant_row(&row)?;
            tx.commit().await?;
            return Ok(Consumption::Grant { grant });
        }

        let remaining: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE ledger_accounts
            SET free_checks_remaining = free_checks_remaining - 1,
                updated_at = $2
            WHERE user_id = $1 AND free_checks_remaining > 0
            RETURNING free_checks_remaining
            "#,
        )
        .bind(user_id)
        .bind(now)
        .fetch_optional(&mut *tx)
        .await?;

        match remaining {
            Some(remaining) => {
                tx.commit().await?;
                Ok(Consumption::FreeAllotment { user_id, remaining })
            }
            None => {
                // expiry/exhaustion transitions observed above still stand
                tx.commit().await?;
                Err(LedgerError::NoEntitlement { user_id })
            }
        }
    }

    async fn active_grant(&self, user_id: i64, now: DateTime<Utc>) -> LedgerResult<Option<Grant>> {
        let mut tx = self.pool.begin().await?;
        observe_grants(&mut *tx, user_id, now).await?;
        let grant = fetch_active_grant(&mut *tx, user_id).await?;
        tx.commit().await?;
        Ok(grant)
    }

    async fn list_grants(&self, user_id: i64, now: DateTime<Utc>) -> LedgerResult<Vec<Grant>> {
        let mut tx = self.pool.begin().await?;
        observe_grants(&mut *tx, user_id, now).await?;
        let rows = sqlx::query(&format!(
            "SELECT {GRANT_COLUMNS} FROM ledger_grants WHERE user_id = $1 ORDER BY purchased_at DESC, id DESC"
        ))
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let grants = rows
            .iter()
            .map(map_grant_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(grants)
    }

    async fn grant_by_transaction(&self, transaction_id: &str) -> LedgerResult<Option<Grant>> {
        Ok(fetch_grant_by_transaction(&self.pool, transaction_id).await?)
    }

    async fn payment_history(&self, user_id: i64, limit: i64) -> LedgerResult<Vec<PaymentRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT
                id,
                transaction_id,
                user_id,
                tariff_code,
                amount,
                currency,
                raw_payload,
                status,
                recorded_at
            FROM ledger_payments
            WHERE user_id = $1
            ORDER BY recorded_at DESC, seq DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        let records = rows
            .iter()
            .map(map_payment_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }
}

pub async fn insert_account_if_absent<'c, E>(
    executor: E,
    account: &NewAccount,
) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO ledger_accounts (
            user_id,
            display_name,
            locale,
            free_checks_remaining,
            created_at,
            updated_at
        ) VALUES ($1, $2, $3, $4, $5, $5)
        ON CONFLICT (user_id) DO NOTHING
        "#,
    )
    .bind(account.user_id)
    .bind(&account.display_name)
    .bind(&account.locale)
    .bind(account.free_checks.max(0))
    .bind(account.created_at)
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn fetch_account<'c, E>(
    executor: E,
    user_id: i64,
) -> Result<Option<UserAccount>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query_as::<_, UserAccount>(
        r#"
        SELECT user_id, display_name, locale, free_checks_remaining, created_at, updated_at
        FROM ledger_accounts
        WHERE user_id = $1
        "#,
    )
    .bind(user_id)
    .fetch_optional(executor)
    .await
}

/// Returns `false` when a payment with the same transaction id already exists.
async fn insert_payment_if_absent<'c, E>(
    executor: E,
    payment: &NewPayment,
) -> Result<bool, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let inserted: Option<String> = sqlx::query_scalar(
        r#"
        INSERT INTO ledger_payments (
            id,
            transaction_id,
            user_id,
            tariff_code,
            amount,
            currency,
            raw_payload,
            status,
            recorded_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (transaction_id) DO NOTHING
        RETURNING transaction_id
        "#,
    )
    .bind(payment.id)
    .bind(&payment.transaction_id)
    .bind(payment.user_id)
    .bind(&payment.tariff_code)
    .bind(payment.amount)
    .bind(&payment.currency)
    .bind(&payment.raw_payload)
    .bind(PaymentStatus::Completed.as_str())
    .bind(payment.recorded_at)
    .fetch_optional(executor)
    .await?;
    Ok(inserted.is_some())
}

async fn insert_grant<'c, E>(executor: E, grant: &NewGrant) -> Result<Grant, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO ledger_grants (
            user_id,
            tariff_code,
            unlimited,
            checks_limit,
            checks_remaining,
            purchased_at,
            expires_at,
            transaction_id,
            status
        ) VALUES ($1, $2, $3, $4, $4, $5, $6, $7, $8)
        RETURNING {GRANT_COLUMNS}
        "#
    ))
    .bind(grant.user_id)
    .bind(&grant.tariff_code)
    .bind(grant.unlimited)
    .bind(grant.checks_limit)
    .bind(grant.purchased_at)
    .bind(grant.expires_at)
    .bind(&grant.transaction_id)
    .bind(GrantStatus::Active.as_str())
    .fetch_one(executor)
    .await?;
    map_grant_row(&row)
}

/// Persists the lazy transitions for every active grant of the user.
async fn observe_grants<'c, E>(
    executor: E,
    user_id: i64,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE ledger_grants
        SET status = CASE
            WHEN expires_at IS NOT NULL AND expires_at < $2 THEN 'expired'
            ELSE 'exhausted'
        END
        WHERE user_id = $1
          AND status = 'active'
          AND ((expires_at IS NOT NULL AND expires_at < $2) OR checks_remaining <= 0)
        "#,
    )
    .bind(user_id)
    .bind(now)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

async fn fetch_active_grant<'c, E>(executor: E, user_id: i64) -> Result<Option<Grant>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        r#"
        SELECT {GRANT_COLUMNS}
        FROM ledger_grants
        WHERE user_id = $1 AND status = 'active' AND checks_remaining > 0
        ORDER BY purchased_at DESC, id DESC
        LIMIT 1
        "#
    ))
    .bind(user_id)
    .fetch_optional(executor)
    .await?;
    row.as_ref().map(map_grant_row).transpose()
}

async fn fetch_grant_by_transaction<'c, E>(
    executor: E,
    transaction_id: &str,
) -> Result<Option<Grant>, sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query(&format!(
        "SELECT {GRANT_COLUMNS} FROM ledger_grants WHERE transaction_id = $1"
    ))
    .bind(transaction_id)
    .fetch_optional(executor)
    .await?;
    row.as_ref().map(map_grant_row).transpose()
}

fn map_grant_row(row: &PgRow) -> Result<Grant, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<GrantStatus>()
        .map_err(|err| sqlx::Error::Decode(err.into()))?;
    Ok(Grant {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        tariff_code: row.try_get("tariff_code")?,
        unlimited: row.try_get("unlimited")?,
        checks_limit: row.try_get("checks_limit")?,
        checks_remaining: row.try_get("checks_remaining")?,
        purchased_at: row.try_get("purchased_at")?,
        expires_at: row.try_get("expires_at")?,
        transaction_id: row.try_get("transaction_id")?,
        status,
    })
}

fn map_payment_row(row: &PgRow) -> Result<PaymentRecord, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<PaymentStatus>()
        .map_err(|err| sqlx::Error::Decode(err.into()))?;
    Ok(PaymentRecord {
        id: row.try_get("id")?,
        transaction_id: row.try_get("transaction_id")?,
        user_id: row.try_get("user_id")?,
        tariff_code: row.try_get("tariff_code")?,
        amount: row.try_get("amount")?,
        currency: row.try_get("currency")?,
        raw_payload: row.try_get("raw_payload")?,
        status,
        recorded_at: row.try_get("recorded_at")?,
    })
}
