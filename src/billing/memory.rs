use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::error::{LedgerError, LedgerResult};
use super::models::{
    select_active, Activation, ActivationRequest, Consumption, Grant, GrantStatus, NewAccount,
    PaymentRecord, PaymentStatus, UserAccount,
};
use super::store::LedgerStore;

/// key: ledger-store-memory -> in-process store for tests and local runs
///
/// A single mutex guards accounts, grants and payments, so every trait method runs as one
/// serialized unit.
#[derive(Default)]
pub struct MemoryLedgerStore {
    state: Mutex<LedgerState>,
}

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<i64, UserAccount>,
    grants: Vec<Grant>,
    payments: Vec<PaymentRecord>,
    payments_by_transaction: HashMap<String, usize>,
    next_grant_id: i64,
}

impl LedgerState {
    fn upsert_account(&mut self, account: NewAccount) -> UserAccount {
        self.accounts
            .entry(account.user_id)
            .or_insert_with(|| UserAccount {
                user_id: account.user_id,
                display_name: account.display_name,
                locale: account.locale,
                free_checks_remaining: account.free_checks.max(0),
                created_at: account.created_at,
                updated_at: account.created_at,
            })
            .clone()
    }

    fn observe_user_grants(&mut self, user_id: i64, now: DateTime<Utc>) {
        for grant in self.grants.iter_mut().filter(|g| g.user_id == user_id) {
            grant.observe(now);
        }
    }

    fn active_grant_index(&self, user_id: i64, now: DateTime<Utc>) -> Option<usize> {
        let picked = select_active(self.grants.iter().filter(|g| g.user_id == user_id), now)?;
        self.grants.iter().position(|g| g.id == picked.id)
    }
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn ensure_account(&self, account: NewAccount) -> LedgerResult<UserAccount> {
        let mut state = self.state.lock().await;
        Ok(state.upsert_account(account))
    }

    async fn find_account(&self, user_id: i64) -> LedgerResult<Option<UserAccount>> {
        let state = self.state.lock().await;
        Ok(state.accounts.get(&user_id).cloned())
    }

    async fn activate(&self, request: ActivationRequest) -> LedgerResult<Activation> {
        let mut state = self.state.lock().await;
        let ActivationRequest {
            account,
            payment,
            grant,
        } = request;

        if state
            .payments_by_transaction
            .contains_key(&payment.transaction_id)
        {
            let existing = state
                .grants
                .iter()
                .find(|g| g.transaction_id == payment.transaction_id)
                .cloned()
                .ok_or_else(|| {
                    LedgerError::StorageUnavailable(format!(
                        "payment {} has no grant",
                        payment.transaction_id
                    ))
                })?;
            return Ok(Activation {
                grant: existing,
                created: false,
            });
        }

        state.upsert_account(account);

        state.next_grant_id += 1;
        let created = Grant {
            id: state.next_grant_id,
            user_id: grant.user_id,
            tariff_code: grant.tariff_code,
            unlimited: grant.unlimited,
            checks_limit: grant.checks_limit,
            checks_remaining: grant.checks_limit,
            purchased_at: grant.purchased_at,
            expires_at: grant.expires_at,
            transaction_id: grant.transaction_id,
            status: GrantStatus::Active,
        };

        let index = state.payments.len();
        state
            .payments_by_transaction
            .insert(payment.transaction_id.clone(), index);
        state.payments.push(PaymentRecord {
            id: payment.id,
            transaction_id: payment.transaction_id,
            user_id: payment.user_id,
            tariff_code: payment.tariff_code,
            amount: payment.amount,
            currency: payment.currency,
            raw_payload: payment.raw_payload,
            status: PaymentStatus::Completed,
            recorded_at: payment.recorded_at,
        });
        state.grants.push(created.clone());

        Ok(Activation {
            grant: created,
            created: true,
        })
    }

    async fn consume(&self, user_id: i64, now: DateTime<Utc>) -> LedgerResult<Consumption> {
        let mut state = self.state.lock().await;
        state.observe_user_grants(user_id, now);

        if let Some(index) = state.active_grant_index(user_id, now) {
            let grant = &mut state.grants[index];
            grant.checks_remaining -= 1;
            grant.observe(now);
            return Ok(Consumption::Grant {
                grant: grant.clone(),
            });
        }

        match state.accounts.get_mut(&user_id) {
            Some(account) if account.free_checks_remaining > 0 => {
                account.free_checks_remaining -= 1;
                account.updated_at = now;
                Ok(Consumption::FreeAllotment {
                    user_id,
                    remaining: account.free_checks_remaining,
                })
            }
            _ => Err(LedgerError::NoEntitlement { user_id }),
        }
    }

    async fn active_grant(&self, user_id: i64, now: DateTime<Utc>) -> LedgerResult<Option<Grant>> {
        let mut state = self.state.lock().await;
        state.observe_user_grants(user_id, now);
        Ok(state
            .active_grant_index(user_id, now)
            .map(|index| state.grants[index].clone()))
    }

    async fn list_grants(&self, user_id: i64, now: DateTime<Utc>) -> LedgerResult<Vec<Grant>> {
        let mut state = self.state.lock().await;
        state.observe_user_grants(user_id, now);
        let mut grants: Vec<Grant> = state
            .grants
            .iter()
            .filter(|g| g.user_id == user_id)
            .cloned()
            .collect();
        grants.sort_by(|a, b| (b.purchased_at, b.id).cmp(&(a.purchased_at, a.id)));
        Ok(grants)
    }

    async fn grant_by_transaction(&self, transaction_id: &str) -> LedgerResult<Option<Grant>> {
        let state = self.state.lock().await;
        Ok(state
            .grants
            .iter()
            .find(|g| g.transaction_id == transaction_id)
            .cloned())
    }

    async fn payment_history(&self, user_id: i64, limit: i64) -> LedgerResult<Vec<PaymentRecord>> {
        let state = self.state.lock().await;
        let mut records: Vec<(usize, &PaymentRecord)> = state
            .payments
            .iter()
            .enumerate()
            .filter(|(_, p)| p.user_id == user_id)
            .collect();
        records.sort_by(|(ia, a), (ib, b)| (b.recorded_at, ib).cmp(&(a.recorded_at, ia)));
        Ok(records
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|(_, record)| record.clone())
            .collect())
    }
}
