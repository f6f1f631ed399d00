use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::BillingError;
use crate::quota::TenantQuota;
use crate::types::{BillingTransaction, TransactionStatus};

/// System of record for quotas and transactions
///
/// Implementations must give each method single-row atomicity: a
/// compare-and-swap either applies completely or not at all, and trace ids
/// are unique across transactions.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn load_quota(&self, tenant_id: &str) -> Result<Option<TenantQuota>, BillingError>;

    /// Create a quota row unless one exists. Returns whether it was written.
    async fn insert_quota(&self, quota: &TenantQuota) -> Result<bool, BillingError>;

    /// Replace a quota row only while its version is `expected_version`
    async fn compare_and_swap_quota(&self, quota: &TenantQuota, expected_version: u64) -> Result<bool, BillingError>;

    /// Write a snapshot produced elsewhere, only if it is newer than the row
    async fn sync_quota(&self, quota: &TenantQuota) -> Result<bool, BillingError>;

    async fn find_transaction(&self, trace_id: &str) -> Result<Option<BillingTransaction>, BillingError>;

    /// Insert a new transaction, failing with
    /// [`BillingError::DuplicateTransaction`] when the trace id is taken
    async fn insert_transaction(&self, transaction: &BillingTransaction) -> Result<(), BillingError>;

    /// Overwrite a transaction only while it is in `expected` status
    async fn update_transaction_if(
        &self,
        transaction: &BillingTransaction,
        expected: TransactionStatus,
    ) -> Result<bool, BillingError>;

    /// Remove a transaction that never took effect
    async fn rollback_transaction(&self, trace_id: &str) -> Result<bool, BillingError>;
}

#[derive(Debug, Default)]
struct Tables {
    quotas: HashMap<String, TenantQuota>,
    transactions: HashMap<String, BillingTransaction>,
}

/// In-process ledger for single-node deployments and tests
#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerStore {
    tables: Arc<Mutex<Tables>>,
    offline: Arc<AtomicBool>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`BillingError::Ledger`]
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    /// Create or replace a quota row
    pub fn upsert_quota(&self, quota: TenantQuota) {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.quotas.insert(quota.tenant_id.clone(), quota);
    }

    /// Snapshot of all transactions, oldest first
    pub fn transactions(&self) -> Vec<BillingTransaction> {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<BillingTransaction> = tables.transactions.values().cloned().collect();
        all.sort_by_key(|tx| tx.created_at);
        all
    }

    fn with_tables<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T, BillingError>) -> Result<T, BillingError> {
        if self.offline.load(Ordering::Relaxed) {
            return Err(BillingError::Ledger("ledger is offline".to_string()));
        }

        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut tables)
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn load_quota(&self, tenant_id: &str) -> Result<Option<TenantQuota>, BillingError> {
        self.with_tables(|tables| Ok(tables.quotas.get(tenant_id).cloned()))
    }

    async fn insert_quota(&self, quota: &TenantQuota) -> Result<bool, BillingError> {
        self.with_tables(|tables| {
            if tables.quotas.contains_key(&quota.tenant_id) {
                return Ok(false);
            }
            tables.quotas.insert(quota.tenant_id.clone(), quota.clone());
            Ok(true)
        })
    }

    async fn compare_and_swap_quota(&self, quota: &TenantQuota, expected_version: u64) -> Result<bool, BillingError> {
        self.with_tables(|tables| {
            let Some(current) = tables.quotas.get_mut(&quota.tenant_id) else {
                return Err(BillingError::TenantNotFound(quota.tenant_id.clone()));
            };
            if current.version != expected_version {
                return Ok(false);
            }
            *current = quota.clone();
            Ok(true)
        })
    }

    async fn sync_quota(&self, quota: &TenantQuota) -> Result<bool, BillingError> {
        self.with_tables(|tables| match tables.quotas.get_mut(&quota.tenant_id) {
            Some(current) if current.version >= quota.version => Ok(false),
            Some(current) => {
                *current = quota.clone();
                Ok(true)
            }
            None => {
                tables.quotas.insert(quota.tenant_id.clone(), quota.clone());
                Ok(true)
            }
        })
    }

    async fn find_transaction(&self, trace_id: &str) -> Result<Option<BillingTransaction>, BillingError> {
        self.with_tables(|tables| Ok(tables.transactions.get(trace_id).cloned()))
    }

    async fn insert_transaction(&self, transaction: &BillingTransaction) -> Result<(), BillingError> {
        self.with_tables(|tables| {
            if tables.transactions.contains_key(&transaction.trace_id) {
                return Err(BillingError::DuplicateTransaction(transaction.trace_id.clone()));
            }
            tables
                .transactions
                .insert(transaction.trace_id.clone(), transaction.clone());
            Ok(())
        })
    }

    async fn update_transaction_if(
        &self,
        transaction: &BillingTransaction,
        expected: TransactionStatus,
    ) -> Result<bool, BillingError> {
        self.with_tables(|tables| {
            let Some(current) = tables.transactions.get_mut(&transaction.trace_id) else {
                return Err(BillingError::TransactionNotFound(transaction.trace_id.clone()));
            };
            if current.status != expected {
                return Ok(false);
            }
            *current = transaction.clone();
            Ok(true)
        })
    }

    async fn rollback_transaction(&self, trace_id: &str) -> Result<bool, BillingError> {
        self.with_tables(|tables| Ok(tables.transactions.remove(trace_id).is_some()))
    }
}

#[cfg(test)]
mod tests {
    use jiff::Timestamp;

    use super::*;
    use crate::types::TransactionKind;

    #[tokio::test]
    async fn trace_ids_are_unique() {
        let store = MemoryLedgerStore::new();
        let tx = BillingTransaction::pending("trace-1", "t1", TransactionKind::Deduct, 10);

        store.insert_transaction(&tx).await.unwrap();
        let again = BillingTransaction::pending("trace-1", "t1", TransactionKind::Deduct, 20);
        assert!(matches!(
            store.insert_transaction(&again).await,
            Err(BillingError::DuplicateTransaction(id)) if id == "trace-1"
        ));
    }

    #[tokio::test]
    async fn cas_rejects_stale_versions() {
        let store = MemoryLedgerStore::new();
        let quota = TenantQuota::new("t1", 100, Timestamp::now());
        store.upsert_quota(quota.clone());

        let mut next = quota.clone();
        next.balance = 50;
        next.version = 1;
        assert!(store.compare_and_swap_quota(&next, 0).await.unwrap());
        assert!(!store.compare_and_swap_quota(&next, 0).await.unwrap());
        assert_eq!(store.load_quota("t1").await.unwrap().unwrap().balance, 50);
    }

    #[tokio::test]
    async fn sync_only_moves_forward() {
        let store = MemoryLedgerStore::new();
        let mut quota = TenantQuota::new("t1", 100, Timestamp::now());
        quota.version = 5;
        store.upsert_quota(quota.clone());

        let mut older = quota.clone();
        older.version = 4;
        older.balance = 0;
        assert!(!store.sync_quota(&older).await.unwrap());

        let mut newer = quota;
        newer.version = 6;
        newer.balance = 1;
        assert!(store.sync_quota(&newer).await.unwrap());
        assert_eq!(store.load_quota("t1").await.unwrap().unwrap().balance, 1);
    }

    #[tokio::test]
    async fn conditional_update_checks_status() {
        let store = MemoryLedgerStore::new();
        let mut tx = BillingTransaction::pending("trace-1", "t1", TransactionKind::Deduct, 10);
        store.insert_transaction(&tx).await.unwrap();

        tx.commit(90);
        assert!(store.update_transaction_if(&tx, TransactionStatus::Pending).await.unwrap());
        assert!(!store.update_transaction_if(&tx, TransactionStatus::Pending).await.unwrap());
    }
}
