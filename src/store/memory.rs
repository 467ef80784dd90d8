//! In-process coordination store
//!
//! Same semantics as the PostgreSQL store for callers that share one process.
//! Dropping a lock connection releases its locks, like a closed socket would.

use super::{
    CoordinationStore, LockConnection, PendingTransactionRecord, TransactionStatus,
    WalletLockRecord,
};
use crate::error::CoordinatorResult;
use crate::gas::ChainGasOverride;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

type RecordKey = (String, u64, u64);

/// DashMap-backed store
#[derive(Default, Clone)]
pub struct MemoryStore {
    /// Advisory lock key -> owning connection
    locks: Arc<DashMap<i32, Uuid>>,
    wallet_locks: Arc<DashMap<(String, u64), WalletLockRecord>>,
    transactions: Arc<DashMap<RecordKey, PendingTransactionRecord>>,
    gas_overrides: Arc<DashMap<u64, ChainGasOverride>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a gas policy override for a chain
    pub fn set_gas_override(&self, chain_id: u64, gas_override: ChainGasOverride) {
        self.gas_overrides.insert(chain_id, gas_override);
    }

    /// Write a lock row directly, bypassing the holder
    pub fn set_wallet_lock(&self, record: WalletLockRecord) {
        self.wallet_locks
            .insert((record.wallet_address.clone(), record.chain_id), record);
    }

    /// Whether any connection currently holds this lock key
    pub fn is_locked(&self, key: i32) -> bool {
        self.locks.contains_key(&key)
    }

    /// All records, regardless of status
    pub fn all_transactions(&self) -> Vec<PendingTransactionRecord> {
        let mut records: Vec<_> = self.transactions.iter().map(|e| e.value().clone()).collect();
        records.sort_by_key(|r| r.nonce);
        records
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn connect_dedicated(&self) -> CoordinatorResult<Box<dyn LockConnection>> {
        Ok(Box::new(MemoryLockConnection {
            id: Uuid::new_v4(),
            locks: self.locks.clone(),
            held: HashSet::new(),
        }))
    }

    async fn get_wallet_lock(
        &self,
        wallet_address: &str,
        chain_id: u64,
    ) -> CoordinatorResult<Option<WalletLockRecord>> {
        Ok(self
            .wallet_locks
            .get(&(wallet_address.to_string(), chain_id))
            .map(|r| r.value().clone()))
    }

    async fn upsert_wallet_lock(
        &self,
        wallet_address: &str,
        chain_id: u64,
        locked_by: &str,
    ) -> CoordinatorResult<()> {
        self.set_wallet_lock(WalletLockRecord {
            wallet_address: wallet_address.to_string(),
            chain_id,
            locked_by: locked_by.to_string(),
            locked_at: Utc::now(),
        });
        Ok(())
    }

    async fn clear_wallet_lock(
        &self,
        wallet_address: &str,
        chain_id: u64,
        locked_by: Option<&str>,
    ) -> CoordinatorResult<()> {
        let key = (wallet_address.to_string(), chain_id);
        match locked_by {
            Some(holder) => {
                self.wallet_locks.remove_if(&key, |_, r| r.locked_by == holder);
            }
            None => {
                self.wallet_locks.remove(&key);
            }
        }
        Ok(())
    }

    async fn upsert_pending_transaction(
        &self,
        record: &PendingTransactionRecord,
    ) -> CoordinatorResult<()> {
        self.transactions.insert(
            (record.wallet_address.clone(), record.chain_id, record.nonce),
            record.clone(),
        );
        Ok(())
    }

    async fn get_pending_transactions(
        &self,
        wallet_address: &str,
        chain_id: u64,
    ) -> CoordinatorResult<Vec<PendingTransactionRecord>> {
        let mut records: Vec<_> = self
            .transactions
            .iter()
            .filter(|e| {
                let r = e.value();
                r.wallet_address == wallet_address
                    && r.chain_id == chain_id
                    && r.status == TransactionStatus::Pending
            })
            .map(|e| e.value().clone())
            .collect();
        records.sort_by_key(|r| r.nonce);
        Ok(records)
    }

    async fn get_transaction(
        &self,
        wallet_address: &str,
        chain_id: u64,
        nonce: u64,
    ) -> CoordinatorResult<Option<PendingTransactionRecord>> {
        Ok(self
            .transactions
            .get(&(wallet_address.to_string(), chain_id, nonce))
            .map(|r| r.value().clone()))
    }

    async fn update_transaction_status(
        &self,
        wallet_address: &str,
        chain_id: u64,
        nonce: u64,
        status: TransactionStatus,
    ) -> CoordinatorResult<()> {
        if let Some(mut record) = self
            .transactions
            .get_mut(&(wallet_address.to_string(), chain_id, nonce))
        {
            record.status = status;
            if status == TransactionStatus::Confirmed {
                record.confirmed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn confirm_transaction(&self, tx_hash: &str) -> CoordinatorResult<()> {
        for mut entry in self.transactions.iter_mut() {
            if entry.tx_hash == tx_hash {
                entry.status = TransactionStatus::Confirmed;
                entry.confirmed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn get_chain_gas_override(
        &self,
        chain_id: u64,
    ) -> CoordinatorResult<Option<ChainGasOverride>> {
        Ok(self.gas_overrides.get(&chain_id).map(|o| o.value().clone()))
    }

    async fn health_check(&self) -> CoordinatorResult<()> {
        Ok(())
    }

    async fn close(&self) {}
}

struct MemoryLockConnection {
    id: Uuid,
    locks: Arc<DashMap<i32, Uuid>>,
    held: HashSet<i32>,
}

#[async_trait]
impl LockConnection for MemoryLockConnection {
    async fn try_lock(&mut self, key: i32) -> CoordinatorResult<bool> {
        match self.locks.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(self.id);
                self.held.insert(key);
                Ok(true)
            }
            Entry::Occupied(_) => Ok(false),
        }
    }

    async fn unlock(&mut self, key: i32) -> CoordinatorResult<bool> {
        let released = self.locks.remove_if(&key, |_, owner| *owner == self.id).is_some();
        self.held.remove(&key);
        Ok(released)
    }

    async fn close(self: Box<Self>) -> CoordinatorResult<()> {
        // Drop releases anything still held
        Ok(())
    }
}

impl Drop for MemoryLockConnection {
    fn drop(&mut self) {
        for key in self.held.drain() {
            self.locks.remove_if(&key, |_, owner| *owner == self.id);
        }
    }
}
