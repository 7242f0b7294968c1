//! In-memory store.
//!
//! Backs the test suite and paper trading. A transaction takes the single
//! state mutex, works on a clone, and swaps it back on commit; dropping the
//! handle discards the clone, so rollback-on-drop matches the Postgres
//! store. Transactions are fully serialized by the mutex, which trivially
//! satisfies the per-position ordering guarantees the engine relies on.
//!
//! Deadlocks never occur here, so the store can inject synthetic ones
//! (`inject_deadlocks`) to exercise the coordinator's retry path.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{EngineError, EngineResult};
use crate::models::{
    AccountBalance, AccountBalanceEvent, Position, PositionEvent, ReconciliationLog,
    TradeExecution, TxAudit,
};
use crate::store::{EventOrder, Store, StoreTxn, TxnHandle};
use crate::types::{AccountId, EventId, IsolationLevel, PositionId, PositionStatus};

#[derive(Debug, Clone, Default)]
struct MemState {
    positions: FxHashMap<PositionId, Position>,
    executions: Vec<TradeExecution>,
    events: Vec<PositionEvent>,
    idempotency_keys: FxHashMap<String, EventId>,
    accounts: FxHashMap<AccountId, AccountBalance>,
    balance_events: Vec<AccountBalanceEvent>,
    next_event_id: EventId,
    next_balance_event_id: EventId,
}

/// In-process store; cheap to clone (shared state).
///
/// Audit logs live outside the transactional state: the coordinator writes
/// them while its transaction is still open, and they are best-effort by
/// contract anyway.
#[derive(Clone, Default)]
pub struct MemStore {
    state: Arc<Mutex<MemState>>,
    tx_log: Arc<Mutex<Vec<TxAudit>>>,
    recon_log: Arc<Mutex<Vec<ReconciliationLog>>>,
    injected_deadlocks: Arc<AtomicU32>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` `begin` calls fail with a deadlock, for
    /// coordinator retry tests
    pub fn inject_deadlocks(&self, count: u32) {
        self.injected_deadlocks.store(count, Ordering::SeqCst);
    }

    /// Transaction audit rows (test inspection)
    pub async fn tx_log(&self) -> Vec<TxAudit> {
        self.tx_log.lock().await.clone()
    }

    /// Reconciliation log rows (test inspection)
    pub async fn reconciliation_log(&self) -> Vec<ReconciliationLog> {
        self.recon_log.lock().await.clone()
    }
}

struct MemTxn {
    guard: OwnedMutexGuard<MemState>,
    work: MemState,
    savepoints: Vec<(String, MemState)>,
}

#[async_trait]
impl StoreTxn for MemTxn {
    async fn insert_position(&mut self, position: &Position) -> EngineResult<()> {
        self.work.positions.insert(position.id, position.clone());
        Ok(())
    }

    async fn position(&mut self, id: PositionId, _locked: bool) -> EngineResult<Option<Position>> {
        // The state mutex already serializes writers, so the row lock is
        // implicit here.
        Ok(self.work.positions.get(&id).cloned())
    }

    async fn update_position(&mut self, position: &Position) -> EngineResult<()> {
        if !self.work.positions.contains_key(&position.id) {
            return Err(EngineError::PositionNotFound(position.id));
        }
        self.work.positions.insert(position.id, position.clone());
        Ok(())
    }

    async fn insert_execution(&mut self, execution: &TradeExecution) -> EngineResult<()> {
        self.work.executions.push(execution.clone());
        Ok(())
    }

    async fn insert_event(&mut self, event: &PositionEvent) -> EngineResult<PositionEvent> {
        if let Some(key) = &event.idempotency_key {
            if self.work.idempotency_keys.contains_key(key) {
                return Err(EngineError::Duplicate(key.clone()));
            }
        }
        let mut persisted = event.clone();
        persisted.id = self.work.next_event_id + 1;
        self.work.next_event_id = persisted.id;
        if let Some(key) = &persisted.idempotency_key {
            self.work.idempotency_keys.insert(key.clone(), persisted.id);
        }
        self.work.events.push(persisted.clone());
        Ok(persisted)
    }

    async fn event_by_idempotency_key(
        &mut self,
        key: &str,
    ) -> EngineResult<Option<PositionEvent>> {
        let id = match self.work.idempotency_keys.get(key) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self.work.events.iter().find(|e| e.id == id).cloned())
    }

    async fn account(&mut self, id: &str, _locked: bool) -> EngineResult<Option<AccountBalance>> {
        Ok(self.work.accounts.get(id).cloned())
    }

    async fn upsert_account(&mut self, account: &AccountBalance) -> EngineResult<()> {
        self.work
            .accounts
            .insert(account.account_id.clone(), account.clone());
        Ok(())
    }

    async fn insert_balance_event(
        &mut self,
        event: &AccountBalanceEvent,
    ) -> EngineResult<AccountBalanceEvent> {
        let mut persisted = event.clone();
        persisted.id = self.work.next_balance_event_id + 1;
        self.work.next_balance_event_id = persisted.id;
        self.work.balance_events.push(persisted.clone());
        Ok(persisted)
    }

    async fn savepoint(&mut self, name: &str) -> EngineResult<()> {
        self.savepoints.push((name.to_string(), self.work.clone()));
        Ok(())
    }

    async fn release_savepoint(&mut self, name: &str) -> EngineResult<()> {
        match self.savepoints.iter().rposition(|(n, _)| n == name) {
            Some(idx) => {
                self.savepoints.truncate(idx);
                Ok(())
            }
            None => Err(EngineError::Config(format!("unknown savepoint: {name}"))),
        }
    }

    async fn rollback_to_savepoint(&mut self, name: &str) -> EngineResult<()> {
        match self.savepoints.iter().rposition(|(n, _)| n == name) {
            Some(idx) => {
                self.work = self.savepoints[idx].1.clone();
                self.savepoints.truncate(idx);
                Ok(())
            }
            None => Err(EngineError::Config(format!("unknown savepoint: {name}"))),
        }
    }

    async fn commit(self: Box<Self>) -> EngineResult<()> {
        let mut guard = self.guard;
        *guard = self.work;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> EngineResult<()> {
        // Dropping the working copy is the rollback.
        Ok(())
    }
}

#[async_trait]
impl Store for MemStore {
    async fn begin(&self, _isolation: IsolationLevel) -> EngineResult<TxnHandle> {
        let pending = self.injected_deadlocks.load(Ordering::SeqCst);
        if pending > 0
            && self
                .injected_deadlocks
                .compare_exchange(pending, pending - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(EngineError::Deadlock(Some("injected".to_string())));
        }
        let guard = self.state.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(MemTxn {
            guard,
            work,
            savepoints: Vec::new(),
        }))
    }

    async fn position(&self, id: PositionId) -> EngineResult<Option<Position>> {
        Ok(self.state.lock().await.positions.get(&id).cloned())
    }

    async fn positions_by_status(&self, status: PositionStatus) -> EngineResult<Vec<Position>> {
        let state = self.state.lock().await;
        let mut positions: Vec<Position> = state
            .positions
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect();
        positions.sort_by_key(|p| p.created_at);
        Ok(positions)
    }

    async fn positions_by_account(&self, account_id: &str) -> EngineResult<Vec<Position>> {
        let state = self.state.lock().await;
        let mut positions: Vec<Position> = state
            .positions
            .values()
            .filter(|p| p.account_id == account_id)
            .cloned()
            .collect();
        positions.sort_by_key(|p| p.created_at);
        Ok(positions)
    }

    async fn all_position_ids(&self) -> EngineResult<Vec<PositionId>> {
        let state = self.state.lock().await;
        let mut ids: Vec<(chrono::DateTime<chrono::Utc>, PositionId)> = state
            .positions
            .values()
            .map(|p| (p.created_at, p.id))
            .collect();
        ids.sort();
        Ok(ids.into_iter().map(|(_, id)| id).collect())
    }

    async fn account(&self, account_id: &str) -> EngineResult<Option<AccountBalance>> {
        Ok(self.state.lock().await.accounts.get(account_id).cloned())
    }

    async fn accounts(&self) -> EngineResult<Vec<AccountBalance>> {
        let state = self.state.lock().await;
        let mut accounts: Vec<AccountBalance> = state.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.account_id.cmp(&b.account_id));
        Ok(accounts)
    }

    async fn events_by_position(
        &self,
        position_id: PositionId,
        order: EventOrder,
        limit: Option<usize>,
        offset: usize,
    ) -> EngineResult<Vec<PositionEvent>> {
        let state = self.state.lock().await;
        let mut events: Vec<PositionEvent> = state
            .events
            .iter()
            .filter(|e| e.position_id == position_id)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.created_at, e.id));
        if order == EventOrder::Desc {
            events.reverse();
        }
        let events = events
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        Ok(events)
    }

    async fn count_events_by_position(&self, position_id: PositionId) -> EngineResult<u64> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.position_id == position_id)
            .count() as u64)
    }

    async fn event_by_idempotency_key(&self, key: &str) -> EngineResult<Option<PositionEvent>> {
        let state = self.state.lock().await;
        let id = match state.idempotency_keys.get(key) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(state.events.iter().find(|e| e.id == id).cloned())
    }

    async fn executions_by_position(
        &self,
        position_id: PositionId,
    ) -> EngineResult<Vec<TradeExecution>> {
        let state = self.state.lock().await;
        Ok(state
            .executions
            .iter()
            .filter(|e| e.position_id == position_id)
            .cloned()
            .collect())
    }

    async fn balance_events_by_account(
        &self,
        account_id: &str,
    ) -> EngineResult<Vec<AccountBalanceEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .balance_events
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect())
    }

    async fn log_transaction(&self, audit: &TxAudit) -> EngineResult<()> {
        self.tx_log.lock().await.push(audit.clone());
        Ok(())
    }

    async fn log_reconciliation(&self, log: &ReconciliationLog) -> EngineResult<()> {
        self.recon_log.lock().await.push(log.clone());
        Ok(())
    }
}
