//! Storage abstraction backing the engine.
//!
//! Two implementations share one contract: [`MemStore`] (in-process, used
//! by tests and paper trading) and [`PgStore`] (PostgreSQL via sqlx). The
//! transaction coordinator owns the only write path; plain reads for the
//! background loops go through the non-transactional methods on [`Store`].
//!
//! # Transaction semantics
//!
//! `begin` hands out a boxed [`StoreTxn`]. Every write inside it is
//! invisible to readers until `commit`; dropping the handle without
//! committing rolls back (sqlx transaction semantics, mirrored by the
//! in-memory store). Position reads inside a transaction take the row lock
//! with `locked = true` (`SELECT ... FOR UPDATE`), which is the engine's
//! sole cross-task mutex for per-position state.

pub mod mem;
pub mod pg;
pub mod schema;

pub use mem::MemStore;
pub use pg::PgStore;

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::models::{
    AccountBalance, AccountBalanceEvent, OrderTracker, Position, PositionEvent, ReconciliationLog,
    TradeExecution, TxAudit,
};
use crate::types::{IsolationLevel, PositionId, PositionStatus};

/// Chronological direction for event reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventOrder {
    #[default]
    Asc,
    Desc,
}

/// Transactional handle over the store.
///
/// All writes go through one of these; the handle is consumed by
/// `commit`/`rollback`. Dropping it mid-flight (e.g. on a coordinator
/// timeout) discards every buffered write.
#[async_trait]
pub trait StoreTxn: Send {
    // --- positions ---
    async fn insert_position(&mut self, position: &Position) -> EngineResult<()>;
    /// `locked = true` acquires the row lock (`FOR UPDATE`)
    async fn position(&mut self, id: PositionId, locked: bool) -> EngineResult<Option<Position>>;
    async fn update_position(&mut self, position: &Position) -> EngineResult<()>;

    // --- executions (append-only) ---
    async fn insert_execution(&mut self, execution: &TradeExecution) -> EngineResult<()>;

    // --- position events (append-only) ---
    /// Assigns the event id; rejects a duplicate idempotency key with
    /// `EngineError::Duplicate`
    async fn insert_event(&mut self, event: &PositionEvent) -> EngineResult<PositionEvent>;
    async fn event_by_idempotency_key(
        &mut self,
        key: &str,
    ) -> EngineResult<Option<PositionEvent>>;

    // --- accounts & ledger ---
    /// `locked = true` acquires the account row lock
    async fn account(&mut self, id: &str, locked: bool) -> EngineResult<Option<AccountBalance>>;
    async fn upsert_account(&mut self, account: &AccountBalance) -> EngineResult<()>;
    async fn insert_balance_event(
        &mut self,
        event: &AccountBalanceEvent,
    ) -> EngineResult<AccountBalanceEvent>;

    // --- savepoints (nested partial rollback) ---
    async fn savepoint(&mut self, name: &str) -> EngineResult<()>;
    async fn release_savepoint(&mut self, name: &str) -> EngineResult<()>;
    async fn rollback_to_savepoint(&mut self, name: &str) -> EngineResult<()>;

    // --- terminal ---
    async fn commit(self: Box<Self>) -> EngineResult<()>;
    async fn rollback(self: Box<Self>) -> EngineResult<()>;
}

/// Boxed transaction handle passed through coordinator op futures
pub type TxnHandle = Box<dyn StoreTxn>;

/// The store itself: transaction entry point plus auto-commit reads and
/// best-effort audit writes.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self, isolation: IsolationLevel) -> EngineResult<TxnHandle>;

    // --- reads (auto-commit) ---
    async fn position(&self, id: PositionId) -> EngineResult<Option<Position>>;
    async fn positions_by_status(&self, status: PositionStatus) -> EngineResult<Vec<Position>>;
    async fn positions_by_account(&self, account_id: &str) -> EngineResult<Vec<Position>>;
    async fn all_position_ids(&self) -> EngineResult<Vec<PositionId>>;
    async fn account(&self, account_id: &str) -> EngineResult<Option<AccountBalance>>;
    async fn accounts(&self) -> EngineResult<Vec<AccountBalance>>;
    async fn events_by_position(
        &self,
        position_id: PositionId,
        order: EventOrder,
        limit: Option<usize>,
        offset: usize,
    ) -> EngineResult<Vec<PositionEvent>>;
    async fn count_events_by_position(&self, position_id: PositionId) -> EngineResult<u64>;
    async fn event_by_idempotency_key(&self, key: &str) -> EngineResult<Option<PositionEvent>>;
    async fn executions_by_position(
        &self,
        position_id: PositionId,
    ) -> EngineResult<Vec<TradeExecution>>;
    async fn balance_events_by_account(
        &self,
        account_id: &str,
    ) -> EngineResult<Vec<AccountBalanceEvent>>;

    // --- audit (best-effort: callers log failures, never propagate) ---
    async fn log_transaction(&self, audit: &TxAudit) -> EngineResult<()>;
    async fn log_reconciliation(&self, log: &ReconciliationLog) -> EngineResult<()>;
}

/// In-memory per-order fill aggregates.
///
/// Order trackers are transient (not part of the persisted layout); they are
/// owned by the execution tracker task and rebuilt from events on recovery.
pub type OrderTrackerMap = rustc_hash::FxHashMap<String, OrderTracker>;

/// Convenience: open positions across all accounts
pub async fn open_positions(store: &dyn Store) -> EngineResult<Vec<Position>> {
    store.positions_by_status(PositionStatus::Open).await
}
