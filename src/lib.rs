//! position-engine - Position Lifecycle Engine
//!
//! Owns the authoritative state of every open trading position, its
//! executions, and the account ledger backing them, with strict atomicity
//! and an event-sourced audit trail.
//!
//! # Modules
//!
//! - [`types`] - identifier aliases and the closed status/event enums
//! - [`models`] - persistent entities (positions, executions, events,
//!   balances, order trackers)
//! - [`config`] - engine configuration and loaders
//! - [`store`] - storage contract with in-memory and PostgreSQL backends
//! - [`txn`] - transaction coordinator (atomicity, timeout, deadlock retry)
//! - [`events`] - append-only position event log and deterministic replay
//! - [`ledger`] - account balance and margin arithmetic
//! - [`state_machine`] - position lifecycle transitions
//! - [`tracker`] - execution recording and partial-fill aggregation
//! - [`monitor`] - SL/TP detection, trigger priority queue, drain worker
//! - [`liquidation`] - margin checks and cascading forced closes
//! - [`reconciler`] - periodic broker-vs-store diff and repair
//! - [`integrity`] - ledger verification and replay-based recovery
//! - [`locks`] - optional advisory lock layer for composite operations
//! - [`broker`] - broker adapter contract and the paper broker
//! - [`alerts`] - structured alert sink for long-running components
//! - [`engine`] - the facade wiring everything together

pub mod alerts;
pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod integrity;
pub mod ledger;
pub mod liquidation;
pub mod locks;
pub mod logging;
pub mod models;
pub mod monitor;
pub mod reconciler;
pub mod state_machine;
pub mod store;
pub mod tracker;
pub mod txn;
pub mod types;

// Convenient re-exports at crate root
pub use alerts::{Alert, AlertSeverity, AlertSink, TracingAlertSink};
pub use broker::{BrokerAdapter, BrokerExecution, BrokerPosition, OrderSpec, PaperBroker};
pub use config::{EngineConfig, PaperTradingConfig};
pub use engine::{PositionEngine, TradeSignal};
pub use error::{ApiError, EngineError, EngineResult};
pub use events::EventStore;
pub use integrity::{IntegrityChecker, IntegrityReport};
pub use ledger::{Ledger, MarginStatus};
pub use models::{
    AccountBalance, AccountBalanceEvent, OrderTracker, Position, PositionEvent, TradeExecution,
};
pub use monitor::{PriceTick, SlTpMonitor, TriggerQueue, TriggerWorker};
pub use store::{MemStore, PgStore, Store, StoreTxn};
pub use tracker::{ClosureOutcome, ExecutionTracker, FillReport};
pub use txn::{TransactionCoordinator, TxOptions};
pub use types::{
    AccountId, BalanceEventType, CloseReason, ExecutionKind, IsolationLevel, PositionEventType,
    PositionId, PositionStatus, Side,
};
