//! Persistent entities: positions, executions, audit events, account
//! balances and order trackers.
//!
//! All monetary arithmetic is exact `Decimal`; the tolerances quoted in the
//! integrity checker exist only for post-hoc verification, never for the
//! arithmetic itself. Rounding of the average entry price is an explicit
//! policy applied at aggregate-write time (`avg_price_scale`), not a
//! side-effect of the numeric type.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::types::{
    AccountId, BalanceEventType, CloseReason, EventId, ExecutionId, ExecutionKind, IsolationLevel,
    PositionEventType, PositionId, PositionStatus, Side, TxStatus,
};

/// Version stamped into every event payload so consumers can evolve
pub const PAYLOAD_SCHEMA_VERSION: i64 = 1;

/// Maximum time between two identical (size, price) fills on one order
/// before the second is treated as a suspected duplicate
pub const DUPLICATE_FILL_WINDOW_MS: i64 = 1_000;

// ============================================================
// POSITION
// ============================================================

/// Root aggregate: one directional exposure on a symbol.
///
/// Mutated only inside a coordinator transaction holding the position row
/// lock; every accepted mutation appends a `PositionEvent`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub account_id: AccountId,
    pub symbol: String,
    pub side: Side,
    /// Remaining open quantity
    pub size: Decimal,
    pub avg_entry_price: Decimal,
    pub leverage: Decimal,
    pub margin_used: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
    pub status: PositionStatus,
    pub close_reason: Option<CloseReason>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Position {
    /// A freshly accepted signal: no fills yet, margin not reserved here
    /// (the ledger does that in the same transaction)
    #[allow(clippy::too_many_arguments)]
    pub fn new_pending(
        account_id: AccountId,
        symbol: String,
        side: Side,
        leverage: Decimal,
        margin_used: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
        now: DateTime<Utc>,
    ) -> Self {
        Position {
            id: Uuid::new_v4(),
            account_id,
            symbol,
            side,
            size: Decimal::ZERO,
            avg_entry_price: Decimal::ZERO,
            leverage,
            margin_used,
            unrealized_pnl: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            stop_loss,
            take_profit,
            status: PositionStatus::Pending,
            close_reason: None,
            opened_at: now,
            closed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// Signed P&L of exiting `size` units at `exit_price`:
    /// `(exit - entry) * size` for longs, `(entry - exit) * size` for shorts
    pub fn pnl_at(&self, exit_price: Decimal, size: Decimal) -> Decimal {
        let delta = exit_price - self.avg_entry_price;
        delta * size * Decimal::from(self.side.direction())
    }

    /// Fold one fill into `size` / `avg_entry_price` as a size-weighted
    /// mean. `scale` is the configured rounding policy for the stored
    /// aggregate; pass `None` to keep the exact value.
    pub fn apply_fill(&mut self, fill_price: Decimal, fill_size: Decimal, scale: Option<u32>) {
        let new_size = self.size + fill_size;
        if new_size.is_zero() {
            self.size = Decimal::ZERO;
            return;
        }
        let weighted = self.avg_entry_price * self.size + fill_price * fill_size;
        let mut avg = weighted / new_size;
        if let Some(dp) = scale {
            avg = avg.round_dp(dp);
        }
        self.size = new_size;
        self.avg_entry_price = avg;
    }

    /// Margin attributable to exiting `exit_size` of the current size
    pub fn margin_share(&self, exit_size: Decimal) -> Decimal {
        if self.size.is_zero() {
            return self.margin_used;
        }
        (self.margin_used * exit_size / self.size).min(self.margin_used)
    }
}

// ============================================================
// TRADE EXECUTION
// ============================================================

/// Immutable fill record, append-only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeExecution {
    pub id: ExecutionId,
    pub position_id: PositionId,
    pub order_id: String,
    pub kind: ExecutionKind,
    pub price: Decimal,
    pub size: Decimal,
    pub executed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TradeExecution {
    pub fn new(
        position_id: PositionId,
        order_id: impl Into<String>,
        kind: ExecutionKind,
        price: Decimal,
        size: Decimal,
        executed_at: DateTime<Utc>,
    ) -> Self {
        TradeExecution {
            id: Uuid::new_v4(),
            position_id,
            order_id: order_id.into(),
            kind,
            price,
            size,
            executed_at,
            created_at: Utc::now(),
        }
    }
}

// ============================================================
// POSITION EVENT
// ============================================================

/// Append-only audit entry for a position.
///
/// `id` is store-assigned and monotone in insert order; per-position
/// chronology is `(created_at, id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionEvent {
    pub id: EventId,
    pub position_id: PositionId,
    pub event_type: PositionEventType,
    pub prev_status: Option<PositionStatus>,
    pub new_status: Option<PositionStatus>,
    pub payload: Value,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PositionEvent {
    /// Build an unsaved event (`id = 0` until the store assigns one)
    pub fn new(position_id: PositionId, event_type: PositionEventType, payload: Value) -> Self {
        PositionEvent {
            id: 0,
            position_id,
            event_type,
            prev_status: None,
            new_status: None,
            payload,
            idempotency_key: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_transition(mut self, prev: PositionStatus, new: PositionStatus) -> Self {
        self.prev_status = Some(prev);
        self.new_status = Some(new);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }
}

/// Wrap a payload map with the schema version stamp
pub fn event_payload(mut fields: serde_json::Map<String, Value>) -> Value {
    fields.insert("schema_version".into(), json!(PAYLOAD_SCHEMA_VERSION));
    Value::Object(fields)
}

/// Deterministic closure idempotency key: duplicate SL/TP firings, retries
/// and reconciliation repairs with the same trigger timestamp collapse to
/// one effect
pub fn closure_idempotency_key(position_id: PositionId, triggered_at: DateTime<Utc>) -> String {
    format!("close_{}_{}", position_id, triggered_at.timestamp_millis())
}

// ============================================================
// ACCOUNT LEDGER
// ============================================================

/// Per-account balance aggregate.
///
/// Invariants: `free_margin = equity - margin_used`;
/// `equity = balance + sum(unrealized_pnl of open positions)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub account_id: AccountId,
    pub equity: Decimal,
    pub balance: Decimal,
    pub margin_used: Decimal,
    pub free_margin: Decimal,
    pub leverage: Decimal,
    pub is_paper: bool,
    pub updated_at: DateTime<Utc>,
}

impl AccountBalance {
    pub fn new(account_id: AccountId, balance: Decimal, leverage: Decimal, is_paper: bool) -> Self {
        AccountBalance {
            account_id,
            equity: balance,
            balance,
            margin_used: Decimal::ZERO,
            free_margin: balance,
            leverage,
            is_paper,
            updated_at: Utc::now(),
        }
    }

    /// `equity / margin_used`; `None` means infinite (no margin in use)
    pub fn margin_level(&self) -> Option<Decimal> {
        if self.margin_used.is_zero() {
            None
        } else {
            Some(self.equity / self.margin_used)
        }
    }
}

/// Append-only ledger entry; `balance_after = balance_before + amount`
/// always holds (the ledger asserts it before writing)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountBalanceEvent {
    pub id: EventId,
    pub account_id: AccountId,
    pub event_type: BalanceEventType,
    pub balance_before: Decimal,
    pub amount: Decimal,
    pub balance_after: Decimal,
    pub reason: String,
    pub position_id: Option<PositionId>,
    pub execution_id: Option<ExecutionId>,
    pub created_at: DateTime<Utc>,
}

impl AccountBalanceEvent {
    /// `|after - (before + amount)|`, compared against 1e-4 by the
    /// integrity checker
    pub fn equation_error(&self) -> Decimal {
        (self.balance_after - (self.balance_before + self.amount)).abs()
    }
}

// ============================================================
// ORDER TRACKER
// ============================================================

/// Transient per-order aggregate tallying partial fills against the
/// original requested size.
///
/// Invariant: `filled_size + remaining_size = original_size` and
/// `is_complete <=> remaining_size = 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderTracker {
    pub order_id: String,
    pub position_id: PositionId,
    pub original_size: Decimal,
    pub filled_size: Decimal,
    pub remaining_size: Decimal,
    /// Size-weighted mean of all fill prices
    pub average_fill_price: Decimal,
    pub fill_count: u32,
    /// Monotone 1, 2, ... per fill on this order
    pub fill_sequence: u32,
    pub is_complete: bool,
    pub last_fill_price: Option<Decimal>,
    pub last_fill_size: Option<Decimal>,
    pub last_fill_at: Option<DateTime<Utc>>,
}

impl OrderTracker {
    pub fn new(
        order_id: impl Into<String>,
        position_id: PositionId,
        original_size: Decimal,
    ) -> Self {
        OrderTracker {
            order_id: order_id.into(),
            position_id,
            original_size,
            filled_size: Decimal::ZERO,
            remaining_size: original_size,
            average_fill_price: Decimal::ZERO,
            fill_count: 0,
            fill_sequence: 0,
            is_complete: false,
            last_fill_price: None,
            last_fill_size: None,
            last_fill_at: None,
        }
    }

    /// Identical (size, price) within the duplicate window of the previous
    /// fill on the same order
    pub fn is_suspected_duplicate(
        &self,
        price: Decimal,
        size: Decimal,
        executed_at: DateTime<Utc>,
    ) -> bool {
        match (self.last_fill_price, self.last_fill_size, self.last_fill_at) {
            (Some(p), Some(s), Some(at)) => {
                p == price
                    && s == size
                    && (executed_at - at).num_milliseconds().abs() < DUPLICATE_FILL_WINDOW_MS
            }
            _ => false,
        }
    }

    /// Fold one fill in. Caller has already validated the fill; this only
    /// maintains the arithmetic invariants.
    pub fn apply_fill(&mut self, price: Decimal, size: Decimal, executed_at: DateTime<Utc>) {
        let new_filled = self.filled_size + size;
        let weighted = self.average_fill_price * self.filled_size + price * size;
        self.average_fill_price = weighted / new_filled;
        self.filled_size = new_filled;
        self.remaining_size = self.original_size - new_filled;
        self.fill_count += 1;
        self.fill_sequence += 1;
        self.is_complete = self.remaining_size.is_zero();
        self.last_fill_price = Some(price);
        self.last_fill_size = Some(size);
        self.last_fill_at = Some(executed_at);
    }
}

// ============================================================
// AUDIT ROWS
// ============================================================

/// One row per coordinator transaction attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxAudit {
    pub tx_id: Uuid,
    pub op_name: String,
    pub status: TxStatus,
    pub isolation: IsolationLevel,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub metadata: Value,
}

/// One row per reconciliation cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationLog {
    pub reconciliation_id: Uuid,
    pub positions_checked: u32,
    pub discrepancies_found: u32,
    pub discrepancies: Value,
    pub actions_taken: Value,
    pub duration_ms: i64,
    pub created_at: DateTime<Utc>,
}
