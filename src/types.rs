//! Core identifier and enum types used throughout the engine.
//!
//! Statuses, event kinds and close reasons are closed sets; every match on
//! them is exhaustive so a new variant fails to compile until each
//! transition point handles it. All of them round-trip through the text
//! encoding used by the persisted tables.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Position ID - globally unique, assigned at creation
pub type PositionId = Uuid;

/// Execution ID - globally unique per fill record
pub type ExecutionId = Uuid;

/// Account ID - opaque account handle, also the ledger key
pub type AccountId = String;

/// Event ID - store-assigned sequence, monotone per insert order
pub type EventId = i64;

/// Error raised when a persisted enum column holds an unknown value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub column: &'static str,
    pub value: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} value: {}", self.column, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

macro_rules! text_enum {
    ($name:ident, $column:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        column: $column,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Direction of a position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

text_enum!(Side, "side", { Buy => "buy", Sell => "sell" });

impl Side {
    /// +1 for long, -1 for short; multiplies price deltas into signed P&L
    pub fn direction(&self) -> i64 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Lifecycle state of a position (see the state machine for the
/// allowed transitions)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionStatus {
    Pending,
    Open,
    Closed,
    Liquidated,
    Archived,
}

text_enum!(PositionStatus, "status", {
    Pending => "pending",
    Open => "open",
    Closed => "closed",
    Liquidated => "liquidated",
    Archived => "archived",
});

impl PositionStatus {
    /// Closed or Liquidated: the position no longer carries exposure
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PositionStatus::Closed | PositionStatus::Liquidated | PositionStatus::Archived
        )
    }
}

/// Why a position stopped being open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    FullExit,
    StopLoss,
    TakeProfit,
    Manual,
    Cancelled,
    Liquidation,
    BrokerReconciliation,
}

text_enum!(CloseReason, "close_reason", {
    FullExit => "full_exit",
    StopLoss => "stop_loss",
    TakeProfit => "take_profit",
    Manual => "manual",
    Cancelled => "cancelled",
    Liquidation => "liquidation",
    BrokerReconciliation => "broker_reconciliation",
});

/// Kind of a trade execution row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionKind {
    Entry,
    PartialExit,
    FullExit,
    StopLoss,
    TakeProfit,
    Liquidation,
}

text_enum!(ExecutionKind, "execution_type", {
    Entry => "entry",
    PartialExit => "partial_exit",
    FullExit => "full_exit",
    StopLoss => "stop_loss",
    TakeProfit => "take_profit",
    Liquidation => "liquidation",
});

/// Position audit event types (closed set)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionEventType {
    PositionCreated,
    OrderPlaced,
    OrderFilled,
    PartialFill,
    PositionOpened,
    PositionUpdated,
    StopLossTriggered,
    TakeProfitTriggered,
    PositionClosed,
    PositionLiquidated,
}

text_enum!(PositionEventType, "event_type", {
    PositionCreated => "position_created",
    OrderPlaced => "order_placed",
    OrderFilled => "order_filled",
    PartialFill => "partial_fill",
    PositionOpened => "position_opened",
    PositionUpdated => "position_updated",
    StopLossTriggered => "stop_loss_triggered",
    TakeProfitTriggered => "take_profit_triggered",
    PositionClosed => "position_closed",
    PositionLiquidated => "position_liquidated",
});

/// Account ledger event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BalanceEventType {
    MarginReserved,
    MarginReleased,
    PnlRealized,
    LiquidationLoss,
    Deposit,
    Withdrawal,
}

text_enum!(BalanceEventType, "balance_event_type", {
    MarginReserved => "margin_reserved",
    MarginReleased => "margin_released",
    PnlRealized => "pnl_realized",
    LiquidationLoss => "liquidation_loss",
    Deposit => "deposit",
    Withdrawal => "withdrawal",
});

/// Transaction isolation requested from the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

text_enum!(IsolationLevel, "isolation_level", {
    ReadCommitted => "read_committed",
    RepeatableRead => "repeatable_read",
    Serializable => "serializable",
});

/// Outcome recorded in the transaction audit log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    Started,
    Committed,
    RolledBack,
    Failed,
}

text_enum!(TxStatus, "tx_status", {
    Started => "started",
    Committed => "committed",
    RolledBack => "rolled_back",
    Failed => "failed",
});
