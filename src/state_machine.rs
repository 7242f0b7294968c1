//! Position state machine.
//!
//! The transition table is the single authority on lifecycle moves. Every
//! accepted transition updates the position row and appends exactly one
//! audit event in the caller's open transaction; a rejected transition is
//! `InvalidTransition` and writes nothing.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};
use crate::models::{Position, PositionEvent};
use crate::store::StoreTxn;
use crate::types::{PositionEventType, PositionStatus};

/// Allowed lifecycle moves:
///
/// | From | To | Trigger |
/// |------|----|---------|
/// | Pending | Open | first fill completes the order |
/// | Pending | Closed | cancellation before any fill |
/// | Open | Closed | exit / stop-loss / take-profit / manual |
/// | Open | Liquidated | margin breach cascade |
/// | Closed | Archived | retention policy |
/// | Liquidated | Archived | retention policy |
pub fn is_allowed(from: PositionStatus, to: PositionStatus) -> bool {
    use PositionStatus::*;
    matches!(
        (from, to),
        (Pending, Open)
            | (Pending, Closed)
            | (Open, Closed)
            | (Open, Liquidated)
            | (Closed, Archived)
            | (Liquidated, Archived)
    )
}

/// Apply a transition inside an open transaction: guard, mutate the row,
/// append the single audit event. The caller has already locked and staged
/// any other field changes on `position` (size, realized P&L, ...).
pub async fn transition(
    txn: &mut dyn StoreTxn,
    position: &mut Position,
    to: PositionStatus,
    event_type: PositionEventType,
    payload: Value,
    idempotency_key: Option<String>,
    at: DateTime<Utc>,
) -> EngineResult<PositionEvent> {
    let from = position.status;
    if !is_allowed(from, to) {
        return Err(EngineError::InvalidTransition {
            position_id: position.id,
            from,
            to,
        });
    }

    position.status = to;
    position.updated_at = at;
    txn.update_position(position).await?;

    let mut event = PositionEvent::new(position.id, event_type, payload)
        .with_transition(from, to)
        .with_created_at(at);
    if let Some(key) = idempotency_key {
        event = event.with_idempotency_key(key);
    }
    txn.insert_event(&event).await
}
