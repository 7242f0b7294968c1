//! Append-only position event log and deterministic replay.
//!
//! Events are appended inside coordinator transactions (the append here is
//! a thin pass-through that preserves idempotency-key uniqueness) and read
//! back in `(created_at, id)` order. Replay folds a position's log back
//! into the aggregate in batches, yielding to the scheduler between
//! batches so a long log cannot monopolize the worker.
//!
//! The payload builders below are the single source of truth for payload
//! keys; emitters and the replay fold both go through them, so the two
//! cannot drift apart.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Map, Value, json};
use tokio::time::Instant;

use crate::error::{EngineError, EngineResult};
use crate::models::{Position, PositionEvent, event_payload};
use crate::store::{EventOrder, Store, StoreTxn};
use crate::types::{CloseReason, PositionEventType, PositionId};

/// Event log facade (C2)
#[derive(Clone)]
pub struct EventStore {
    store: Arc<dyn Store>,
    batch_size: usize,
    avg_price_scale: Option<u32>,
}

impl EventStore {
    pub fn new(store: Arc<dyn Store>, batch_size: usize, avg_price_scale: Option<u32>) -> Self {
        Self {
            store,
            batch_size,
            avg_price_scale,
        }
    }

    /// Append inside an open transaction. Duplicate idempotency keys
    /// surface as `EngineError::Duplicate`.
    pub async fn append(
        &self,
        txn: &mut dyn StoreTxn,
        event: &PositionEvent,
    ) -> EngineResult<PositionEvent> {
        txn.insert_event(event).await
    }

    /// Chronological page of a position's events; restart with `offset`
    pub async fn by_position(
        &self,
        position_id: PositionId,
        order: EventOrder,
        limit: Option<usize>,
        offset: usize,
    ) -> EngineResult<Vec<PositionEvent>> {
        self.store
            .events_by_position(position_id, order, limit, offset)
            .await
    }

    pub async fn count_by_position(&self, position_id: PositionId) -> EngineResult<u64> {
        self.store.count_events_by_position(position_id).await
    }

    pub async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> EngineResult<Option<PositionEvent>> {
        self.store.event_by_idempotency_key(key).await
    }

    /// Fold the event log back into the position aggregate.
    ///
    /// `Ok(None)` when the position has no events at all. Replaying the
    /// same log twice yields an identical position; the fold never reads
    /// anything but the log.
    pub async fn replay(&self, position_id: PositionId) -> EngineResult<Option<Position>> {
        self.replay_until(position_id, None).await
    }

    /// Replay with an optional deadline; exceeding it aborts with
    /// `EngineError::Cancelled`
    pub async fn replay_until(
        &self,
        position_id: PositionId,
        deadline: Option<Instant>,
    ) -> EngineResult<Option<Position>> {
        let mut position: Option<Position> = None;
        let mut offset = 0usize;

        loop {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(EngineError::Cancelled(format!(
                        "replay of {position_id} exceeded its deadline"
                    )));
                }
            }

            let batch = self
                .store
                .events_by_position(position_id, EventOrder::Asc, Some(self.batch_size), offset)
                .await?;
            if batch.is_empty() {
                break;
            }
            let batch_len = batch.len();

            for event in &batch {
                position = self.apply(position, event)?;
            }

            offset += batch_len;
            if batch_len < self.batch_size {
                break;
            }
            // Long logs must not starve the other engine tasks.
            tokio::task::yield_now().await;
        }

        Ok(position)
    }

    fn apply(
        &self,
        position: Option<Position>,
        event: &PositionEvent,
    ) -> EngineResult<Option<Position>> {
        let mut position = match (position, event.event_type) {
            (None, PositionEventType::PositionCreated) => {
                let seeded = payload_position(&event.payload).ok_or_else(|| {
                    EngineError::Integrity(format!(
                        "position_created event {} has no position snapshot",
                        event.id
                    ))
                })?;
                seeded
            }
            (None, other) => {
                return Err(EngineError::Integrity(format!(
                    "event log for {} starts with {:?}, not position_created",
                    event.position_id, other
                )));
            }
            (Some(position), _) => position,
        };

        match event.event_type {
            PositionEventType::OrderFilled | PositionEventType::PartialFill => {
                if let (Some(price), Some(size)) = (
                    payload_decimal(&event.payload, "fill_price"),
                    payload_decimal(&event.payload, "fill_size"),
                ) {
                    position.apply_fill(price, size, self.avg_price_scale);
                }
            }
            // SL/TP closures emit the trigger event as their single audit
            // entry, so it folds exactly like an explicit closure.
            PositionEventType::PositionClosed
            | PositionEventType::PositionLiquidated
            | PositionEventType::StopLossTriggered
            | PositionEventType::TakeProfitTriggered => {
                position.closed_at = payload_datetime(&event.payload, "closed_at")
                    .or(Some(event.created_at));
                if let Some(reason) = payload_close_reason(&event.payload) {
                    position.close_reason = Some(reason);
                }
                if let Some(pnl) = payload_decimal(&event.payload, "realized_pnl") {
                    position.realized_pnl = pnl;
                }
                position.size = Decimal::ZERO;
                position.margin_used = Decimal::ZERO;
                position.unrealized_pnl = Decimal::ZERO;
            }
            PositionEventType::PositionUpdated => {
                if let Some(sl) = payload_decimal(&event.payload, "stop_loss") {
                    position.stop_loss = Some(sl);
                }
                if let Some(tp) = payload_decimal(&event.payload, "take_profit") {
                    position.take_profit = Some(tp);
                }
                if let Some(upnl) = payload_decimal(&event.payload, "unrealized_pnl") {
                    position.unrealized_pnl = upnl;
                }
                // partial exits overlay the reduced size and running total
                if let Some(size) = payload_decimal(&event.payload, "size") {
                    position.size = size;
                }
                if let Some(pnl) = payload_decimal(&event.payload, "realized_pnl") {
                    position.realized_pnl = pnl;
                }
                if let Some(margin) = payload_decimal(&event.payload, "margin_used") {
                    position.margin_used = margin;
                }
            }
            PositionEventType::PositionCreated
            | PositionEventType::OrderPlaced
            | PositionEventType::PositionOpened => {}
        }

        if let Some(new_status) = event.new_status {
            position.status = new_status;
        }
        position.updated_at = event.created_at;

        Ok(Some(position))
    }
}

// ------------------------------------------------------------
// Payload builders (emitters) and readers (replay)
// ------------------------------------------------------------

/// Payload for `PositionCreated`: a full snapshot of the freshly created
/// position, the seed of every replay
pub fn created_payload(position: &Position) -> Value {
    let mut fields = Map::new();
    fields.insert(
        "position".into(),
        serde_json::to_value(position).unwrap_or(Value::Null),
    );
    event_payload(fields)
}

/// Payload for `OrderFilled` / `PartialFill`
pub fn fill_payload(order_id: &str, fill_price: Decimal, fill_size: Decimal) -> Value {
    let mut fields = Map::new();
    fields.insert("order_id".into(), json!(order_id));
    fields.insert("fill_price".into(), json!(fill_price));
    fields.insert("fill_size".into(), json!(fill_size));
    event_payload(fields)
}

/// Payload for `PositionClosed` / `PositionLiquidated`
pub fn closure_payload(
    exit_price: Decimal,
    closed_size: Decimal,
    realized_pnl: Decimal,
    reason: CloseReason,
    closed_at: DateTime<Utc>,
) -> Value {
    let mut fields = Map::new();
    fields.insert("exit_price".into(), json!(exit_price));
    fields.insert("closed_size".into(), json!(closed_size));
    fields.insert("realized_pnl".into(), json!(realized_pnl));
    fields.insert("close_reason".into(), json!(reason.as_str()));
    fields.insert("closed_at".into(), json!(closed_at.to_rfc3339()));
    event_payload(fields)
}

/// Payload for `PositionUpdated`; only the provided fields overlay
pub fn update_payload(
    stop_loss: Option<Decimal>,
    take_profit: Option<Decimal>,
    unrealized_pnl: Option<Decimal>,
) -> Value {
    let mut fields = Map::new();
    if let Some(sl) = stop_loss {
        fields.insert("stop_loss".into(), json!(sl));
    }
    if let Some(tp) = take_profit {
        fields.insert("take_profit".into(), json!(tp));
    }
    if let Some(upnl) = unrealized_pnl {
        fields.insert("unrealized_pnl".into(), json!(upnl));
    }
    event_payload(fields)
}

/// Payload for a `PositionUpdated` emitted by a partial exit: the reduced
/// size and the running totals the replay overlays
pub fn partial_exit_payload(
    exit_price: Decimal,
    exit_size: Decimal,
    size_after: Decimal,
    realized_pnl_after: Decimal,
    margin_used_after: Decimal,
) -> Value {
    let mut fields = Map::new();
    fields.insert("exit_price".into(), json!(exit_price));
    fields.insert("exit_size".into(), json!(exit_size));
    fields.insert("size".into(), json!(size_after));
    fields.insert("realized_pnl".into(), json!(realized_pnl_after));
    fields.insert("margin_used".into(), json!(margin_used_after));
    event_payload(fields)
}

fn payload_decimal(payload: &Value, key: &str) -> Option<Decimal> {
    match payload.get(key)? {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

fn payload_datetime(payload: &Value, key: &str) -> Option<DateTime<Utc>> {
    payload
        .get(key)?
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn payload_close_reason(payload: &Value) -> Option<CloseReason> {
    payload.get("close_reason")?.as_str()?.parse().ok()
}

fn payload_position(payload: &Value) -> Option<Position> {
    serde_json::from_value(payload.get("position")?.clone()).ok()
}
