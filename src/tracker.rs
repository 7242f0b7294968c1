//! Execution tracker and partial-fill aggregator.
//!
//! Every fill and every closure flows through here. A fill (a) writes a
//! TradeExecution row, (b) folds into the per-order tracker, (c) mutates
//! the position aggregate, (d) appends the matching event, and (e) asks the
//! state machine for a transition when the order completes - all inside one
//! coordinator transaction.
//!
//! Order trackers are transient in-memory aggregates guarded by a single
//! mutex; they are staged on a clone during validation and only written
//! back once the transaction commits, so a rollback leaves them untouched.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use crate::error::{EngineError, EngineResult};
use crate::events::{
    EventStore, closure_payload, fill_payload, partial_exit_payload,
};
use crate::ledger::{realize_pnl_tx, release_margin_tx};
use crate::models::{
    OrderTracker, Position, PositionEvent, TradeExecution, closure_idempotency_key, event_payload,
};
use crate::state_machine::transition;
use crate::store::{OrderTrackerMap, StoreTxn};
use crate::txn::TransactionCoordinator;
use crate::types::{
    CloseReason, ExecutionKind, PositionEventType, PositionId, PositionStatus,
};

/// A broker fill report
#[derive(Debug, Clone)]
pub struct FillReport {
    pub position_id: PositionId,
    pub order_id: String,
    pub price: Decimal,
    pub size: Decimal,
    pub executed_at: DateTime<Utc>,
}

/// Result of folding one fill in
#[derive(Debug, Clone)]
pub struct FillOutcome {
    pub position: Position,
    pub tracker: OrderTracker,
    pub order_complete: bool,
}

/// Result of a closure attempt. Duplicate triggers and already-closed
/// positions are successes with no side effects.
#[derive(Debug, Clone)]
pub enum ClosureOutcome {
    Closed(Box<Position>),
    AlreadyClosed,
    DuplicateTrigger,
}

impl ClosureOutcome {
    /// True when this call actually closed the position
    pub fn is_effective(&self) -> bool {
        matches!(self, ClosureOutcome::Closed(_))
    }
}

/// Fully parameterized closure: SL/TP triggers, manual exits, liquidation
/// and reconciliation repair all reduce to this
#[derive(Debug, Clone)]
pub(crate) struct CloseRequest {
    pub position_id: PositionId,
    /// `None` records no execution and realizes zero P&L
    /// (broker-reconciliation repair)
    pub exit_price: Option<Decimal>,
    pub execution_kind: Option<ExecutionKind>,
    pub order_id: String,
    pub event_type: PositionEventType,
    pub close_reason: CloseReason,
    pub target_status: PositionStatus,
    pub idempotency_key: Option<String>,
    pub at: DateTime<Utc>,
}

/// Execution tracker facade (C5)
#[derive(Clone)]
pub struct ExecutionTracker {
    coordinator: Arc<TransactionCoordinator>,
    events: EventStore,
    trackers: Arc<Mutex<OrderTrackerMap>>,
    avg_price_scale: Option<u32>,
}

impl ExecutionTracker {
    pub fn new(
        coordinator: Arc<TransactionCoordinator>,
        events: EventStore,
        avg_price_scale: Option<u32>,
    ) -> Self {
        Self {
            coordinator,
            events,
            trackers: Arc::new(Mutex::new(OrderTrackerMap::default())),
            avg_price_scale,
        }
    }

    /// Register an order before its fills start arriving
    pub async fn register_order(
        &self,
        order_id: &str,
        position_id: PositionId,
        original_size: Decimal,
    ) -> EngineResult<()> {
        if original_size <= Decimal::ZERO {
            return Err(EngineError::InvalidFill(format!(
                "order {order_id} registered with non-positive size {original_size}"
            )));
        }
        let mut trackers = self.trackers.lock().await;
        if let Some(existing) = trackers.get(order_id) {
            if !existing.is_complete {
                return Err(EngineError::InvalidFill(format!(
                    "order {order_id} is already registered and incomplete"
                )));
            }
        }
        trackers.insert(
            order_id.to_string(),
            OrderTracker::new(order_id, position_id, original_size),
        );
        Ok(())
    }

    /// Snapshot of an order tracker, if known
    pub async fn order_tracker(&self, order_id: &str) -> Option<OrderTracker> {
        self.trackers.lock().await.get(order_id).cloned()
    }

    /// Record one fill against its order: validation, execution row,
    /// tracker fold, position mutation, event, and the Pending -> Open
    /// transition when the order completes.
    pub async fn record_execution(&self, report: FillReport) -> EngineResult<FillOutcome> {
        validate_report(&report)?;

        let mut trackers = self.trackers.lock().await;
        let tracker = trackers
            .get(&report.order_id)
            .ok_or_else(|| EngineError::OrderNotFound(report.order_id.clone()))?;
        validate_against_tracker(tracker, &report)?;

        let mut staged = tracker.clone();
        staged.apply_fill(report.price, report.size, report.executed_at);
        let order_complete = staged.is_complete;

        let scale = self.avg_price_scale;
        let tx_report = report.clone();
        let position = self
            .coordinator
            .run_default("tracker.record_execution", move |mut txn| {
                let report = tx_report.clone();
                Box::pin(async move {
                    let result = apply_fill_tx(&mut *txn, &report, order_complete, scale).await;
                    (txn, result)
                })
            })
            .await?;

        // Commit succeeded; only now does the staged tracker become real.
        trackers.insert(report.order_id.clone(), staged.clone());
        Ok(FillOutcome {
            position,
            tracker: staged,
            order_complete,
        })
    }

    /// Convenience wrapper around [`Self::record_execution`]
    pub async fn process_partial_fill(
        &self,
        position_id: PositionId,
        order_id: &str,
        price: Decimal,
        size: Decimal,
        executed_at: DateTime<Utc>,
    ) -> EngineResult<FillOutcome> {
        self.record_execution(FillReport {
            position_id,
            order_id: order_id.to_string(),
            price,
            size,
            executed_at,
        })
        .await
    }

    /// Fill the order's entire remaining size in one execution
    pub async fn process_full_fill(
        &self,
        position_id: PositionId,
        order_id: &str,
        price: Decimal,
        executed_at: DateTime<Utc>,
    ) -> EngineResult<FillOutcome> {
        let remaining = {
            let trackers = self.trackers.lock().await;
            trackers
                .get(order_id)
                .ok_or_else(|| EngineError::OrderNotFound(order_id.to_string()))?
                .remaining_size
        };
        self.record_execution(FillReport {
            position_id,
            order_id: order_id.to_string(),
            price,
            size: remaining,
            executed_at,
        })
        .await
    }

    /// Reduce an open position by `exit_size` at `exit_price`; a reduction
    /// of the full size is a full exit
    pub async fn process_partial_exit(
        &self,
        position_id: PositionId,
        exit_price: Decimal,
        exit_size: Decimal,
        at: DateTime<Utc>,
    ) -> EngineResult<Position> {
        if exit_size <= Decimal::ZERO || exit_price <= Decimal::ZERO {
            return Err(EngineError::InvalidFill(
                "exit price and size must be positive".to_string(),
            ));
        }
        self.coordinator
            .run_default("tracker.partial_exit", move |mut txn| {
                Box::pin(async move {
                    let result =
                        partial_exit_tx(&mut *txn, position_id, exit_price, exit_size, at).await;
                    (txn, result)
                })
            })
            .await
    }

    /// Close an open position at a caller-supplied price
    pub async fn close_manual(
        &self,
        position_id: PositionId,
        exit_price: Decimal,
        at: DateTime<Utc>,
    ) -> EngineResult<ClosureOutcome> {
        self.close_with_request(CloseRequest {
            position_id,
            exit_price: Some(exit_price),
            execution_kind: Some(ExecutionKind::FullExit),
            order_id: format!("manual_close_{position_id}"),
            event_type: PositionEventType::PositionClosed,
            close_reason: CloseReason::Manual,
            target_status: PositionStatus::Closed,
            idempotency_key: None,
            at,
        })
        .await
    }

    /// Cancel a position that never filled
    pub async fn cancel_pending(
        &self,
        position_id: PositionId,
        at: DateTime<Utc>,
    ) -> EngineResult<ClosureOutcome> {
        let result = self
            .coordinator
            .run_default("tracker.cancel_pending", move |mut txn| {
                Box::pin(async move {
                    let result = cancel_pending_tx(&mut *txn, position_id, at).await;
                    (txn, result)
                })
            })
            .await;
        match result {
            Ok(outcome) => Ok(outcome),
            Err(EngineError::Duplicate(_)) => Ok(ClosureOutcome::DuplicateTrigger),
            Err(err) => Err(err),
        }
    }

    /// Idempotent stop-loss closure at the stop price
    pub async fn trigger_stop_loss(
        &self,
        position_id: PositionId,
        stop_price: Decimal,
        triggered_at: DateTime<Utc>,
    ) -> EngineResult<ClosureOutcome> {
        self.trigger_closure(
            position_id,
            stop_price,
            triggered_at,
            ExecutionKind::StopLoss,
            PositionEventType::StopLossTriggered,
            CloseReason::StopLoss,
        )
        .await
    }

    /// Idempotent take-profit closure at the target price
    pub async fn trigger_take_profit(
        &self,
        position_id: PositionId,
        target_price: Decimal,
        triggered_at: DateTime<Utc>,
    ) -> EngineResult<ClosureOutcome> {
        self.trigger_closure(
            position_id,
            target_price,
            triggered_at,
            ExecutionKind::TakeProfit,
            PositionEventType::TakeProfitTriggered,
            CloseReason::TakeProfit,
        )
        .await
    }

    async fn trigger_closure(
        &self,
        position_id: PositionId,
        exit_price: Decimal,
        triggered_at: DateTime<Utc>,
        kind: ExecutionKind,
        event_type: PositionEventType,
        reason: CloseReason,
    ) -> EngineResult<ClosureOutcome> {
        let key = closure_idempotency_key(position_id, triggered_at);

        // Fast path: a previous delivery already closed this trigger.
        if self.events.find_by_idempotency_key(&key).await?.is_some() {
            return Ok(ClosureOutcome::DuplicateTrigger);
        }

        self.close_with_request(CloseRequest {
            position_id,
            exit_price: Some(exit_price),
            execution_kind: Some(kind),
            order_id: format!("{}_{}", kind.as_str(), position_id),
            event_type,
            close_reason: reason,
            target_status: PositionStatus::Closed,
            idempotency_key: Some(key),
            at: triggered_at,
        })
        .await
    }

    /// Run a fully parameterized closure; duplicate idempotency keys
    /// (lost race against another delivery) are success
    pub(crate) async fn close_with_request(
        &self,
        request: CloseRequest,
    ) -> EngineResult<ClosureOutcome> {
        let scale = self.avg_price_scale;
        let result = self
            .coordinator
            .run_default("tracker.close_position", move |mut txn| {
                let request = request.clone();
                Box::pin(async move {
                    let result = close_position_tx(&mut *txn, &request, scale).await;
                    (txn, result)
                })
            })
            .await;
        match result {
            Ok(outcome) => Ok(outcome),
            Err(EngineError::Duplicate(_)) => Ok(ClosureOutcome::DuplicateTrigger),
            Err(err) => Err(err),
        }
    }
}

// ------------------------------------------------------------
// Validation
// ------------------------------------------------------------

fn validate_report(report: &FillReport) -> EngineResult<()> {
    if report.order_id.trim().is_empty() {
        return Err(EngineError::InvalidFill("fill without an order id".to_string()));
    }
    if report.size <= Decimal::ZERO {
        return Err(EngineError::InvalidFill(format!(
            "fill size must be positive, got {}",
            report.size
        )));
    }
    if report.price <= Decimal::ZERO {
        return Err(EngineError::InvalidFill(format!(
            "fill price must be positive, got {}",
            report.price
        )));
    }
    if report.executed_at > Utc::now() {
        return Err(EngineError::InvalidFill(format!(
            "fill executed in the future: {}",
            report.executed_at
        )));
    }
    Ok(())
}

fn validate_against_tracker(tracker: &OrderTracker, report: &FillReport) -> EngineResult<()> {
    if tracker.position_id != report.position_id {
        return Err(EngineError::InvalidFill(format!(
            "order {} belongs to position {}, not {}",
            report.order_id, tracker.position_id, report.position_id
        )));
    }
    if tracker.is_complete {
        return Err(EngineError::InvalidFill(format!(
            "order {} is already complete",
            report.order_id
        )));
    }
    if tracker.filled_size + report.size > tracker.original_size {
        return Err(EngineError::InvalidFill(format!(
            "fill of {} would overfill order {} ({} of {} filled)",
            report.size, report.order_id, tracker.filled_size, tracker.original_size
        )));
    }
    if tracker.is_suspected_duplicate(report.price, report.size, report.executed_at) {
        return Err(EngineError::InvalidFill(format!(
            "suspected duplicate fill on order {}: identical size and price within the duplicate window",
            report.order_id
        )));
    }
    Ok(())
}

// ------------------------------------------------------------
// Transactional bodies
// ------------------------------------------------------------

async fn apply_fill_tx(
    txn: &mut dyn StoreTxn,
    report: &FillReport,
    order_complete: bool,
    scale: Option<u32>,
) -> EngineResult<Position> {
    let mut position = txn
        .position(report.position_id, true)
        .await?
        .ok_or(EngineError::PositionNotFound(report.position_id))?;
    if position.status.is_terminal() {
        return Err(EngineError::InvalidFill(format!(
            "position {} is {} and no longer accepts fills",
            position.id, position.status
        )));
    }

    let execution = TradeExecution::new(
        position.id,
        report.order_id.clone(),
        ExecutionKind::Entry,
        report.price,
        report.size,
        report.executed_at,
    );
    txn.insert_execution(&execution).await?;

    position.apply_fill(report.price, report.size, scale);

    let fill_event_type = if order_complete {
        PositionEventType::OrderFilled
    } else {
        PositionEventType::PartialFill
    };
    let fill_event = PositionEvent::new(
        position.id,
        fill_event_type,
        fill_payload(&report.order_id, report.price, report.size),
    )
    .with_created_at(report.executed_at);
    txn.insert_event(&fill_event).await?;

    if order_complete && position.status == PositionStatus::Pending {
        position.opened_at = report.executed_at;
        transition(
            txn,
            &mut position,
            PositionStatus::Open,
            PositionEventType::PositionOpened,
            event_payload(serde_json::Map::new()),
            None,
            report.executed_at,
        )
        .await?;
    } else {
        position.updated_at = report.executed_at;
        txn.update_position(&position).await?;
    }

    Ok(position)
}

async fn partial_exit_tx(
    txn: &mut dyn StoreTxn,
    position_id: PositionId,
    exit_price: Decimal,
    exit_size: Decimal,
    at: DateTime<Utc>,
) -> EngineResult<Position> {
    let mut position = txn
        .position(position_id, true)
        .await?
        .ok_or(EngineError::PositionNotFound(position_id))?;
    if !position.is_open() {
        return Err(EngineError::InvalidFill(format!(
            "position {position_id} is {} and cannot be reduced",
            position.status
        )));
    }
    if exit_size > position.size {
        return Err(EngineError::InvalidFill(format!(
            "exit of {exit_size} exceeds open size {}",
            position.size
        )));
    }

    if exit_size == position.size {
        let request = CloseRequest {
            position_id,
            exit_price: Some(exit_price),
            execution_kind: Some(ExecutionKind::FullExit),
            order_id: format!("full_exit_{position_id}"),
            event_type: PositionEventType::PositionClosed,
            close_reason: CloseReason::FullExit,
            target_status: PositionStatus::Closed,
            idempotency_key: None,
            at,
        };
        return match close_position_tx(txn, &request, None).await? {
            ClosureOutcome::Closed(position) => Ok(*position),
            // position row was Open a moment ago, under our row lock
            _ => Err(EngineError::PositionNotFound(position_id)),
        };
    }

    let pnl = position.pnl_at(exit_price, exit_size);
    let released = position.margin_share(exit_size);

    let execution = TradeExecution::new(
        position.id,
        format!("partial_exit_{position_id}"),
        ExecutionKind::PartialExit,
        exit_price,
        exit_size,
        at,
    );
    txn.insert_execution(&execution).await?;

    position.size -= exit_size;
    position.realized_pnl += pnl;
    position.margin_used -= released;
    position.updated_at = at;
    txn.update_position(&position).await?;

    let event = PositionEvent::new(
        position.id,
        PositionEventType::PositionUpdated,
        partial_exit_payload(
            exit_price,
            exit_size,
            position.size,
            position.realized_pnl,
            position.margin_used,
        ),
    )
    .with_created_at(at);
    txn.insert_event(&event).await?;

    realize_pnl_tx(
        txn,
        &position.account_id.clone(),
        position.id,
        Some(execution.id),
        pnl,
        &format!("partial exit of {exit_size} @ {exit_price}"),
    )
    .await?;
    release_margin_tx(txn, &position.account_id.clone(), position.id, released).await?;

    Ok(position)
}

/// The closure transaction shared by every close path: race-safe refetch,
/// single audit event with the status transition, optional execution row,
/// P&L realization and margin release.
pub(crate) async fn close_position_tx(
    txn: &mut dyn StoreTxn,
    request: &CloseRequest,
    _scale: Option<u32>,
) -> EngineResult<ClosureOutcome> {
    let mut position = txn
        .position(request.position_id, true)
        .await?
        .ok_or(EngineError::PositionNotFound(request.position_id))?;

    // Race-safe: another delivery closed it between evaluation and now.
    if !position.is_open() {
        return Ok(ClosureOutcome::AlreadyClosed);
    }

    let closed_size = position.size;
    let pnl = request
        .exit_price
        .map(|price| position.pnl_at(price, closed_size))
        .unwrap_or(Decimal::ZERO);
    let released = position.margin_used;

    position.realized_pnl += pnl;
    position.size = Decimal::ZERO;
    position.unrealized_pnl = Decimal::ZERO;
    position.margin_used = Decimal::ZERO;
    position.closed_at = Some(request.at);
    position.close_reason = Some(request.close_reason);

    let realized_pnl_for_payload = position.realized_pnl;
    let event = transition(
        txn,
        &mut position,
        request.target_status,
        request.event_type,
        closure_payload(
            request.exit_price.unwrap_or(Decimal::ZERO),
            closed_size,
            realized_pnl_for_payload,
            request.close_reason,
            request.at,
        ),
        request.idempotency_key.clone(),
        request.at,
    )
    .await?;
    debug_assert_eq!(event.new_status, Some(request.target_status));

    let mut execution_id = None;
    if let (Some(price), Some(kind)) = (request.exit_price, request.execution_kind) {
        let execution = TradeExecution::new(
            position.id,
            request.order_id.clone(),
            kind,
            price,
            closed_size,
            request.at,
        );
        txn.insert_execution(&execution).await?;
        execution_id = Some(execution.id);
    }

    let account_id = position.account_id.clone();
    realize_pnl_tx(
        txn,
        &account_id,
        position.id,
        execution_id,
        pnl,
        &format!("{} close @ {}", request.close_reason, request.exit_price.unwrap_or(Decimal::ZERO)),
    )
    .await?;
    release_margin_tx(txn, &account_id, position.id, released).await?;

    Ok(ClosureOutcome::Closed(Box::new(position)))
}

async fn cancel_pending_tx(
    txn: &mut dyn StoreTxn,
    position_id: PositionId,
    at: DateTime<Utc>,
) -> EngineResult<ClosureOutcome> {
    let mut position = txn
        .position(position_id, true)
        .await?
        .ok_or(EngineError::PositionNotFound(position_id))?;
    if position.status != PositionStatus::Pending {
        return Ok(ClosureOutcome::AlreadyClosed);
    }

    let released = position.margin_used;
    position.margin_used = Decimal::ZERO;
    position.closed_at = Some(at);
    position.close_reason = Some(CloseReason::Cancelled);

    let realized_pnl_for_payload = position.realized_pnl;
    transition(
        txn,
        &mut position,
        PositionStatus::Closed,
        PositionEventType::PositionClosed,
        closure_payload(
            Decimal::ZERO,
            Decimal::ZERO,
            realized_pnl_for_payload,
            CloseReason::Cancelled,
            at,
        ),
        None,
        at,
    )
    .await?;

    let account_id = position.account_id.clone();
    realize_pnl_tx(
        txn,
        &account_id,
        position.id,
        None,
        Decimal::ZERO,
        "cancelled before fill",
    )
    .await?;
    release_margin_tx(txn, &account_id, position.id, released).await?;

    Ok(ClosureOutcome::Closed(Box::new(position)))
}
