//! Engine facade: wires the components together and owns the background
//! loops.
//!
//! Data flow: a trade signal creates a `Pending` position and reserves
//! margin in one transaction; broker fills stream into the execution
//! tracker; a completed order opens the position and registers it with the
//! SL/TP monitor; price ticks detect triggers which the drain worker
//! closes; the liquidation and reconciliation loops run alongside; the
//! integrity checker validates on demand.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;

use crate::alerts::{Alert, AlertSeverity, AlertSink};
use crate::broker::{BrokerAdapter, BrokerExecution, OrderSpec};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::events::{EventStore, created_payload, update_payload};
use crate::integrity::{IntegrityChecker, IntegrityReport, RecoveryReport};
use crate::ledger::{Ledger, MarginThresholds, reserve_margin_tx};
use crate::liquidation::LiquidationEngine;
use crate::models::{Position, PositionEvent, event_payload};
use crate::monitor::{PriceTick, SlTpMonitor, TriggerWorker};
use crate::reconciler::BrokerReconciler;
use crate::state_machine::transition;
use crate::store::{Store, StoreTxn};
use crate::tracker::{ClosureOutcome, ExecutionTracker, FillReport};
use crate::txn::{TransactionCoordinator, TxOptions};
use crate::types::{PositionEventType, PositionId, PositionStatus, Side};

/// An accepted strategy signal, ready to become a position
#[derive(Debug, Clone)]
pub struct TradeSignal {
    pub account_id: String,
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    /// Reference price for margin sizing and the broker order
    pub intent_price: Decimal,
    pub leverage: Decimal,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

impl TradeSignal {
    /// Margin the signal needs: notional / leverage
    pub fn margin_required(&self) -> Decimal {
        if self.leverage <= Decimal::ZERO {
            return self.size * self.intent_price;
        }
        self.size * self.intent_price / self.leverage
    }
}

/// The position lifecycle engine
pub struct PositionEngine {
    config: EngineConfig,
    store: Arc<dyn Store>,
    coordinator: Arc<TransactionCoordinator>,
    events: EventStore,
    ledger: Ledger,
    tracker: Arc<ExecutionTracker>,
    monitor: Arc<SlTpMonitor>,
    worker: Arc<TriggerWorker>,
    liquidator: Arc<LiquidationEngine>,
    reconciler: Arc<BrokerReconciler>,
    integrity: IntegrityChecker,
    broker: Arc<dyn BrokerAdapter>,
    alerts: Arc<dyn AlertSink>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PositionEngine {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn BrokerAdapter>,
        alerts: Arc<dyn AlertSink>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let coordinator = Arc::new(TransactionCoordinator::new(
            store.clone(),
            TxOptions::from_config(&config),
        ));
        let events = EventStore::new(
            store.clone(),
            config.replay_batch_size,
            config.avg_price_scale,
        );
        let thresholds = MarginThresholds {
            margin_call_level: config.margin_call_level,
            liquidation_level: config.liquidation_level,
        };
        let ledger = Ledger::new(coordinator.clone(), thresholds);
        let tracker = Arc::new(ExecutionTracker::new(
            coordinator.clone(),
            events.clone(),
            config.avg_price_scale,
        ));
        let monitor = Arc::new(SlTpMonitor::new(config.trigger_queue_capacity, alerts.clone()));
        let worker = Arc::new(TriggerWorker::new(
            monitor.clone(),
            tracker.clone(),
            alerts.clone(),
            Duration::from_millis(config.sltp_drain_interval_ms),
            Duration::from_millis(config.trigger_timeout_ms),
        ));
        let liquidator = Arc::new(LiquidationEngine::new(
            store.clone(),
            tracker.clone(),
            ledger.clone(),
            monitor.clone(),
            broker.clone(),
            alerts.clone(),
            Duration::from_millis(config.liquidation_interval_ms),
            config.liquidation_max_slippage,
            config.liquidation_fee_rate,
        ));
        let reconciler = Arc::new(BrokerReconciler::new(
            store.clone(),
            broker.clone(),
            tracker.clone(),
            monitor.clone(),
            alerts.clone(),
            Duration::from_millis(config.reconciliation_interval_ms),
        ));
        let integrity = IntegrityChecker::new(
            store.clone(),
            events.clone(),
            coordinator.clone(),
            alerts.clone(),
            Duration::from_millis(config.recovery_max_duration_ms),
        );
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            config,
            store,
            coordinator,
            events,
            ledger,
            tracker,
            monitor,
            worker,
            liquidator,
            reconciler,
            integrity,
            broker,
            alerts,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the background loops: execution pump, trigger worker,
    /// liquidation and reconciliation. Also re-registers every open
    /// position with the monitor.
    pub async fn start(&self) -> EngineResult<()> {
        tracing::info!(build = env!("GIT_HASH"), "position engine starting");
        self.broker.connect().await?;

        for position in self.store.positions_by_status(PositionStatus::Open).await? {
            self.monitor.watch(&position);
        }

        let mut executions = self.broker.subscribe_executions().await?;
        let tracker = self.tracker.clone();
        let monitor = self.monitor.clone();
        let alerts = self.alerts.clone();
        let mut pump_shutdown = self.shutdown.subscribe();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    execution = executions.recv() => {
                        match execution {
                            Some(execution) => {
                                route_fill(&tracker, &monitor, &alerts, execution).await
                            }
                            None => break,
                        }
                    }
                    _ = pump_shutdown.changed() => {
                        if *pump_shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(pump);
        tasks.push(tokio::spawn(
            self.worker.clone().run(self.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(
            self.liquidator.clone().run(self.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(
            self.reconciler.clone().run(self.shutdown.subscribe()),
        ));
        Ok(())
    }

    /// Flip the shutdown flag and wait for every loop to exit
    pub async fn shutdown(&self) -> EngineResult<()> {
        let _ = self.shutdown.send(true);
        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }
        self.broker.disconnect().await?;
        tracing::info!("position engine stopped");
        Ok(())
    }

    /// Accept a signal: create the `Pending` position and reserve its
    /// margin atomically, then hand the order to the broker
    pub async fn open_position(&self, signal: TradeSignal) -> EngineResult<Position> {
        self.validate_signal(&signal)?;
        let margin = signal.margin_required();
        let now = Utc::now();

        let tx_signal = signal.clone();
        let position = self
            .coordinator
            .run_default("engine.open_position", move |mut txn| {
                let signal = tx_signal.clone();
                Box::pin(async move {
                    let result = create_position_tx(&mut *txn, &signal, margin, now).await;
                    (txn, result)
                })
            })
            .await?;

        let spec = OrderSpec {
            symbol: signal.symbol.clone(),
            side: signal.side,
            size: signal.size,
            limit_price: Some(signal.intent_price),
        };
        let order_id = match self.broker.place_order(&spec).await {
            Ok(order_id) => order_id,
            Err(err) => {
                // compensate: the broker never saw the order
                self.tracker.cancel_pending(position.id, Utc::now()).await?;
                return Err(err);
            }
        };

        self.tracker
            .register_order(&order_id, position.id, signal.size)
            .await?;
        self.record_order_placed(position.id, &order_id, signal.size)
            .await?;

        tracing::info!(
            position_id = %position.id,
            symbol = %position.symbol,
            side = %position.side,
            order_id,
            "position created"
        );
        Ok(position)
    }

    /// Route one broker execution report to the tracker
    pub async fn handle_execution(&self, execution: BrokerExecution) -> EngineResult<()> {
        handle_fill(&self.tracker, &self.monitor, execution).await
    }

    /// Fold one market tick: price cache, trigger detection, enqueue
    pub async fn on_price_tick(&self, symbol: &str, price: Decimal) -> usize {
        self.monitor
            .on_price_tick(&PriceTick {
                symbol: symbol.to_string(),
                price,
                at: Utc::now(),
            })
            .await
    }

    /// Adjust stop-loss / take-profit on an open position
    pub async fn update_protection(
        &self,
        position_id: PositionId,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> EngineResult<Position> {
        let position = self
            .coordinator
            .run_default("engine.update_protection", move |mut txn| {
                Box::pin(async move {
                    let result =
                        update_protection_tx(&mut *txn, position_id, stop_loss, take_profit).await;
                    (txn, result)
                })
            })
            .await?;
        self.monitor.watch(&position);
        Ok(position)
    }

    /// Manual full close at the caller's price
    pub async fn close_position(
        &self,
        position_id: PositionId,
        exit_price: Decimal,
    ) -> EngineResult<ClosureOutcome> {
        let outcome = self
            .tracker
            .close_manual(position_id, exit_price, Utc::now())
            .await?;
        self.monitor.unwatch(position_id).await;
        Ok(outcome)
    }

    /// Cancel a never-filled position
    pub async fn cancel_position(&self, position_id: PositionId) -> EngineResult<ClosureOutcome> {
        let outcome = self.tracker.cancel_pending(position_id, Utc::now()).await?;
        self.monitor.unwatch(position_id).await;
        Ok(outcome)
    }

    /// Retention sweep: Closed/Liquidated positions older than the cutoff
    /// move to `Archived`
    pub async fn archive_closed_positions(
        &self,
        older_than: chrono::Duration,
    ) -> EngineResult<usize> {
        let cutoff = Utc::now() - older_than;
        let mut archived = 0usize;
        for status in [PositionStatus::Closed, PositionStatus::Liquidated] {
            for position in self.store.positions_by_status(status).await? {
                let Some(closed_at) = position.closed_at else {
                    continue;
                };
                if closed_at > cutoff {
                    continue;
                }
                let position_id = position.id;
                self.coordinator
                    .run_default("engine.archive_position", move |mut txn| {
                        Box::pin(async move {
                            let result = archive_position_tx(&mut *txn, position_id).await;
                            (txn, result)
                        })
                    })
                    .await?;
                archived += 1;
            }
            tokio::task::yield_now().await;
        }
        Ok(archived)
    }

    pub async fn integrity_report(&self, account_id: &str) -> EngineResult<IntegrityReport> {
        self.integrity.check_account(account_id).await
    }

    pub async fn system_recovery(&self) -> EngineResult<RecoveryReport> {
        self.integrity.system_recovery().await
    }

    pub async fn replay(&self, position_id: PositionId) -> EngineResult<Option<Position>> {
        self.events.replay(position_id).await
    }

    fn validate_signal(&self, signal: &TradeSignal) -> EngineResult<()> {
        if signal.size <= Decimal::ZERO || signal.intent_price <= Decimal::ZERO {
            return Err(EngineError::InvalidFill(
                "signal size and price must be positive".to_string(),
            ));
        }
        if signal.leverage < Decimal::ONE || signal.leverage > self.config.max_leverage {
            return Err(EngineError::Config(format!(
                "leverage {} outside 1..={}",
                signal.leverage, self.config.max_leverage
            )));
        }
        let sanity = match signal.side {
            Side::Buy => {
                signal.stop_loss.is_none_or(|sl| sl < signal.intent_price)
                    && signal.take_profit.is_none_or(|tp| tp > signal.intent_price)
            }
            Side::Sell => {
                signal.stop_loss.is_none_or(|sl| sl > signal.intent_price)
                    && signal.take_profit.is_none_or(|tp| tp < signal.intent_price)
            }
        };
        if !sanity {
            return Err(EngineError::InvalidFill(
                "stop-loss / take-profit on the wrong side of the entry price".to_string(),
            ));
        }
        Ok(())
    }

    async fn record_order_placed(
        &self,
        position_id: PositionId,
        order_id: &str,
        size: Decimal,
    ) -> EngineResult<()> {
        let order_id = order_id.to_string();
        self.coordinator
            .run_default("engine.order_placed", move |mut txn| {
                let order_id = order_id.clone();
                Box::pin(async move {
                    let mut fields = serde_json::Map::new();
                    fields.insert("order_id".into(), json!(order_id));
                    fields.insert("size".into(), json!(size));
                    let event = PositionEvent::new(
                        position_id,
                        PositionEventType::OrderPlaced,
                        event_payload(fields),
                    );
                    let result = txn.insert_event(&event).await.map(|_| ());
                    (txn, result)
                })
            })
            .await
    }

    // component accessors, mostly for tests and embedding callers
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }
    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.tracker
    }
    pub fn monitor(&self) -> &Arc<SlTpMonitor> {
        &self.monitor
    }
    pub fn worker(&self) -> &Arc<TriggerWorker> {
        &self.worker
    }
    pub fn liquidator(&self) -> &Arc<LiquidationEngine> {
        &self.liquidator
    }
    pub fn reconciler(&self) -> &Arc<BrokerReconciler> {
        &self.reconciler
    }
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }
    pub fn events(&self) -> &EventStore {
        &self.events
    }
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

/// Resolve the order's position through the tracker map, record the fill,
/// and register completed positions with the monitor
async fn handle_fill(
    tracker: &ExecutionTracker,
    monitor: &SlTpMonitor,
    execution: BrokerExecution,
) -> EngineResult<()> {
    let tracker_entry = tracker
        .order_tracker(&execution.order_id)
        .await
        .ok_or_else(|| EngineError::OrderNotFound(execution.order_id.clone()))?;

    let outcome = tracker
        .record_execution(FillReport {
            position_id: tracker_entry.position_id,
            order_id: execution.order_id,
            price: execution.price,
            size: execution.size,
            executed_at: execution.executed_at,
        })
        .await?;

    if outcome.order_complete {
        monitor.watch(&outcome.position);
    }
    Ok(())
}

/// Pump-side wrapper: a rejected execution is alerted, never fatal
async fn route_fill(
    tracker: &Arc<ExecutionTracker>,
    monitor: &Arc<SlTpMonitor>,
    alerts: &Arc<dyn AlertSink>,
    execution: BrokerExecution,
) {
    let order_id = execution.order_id.clone();
    if let Err(err) = handle_fill(tracker, monitor, execution).await {
        alerts.raise(
            Alert::new(
                AlertSeverity::Warning,
                "engine.execution_rejected",
                format!("broker execution rejected: {err}"),
            )
            .with_fields(json!({ "order_id": order_id })),
        );
    }
}

// ------------------------------------------------------------
// Transactional bodies
// ------------------------------------------------------------

async fn create_position_tx(
    txn: &mut dyn StoreTxn,
    signal: &TradeSignal,
    margin: Decimal,
    now: chrono::DateTime<Utc>,
) -> EngineResult<Position> {
    let position = Position::new_pending(
        signal.account_id.clone(),
        signal.symbol.clone(),
        signal.side,
        signal.leverage,
        margin,
        signal.stop_loss,
        signal.take_profit,
        now,
    );
    txn.insert_position(&position).await?;

    let mut created = PositionEvent::new(
        position.id,
        PositionEventType::PositionCreated,
        created_payload(&position),
    )
    .with_created_at(now);
    created.new_status = Some(PositionStatus::Pending);
    txn.insert_event(&created).await?;

    reserve_margin_tx(txn, &signal.account_id, position.id, margin).await?;
    Ok(position)
}

async fn update_protection_tx(
    txn: &mut dyn StoreTxn,
    position_id: PositionId,
    stop_loss: Option<Decimal>,
    take_profit: Option<Decimal>,
) -> EngineResult<Position> {
    let mut position = txn
        .position(position_id, true)
        .await?
        .ok_or(EngineError::PositionNotFound(position_id))?;
    if !position.is_open() {
        return Err(EngineError::InvalidTransition {
            position_id,
            from: position.status,
            to: position.status,
        });
    }
    if let Some(sl) = stop_loss {
        position.stop_loss = Some(sl);
    }
    if let Some(tp) = take_profit {
        position.take_profit = Some(tp);
    }
    position.updated_at = Utc::now();
    txn.update_position(&position).await?;

    let event = PositionEvent::new(
        position.id,
        PositionEventType::PositionUpdated,
        update_payload(stop_loss, take_profit, None),
    );
    txn.insert_event(&event).await?;
    Ok(position)
}

async fn archive_position_tx(txn: &mut dyn StoreTxn, position_id: PositionId) -> EngineResult<()> {
    let mut position = txn
        .position(position_id, true)
        .await?
        .ok_or(EngineError::PositionNotFound(position_id))?;
    if position.status == PositionStatus::Archived {
        return Ok(());
    }
    transition(
        txn,
        &mut position,
        PositionStatus::Archived,
        PositionEventType::PositionUpdated,
        event_payload(serde_json::Map::new()),
        None,
        Utc::now(),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::TracingAlertSink;
    use crate::broker::PaperBroker;
    use crate::config::PaperTradingConfig;
    use crate::store::MemStore;
    use rust_decimal_macros::dec;

    fn paper_config() -> PaperTradingConfig {
        PaperTradingConfig {
            slippage_max_bps: 0,
            latency_min_ms: 0,
            latency_max_ms: 1,
            partial_fills_enabled: false,
            rejection_rate: 0.0,
            rng_seed: 1,
        }
    }

    struct Fixture {
        store: MemStore,
        broker: Arc<PaperBroker>,
        engine: Arc<PositionEngine>,
    }

    async fn fixture() -> Fixture {
        let store = MemStore::new();
        let broker = PaperBroker::new(paper_config());
        let engine = PositionEngine::new(
            Arc::new(store.clone()),
            broker.clone(),
            Arc::new(TracingAlertSink),
            EngineConfig::default(),
        );
        engine
            .ledger()
            .create_account("acc-1", dec!(100), true)
            .await
            .unwrap();
        engine
            .ledger()
            .deposit("acc-1", dec!(10000), "funding")
            .await
            .unwrap();
        Fixture {
            store,
            broker,
            engine,
        }
    }

    fn gold_signal() -> TradeSignal {
        TradeSignal {
            account_id: "acc-1".to_string(),
            symbol: "XAUUSD".to_string(),
            side: Side::Buy,
            size: dec!(0.2),
            intent_price: dec!(2000),
            leverage: dec!(1),
            stop_loss: Some(dec!(1990)),
            take_profit: Some(dec!(2020)),
        }
    }

    #[tokio::test]
    async fn signal_creates_pending_position_with_margin() {
        let f = fixture().await;
        f.broker.update_market_price("XAUUSD", dec!(2000));

        let position = f.engine.open_position(gold_signal()).await.unwrap();
        assert_eq!(position.status, PositionStatus::Pending);
        assert_eq!(position.margin_used, dec!(400));

        let account = f.store.account("acc-1").await.unwrap().unwrap();
        assert_eq!(account.margin_used, dec!(400));
        assert_eq!(account.free_margin, dec!(9600));
    }

    #[tokio::test]
    async fn insufficient_margin_rejects_the_whole_signal() {
        let f = fixture().await;
        f.broker.update_market_price("XAUUSD", dec!(2000));

        let mut signal = gold_signal();
        signal.size = dec!(100); // needs 200 000 margin
        let err = f.engine.open_position(signal).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientMargin { .. }));

        // nothing persisted
        assert!(
            f.store
                .positions_by_status(PositionStatus::Pending)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn bad_protective_levels_rejected() {
        let f = fixture().await;
        let mut signal = gold_signal();
        signal.stop_loss = Some(dec!(2050)); // above entry on a long
        let err = f.engine.open_position(signal).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidFill(_)));
    }

    #[tokio::test]
    async fn execution_opens_and_registers_monitoring() {
        let f = fixture().await;
        f.broker.update_market_price("XAUUSD", dec!(2000));
        let position = f.engine.open_position(gold_signal()).await.unwrap();

        f.engine
            .handle_execution(BrokerExecution {
                order_id: order_of(&f, position.id).await,
                price: dec!(2000),
                size: dec!(0.2),
                executed_at: Utc::now(),
            })
            .await
            .unwrap();

        let open = f.store.position(position.id).await.unwrap().unwrap();
        assert_eq!(open.status, PositionStatus::Open);
        assert_eq!(f.engine.monitor().monitored_count(), 1);
    }

    /// The paper order id is broker-assigned; recover it from the tracker
    async fn order_of(f: &Fixture, position_id: PositionId) -> String {
        for n in 1..100 {
            let order_id = format!("paper-{n}");
            if let Some(t) = f.engine.tracker().order_tracker(&order_id).await {
                if t.position_id == position_id {
                    return order_id;
                }
            }
        }
        panic!("no tracker registered for {position_id}");
    }

    #[tokio::test]
    async fn protection_update_is_evented_and_rewatches() {
        let f = fixture().await;
        f.broker.update_market_price("XAUUSD", dec!(2000));
        let position = f.engine.open_position(gold_signal()).await.unwrap();
        f.engine
            .handle_execution(BrokerExecution {
                order_id: order_of(&f, position.id).await,
                price: dec!(2000),
                size: dec!(0.2),
                executed_at: Utc::now(),
            })
            .await
            .unwrap();

        let updated = f
            .engine
            .update_protection(position.id, Some(dec!(1995)), None)
            .await
            .unwrap();
        assert_eq!(updated.stop_loss, Some(dec!(1995)));
        assert_eq!(updated.take_profit, Some(dec!(2020)));

        // SL update on a pending position is rejected
        let f2 = fixture().await;
        f2.broker.update_market_price("XAUUSD", dec!(2000));
        let pending = f2.engine.open_position(gold_signal()).await.unwrap();
        let err = f2
            .engine
            .update_protection(pending.id, Some(dec!(1995)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn archive_sweep_moves_old_closures() {
        let f = fixture().await;
        f.broker.update_market_price("XAUUSD", dec!(2000));
        let position = f.engine.open_position(gold_signal()).await.unwrap();
        f.engine
            .handle_execution(BrokerExecution {
                order_id: order_of(&f, position.id).await,
                price: dec!(2000),
                size: dec!(0.2),
                executed_at: Utc::now(),
            })
            .await
            .unwrap();
        f.engine
            .close_position(position.id, dec!(2010))
            .await
            .unwrap();

        // nothing is old enough yet
        assert_eq!(
            f.engine
                .archive_closed_positions(chrono::Duration::days(30))
                .await
                .unwrap(),
            0
        );
        // zero retention sweeps it
        assert_eq!(
            f.engine
                .archive_closed_positions(chrono::Duration::zero())
                .await
                .unwrap(),
            1
        );
        let archived = f.store.position(position.id).await.unwrap().unwrap();
        assert_eq!(archived.status, PositionStatus::Archived);
    }
}
