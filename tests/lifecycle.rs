//! End-to-end lifecycle scenarios against the in-memory store and the
//! paper broker: signal -> pending -> fills -> open -> trigger/liquidation/
//! reconciliation -> closed, with the ledger checked at every step.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use position_engine::alerts::{Alert, AlertSink, ChannelAlertSink};
use position_engine::broker::PaperBroker;
use position_engine::engine::{PositionEngine, TradeSignal};
use position_engine::store::{EventOrder, MemStore, Store};
use position_engine::tracker::ClosureOutcome;
use position_engine::types::{
    BalanceEventType, CloseReason, PositionEventType, PositionStatus, Side,
};
use position_engine::{BrokerExecution, EngineConfig, PaperTradingConfig};

struct Harness {
    store: MemStore,
    broker: Arc<PaperBroker>,
    engine: Arc<PositionEngine>,
    alerts_rx: tokio::sync::mpsc::UnboundedReceiver<Alert>,
}

fn deterministic_paper() -> PaperTradingConfig {
    PaperTradingConfig {
        slippage_max_bps: 0,
        latency_min_ms: 0,
        latency_max_ms: 1,
        partial_fills_enabled: false,
        rejection_rate: 0.0,
        rng_seed: 7,
    }
}

async fn harness_with(config: EngineConfig) -> Harness {
    let store = MemStore::new();
    let broker = PaperBroker::new(deterministic_paper());
    let (sink, alerts_rx) = ChannelAlertSink::new();
    let alerts: Arc<dyn AlertSink> = Arc::new(sink);
    let engine = PositionEngine::new(
        Arc::new(store.clone()),
        broker.clone(),
        alerts,
        config,
    );
    engine
        .ledger()
        .create_account("acc-1", dec!(100), true)
        .await
        .unwrap();
    engine
        .ledger()
        .deposit("acc-1", dec!(10000), "initial funding")
        .await
        .unwrap();
    Harness {
        store,
        broker,
        engine,
        alerts_rx,
    }
}

async fn harness() -> Harness {
    harness_with(EngineConfig::default()).await
}

/// Recover the broker-assigned order id for a position from the tracker
async fn order_of(h: &Harness, position_id: position_engine::PositionId) -> String {
    for n in 1..100 {
        let order_id = format!("paper-{n}");
        if let Some(t) = h.engine.tracker().order_tracker(&order_id).await {
            if t.position_id == position_id {
                return order_id;
            }
        }
    }
    panic!("no tracker registered for {position_id}");
}

async fn fill(h: &Harness, position_id: position_engine::PositionId, price: Decimal, size: Decimal) {
    let order_id = order_of(h, position_id).await;
    h.engine
        .handle_execution(BrokerExecution {
            order_id,
            price,
            size,
            executed_at: Utc::now(),
        })
        .await
        .unwrap();
}

fn event_kinds(events: &[position_engine::PositionEvent]) -> Vec<PositionEventType> {
    events.iter().map(|e| e.event_type).collect()
}

// ------------------------------------------------------------
// S1: full lifecycle, long, take-profit
// ------------------------------------------------------------

#[tokio::test]
async fn s1_full_lifecycle_long_take_profit() {
    let h = harness().await;
    h.broker.update_market_price("XAUUSD", dec!(2000));

    let position = h
        .engine
        .open_position(TradeSignal {
            account_id: "acc-1".to_string(),
            symbol: "XAUUSD".to_string(),
            side: Side::Buy,
            size: dec!(0.2),
            intent_price: dec!(2000.00),
            leverage: dec!(1),
            stop_loss: Some(dec!(1990.00)),
            take_profit: Some(dec!(2020.00)),
        })
        .await
        .unwrap();

    fill(&h, position.id, dec!(2000), dec!(0.2)).await;

    let open = h.store.position(position.id).await.unwrap().unwrap();
    assert_eq!(open.status, PositionStatus::Open);
    let account = h.store.account("acc-1").await.unwrap().unwrap();
    assert_eq!(account.margin_used, dec!(400));
    assert_eq!(account.free_margin, dec!(9600));

    // the take-profit tick enqueues, the worker closes
    assert_eq!(h.engine.on_price_tick("XAUUSD", dec!(2020.00)).await, 1);
    h.engine.worker().drain_step().await;

    let closed = h.store.position(position.id).await.unwrap().unwrap();
    assert_eq!(closed.status, PositionStatus::Closed);
    assert_eq!(closed.realized_pnl, dec!(4.00));
    assert_eq!(closed.close_reason, Some(CloseReason::TakeProfit));

    let events = h
        .store
        .events_by_position(position.id, EventOrder::Asc, None, 0)
        .await
        .unwrap();
    let triggers = events
        .iter()
        .filter(|e| e.event_type == PositionEventType::TakeProfitTriggered)
        .count();
    assert_eq!(triggers, 1);

    let account = h.store.account("acc-1").await.unwrap().unwrap();
    assert_eq!(account.balance, dec!(10004.00));
    assert_eq!(account.margin_used, Decimal::ZERO);

    // the audit trail passes integrity
    let report = h.engine.integrity_report("acc-1").await.unwrap();
    assert!(report.passed(), "violations: {:?}", report.violations);
}

// ------------------------------------------------------------
// S2: partial fills averaging
// ------------------------------------------------------------

#[tokio::test]
async fn s2_partial_fills_average_entry() {
    let h = harness().await;
    h.broker.update_market_price("EURUSD", dec!(1.2300));

    let position = h
        .engine
        .open_position(TradeSignal {
            account_id: "acc-1".to_string(),
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            size: dec!(100),
            intent_price: dec!(1.2300),
            leverage: dec!(100),
            stop_loss: None,
            take_profit: Some(dec!(1.30)),
        })
        .await
        .unwrap();

    fill(&h, position.id, dec!(1.2300), dec!(40)).await;
    fill(&h, position.id, dec!(1.2400), dec!(60)).await;

    let open = h.store.position(position.id).await.unwrap().unwrap();
    assert_eq!(open.status, PositionStatus::Open);
    assert!((open.avg_entry_price - dec!(1.23600)).abs() <= dec!(0.001));
    assert_eq!(open.size, dec!(100));

    let tracker = h
        .engine
        .tracker()
        .order_tracker(&order_of(&h, position.id).await)
        .await
        .unwrap();
    assert!(tracker.is_complete);
    assert_eq!(tracker.average_fill_price, dec!(1.236));

    let events = h
        .store
        .events_by_position(position.id, EventOrder::Asc, None, 0)
        .await
        .unwrap();
    assert_eq!(
        event_kinds(&events),
        vec![
            PositionEventType::PositionCreated,
            PositionEventType::OrderPlaced,
            PositionEventType::PartialFill,
            PositionEventType::OrderFilled,
            PositionEventType::PositionOpened,
        ]
    );
}

// ------------------------------------------------------------
// S3: stop-loss trigger on a short
// ------------------------------------------------------------

#[tokio::test]
async fn s3_stop_loss_on_sell() {
    let h = harness().await;
    h.broker.update_market_price("EURUSD", dec!(1.2000));

    let position = h
        .engine
        .open_position(TradeSignal {
            account_id: "acc-1".to_string(),
            symbol: "EURUSD".to_string(),
            side: Side::Sell,
            size: dec!(100000),
            intent_price: dec!(1.2000),
            leverage: dec!(100),
            stop_loss: Some(dec!(1.2010)),
            take_profit: None,
        })
        .await
        .unwrap();
    fill(&h, position.id, dec!(1.2000), dec!(100000)).await;

    // below the stop: nothing
    assert_eq!(h.engine.on_price_tick("EURUSD", dec!(1.2009)).await, 0);
    // at the stop: trigger
    assert_eq!(h.engine.on_price_tick("EURUSD", dec!(1.2010)).await, 1);
    // beyond the stop while already queued: no duplicate
    assert_eq!(h.engine.on_price_tick("EURUSD", dec!(1.2011)).await, 0);

    h.engine.worker().drain_step().await;

    let closed = h.store.position(position.id).await.unwrap().unwrap();
    assert_eq!(closed.status, PositionStatus::Closed);
    assert_eq!(closed.realized_pnl, dec!(-100.0));
    assert_eq!(closed.close_reason, Some(CloseReason::StopLoss));

    let events = h
        .store
        .events_by_position(position.id, EventOrder::Asc, None, 0)
        .await
        .unwrap();
    let stop_events = events
        .iter()
        .filter(|e| e.event_type == PositionEventType::StopLossTriggered)
        .count();
    assert_eq!(stop_events, 1);

    // once closed, further ticks cannot re-trigger
    assert_eq!(h.engine.on_price_tick("EURUSD", dec!(1.2050)).await, 0);
}

// ------------------------------------------------------------
// S4: idempotent duplicate trigger delivery
// ------------------------------------------------------------

#[tokio::test]
async fn s4_duplicate_trigger_is_one_closure() {
    let h = harness().await;
    h.broker.update_market_price("EURUSD", dec!(1.2000));

    let position = h
        .engine
        .open_position(TradeSignal {
            account_id: "acc-1".to_string(),
            symbol: "EURUSD".to_string(),
            side: Side::Sell,
            size: dec!(100000),
            intent_price: dec!(1.2000),
            leverage: dec!(100),
            stop_loss: Some(dec!(1.2010)),
            take_profit: None,
        })
        .await
        .unwrap();
    fill(&h, position.id, dec!(1.2000), dec!(100000)).await;

    let triggered_at = Utc::now();
    let first = h
        .engine
        .tracker()
        .trigger_stop_loss(position.id, dec!(1.2010), triggered_at)
        .await
        .unwrap();
    assert!(first.is_effective());

    let balance_events_after_first = h.store.balance_events_by_account("acc-1").await.unwrap();
    let executions_after_first = h.store.executions_by_position(position.id).await.unwrap();
    let events_after_first = h.store.count_events_by_position(position.id).await.unwrap();

    // identical delivery: same position, same timestamp
    let second = h
        .engine
        .tracker()
        .trigger_stop_loss(position.id, dec!(1.2010), triggered_at)
        .await
        .unwrap();
    assert!(matches!(second, ClosureOutcome::DuplicateTrigger));

    assert_eq!(
        h.store.balance_events_by_account("acc-1").await.unwrap(),
        balance_events_after_first
    );
    assert_eq!(
        h.store.executions_by_position(position.id).await.unwrap(),
        executions_after_first
    );
    assert_eq!(
        h.store.count_events_by_position(position.id).await.unwrap(),
        events_after_first
    );

    // exactly one PnlRealized for the position
    let pnl_events = balance_events_after_first
        .iter()
        .filter(|e| {
            e.event_type == BalanceEventType::PnlRealized && e.position_id == Some(position.id)
        })
        .count();
    assert_eq!(pnl_events, 1);
}

// ------------------------------------------------------------
// S5: reconciler repairs a broker-closed position
// ------------------------------------------------------------

#[tokio::test]
async fn s5_reconciler_syncs_broker_closed_position() {
    let mut h = harness().await;
    h.broker.update_market_price("EURUSD", dec!(1.2000));

    let position = h
        .engine
        .open_position(TradeSignal {
            account_id: "acc-1".to_string(),
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            size: dec!(1000),
            intent_price: dec!(1.2000),
            leverage: dec!(100),
            stop_loss: None,
            take_profit: None,
        })
        .await
        .unwrap();
    fill(&h, position.id, dec!(1.2000), dec!(1000)).await;

    // broker reports no open positions at all
    let report = h.engine.reconciler().reconcile_once().await.unwrap();
    assert_eq!(report.repaired, 1);

    let repaired = h.store.position(position.id).await.unwrap().unwrap();
    assert_eq!(repaired.status, PositionStatus::Closed);
    assert_eq!(
        repaired.close_reason,
        Some(CloseReason::BrokerReconciliation)
    );

    let account = h.store.account("acc-1").await.unwrap().unwrap();
    assert_eq!(account.margin_used, Decimal::ZERO);

    let codes: Vec<&str> = std::iter::from_fn(|| h.alerts_rx.try_recv().ok())
        .map(|a| a.code)
        .collect();
    assert!(codes.contains(&"reconciler.position_synced"));

    // the ledger still passes after the repair
    let integrity = h.engine.integrity_report("acc-1").await.unwrap();
    assert!(integrity.passed(), "violations: {:?}", integrity.violations);
}

// ------------------------------------------------------------
// S6: liquidation cascade, worst loss first, halts on recovery
// ------------------------------------------------------------

#[tokio::test]
async fn s6_liquidation_cascade_halts_after_recovery() {
    let mut config = EngineConfig::default();
    // thresholds scaled so a 0.625 margin level breaches
    config.margin_call_level = dec!(0.9);
    config.liquidation_level = dec!(0.7);
    config.liquidation_max_slippage = Decimal::ZERO;
    let h = harness_with(config).await;

    // shrink the account to the scenario's 1 000 balance
    h.engine
        .ledger()
        .withdraw("acc-1", dec!(9000), "scenario sizing")
        .await
        .unwrap();

    h.broker.update_market_price("AAA", dec!(1000));
    h.broker.update_market_price("BBB", dec!(1000));

    let open_signal = |symbol: &str| TradeSignal {
        account_id: "acc-1".to_string(),
        symbol: symbol.to_string(),
        side: Side::Buy,
        size: dec!(1),
        intent_price: dec!(1000),
        leverage: dec!(2.5), // margin 400 each
        stop_loss: None,
        take_profit: None,
    };

    let worst = h.engine.open_position(open_signal("AAA")).await.unwrap();
    fill(&h, worst.id, dec!(1000), dec!(1)).await;
    let better = h.engine.open_position(open_signal("BBB")).await.unwrap();
    fill(&h, better.id, dec!(1000), dec!(1)).await;

    // unrealized: AAA -300, BBB -200 => level (1000-500)/800 = 0.625
    h.engine.on_price_tick("AAA", dec!(700)).await;
    h.engine.on_price_tick("BBB", dec!(800)).await;

    let check = h.engine.liquidator().check_account("acc-1").await.unwrap();
    assert_eq!(
        check,
        position_engine::liquidation::LiquidationCheck::Liquidated(1)
    );

    // worst loss went first; recheck halted the cascade
    let worst_after = h.store.position(worst.id).await.unwrap().unwrap();
    assert_eq!(worst_after.status, PositionStatus::Liquidated);
    let better_after = h.store.position(better.id).await.unwrap().unwrap();
    assert_eq!(better_after.status, PositionStatus::Open);

    let account = h.store.account("acc-1").await.unwrap().unwrap();
    assert_eq!(account.margin_used, dec!(400));
}

// ------------------------------------------------------------
// Fully wired: background loops end to end
// ------------------------------------------------------------

#[tokio::test]
async fn engine_loops_close_take_profit_end_to_end() {
    let mut config = EngineConfig::default();
    config.sltp_drain_interval_ms = 5;
    let h = harness_with(config).await;
    h.broker.update_market_price("XAUUSD", dec!(2000));

    h.engine.start().await.unwrap();

    let position = h
        .engine
        .open_position(TradeSignal {
            account_id: "acc-1".to_string(),
            symbol: "XAUUSD".to_string(),
            side: Side::Buy,
            size: dec!(0.2),
            intent_price: dec!(2000),
            leverage: dec!(1),
            stop_loss: Some(dec!(1990)),
            take_profit: Some(dec!(2020)),
        })
        .await
        .unwrap();

    // paper fills arrive through the pump
    wait_for(&h, position.id, PositionStatus::Open).await;

    h.engine.on_price_tick("XAUUSD", dec!(2020)).await;
    wait_for(&h, position.id, PositionStatus::Closed).await;

    let closed = h.store.position(position.id).await.unwrap().unwrap();
    assert_eq!(closed.realized_pnl, dec!(4.0));

    h.engine.shutdown().await.unwrap();
}

async fn wait_for(h: &Harness, position_id: position_engine::PositionId, status: PositionStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let position = h.store.position(position_id).await.unwrap().unwrap();
        if position.status == status {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "position {position_id} never reached {status:?} (is {:?})",
            position.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
