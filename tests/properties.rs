//! Property-based suite for the quantified invariants: ledger equations,
//! partial-fill arithmetic, replay determinism, closure idempotency, lock
//! compatibility and reconciler convergence.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::runtime::Runtime;
use uuid::Uuid;

use position_engine::broker::{BrokerPosition, PaperBroker};
use position_engine::events::{EventStore, created_payload, fill_payload};
use position_engine::ledger::{Ledger, MarginThresholds};
use position_engine::locks::{LockManager, LockMode};
use position_engine::models::{OrderTracker, Position, PositionEvent};
use position_engine::monitor::SlTpMonitor;
use position_engine::reconciler::BrokerReconciler;
use position_engine::store::{MemStore, Store, StoreTxn};
use position_engine::tracker::{ClosureOutcome, ExecutionTracker};
use position_engine::txn::{TransactionCoordinator, TxOptions};
use position_engine::types::{
    BalanceEventType, PositionEventType, PositionStatus, Side,
};
use position_engine::{AlertSink, PaperTradingConfig, TracingAlertSink};

/// Money amounts with two decimal places, strictly positive
fn money() -> impl Strategy<Value = Decimal> {
    (1i64..5_000_00).prop_map(|cents| Decimal::new(cents, 2))
}

/// Signed P&L amounts
fn pnl() -> impl Strategy<Value = Decimal> {
    (-2_000_00i64..2_000_00).prop_map(|cents| Decimal::new(cents, 2))
}

fn side() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Buy), Just(Side::Sell)]
}

#[derive(Debug, Clone)]
enum LedgerOp {
    Deposit(Decimal),
    Withdraw(Decimal),
    Reserve(Decimal),
    Release(Decimal),
    Realize(Decimal),
}

fn ledger_op() -> impl Strategy<Value = LedgerOp> {
    prop_oneof![
        money().prop_map(LedgerOp::Deposit),
        money().prop_map(LedgerOp::Withdraw),
        money().prop_map(LedgerOp::Reserve),
        money().prop_map(LedgerOp::Release),
        pnl().prop_map(LedgerOp::Realize),
    ]
}

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("runtime")
}

fn ledger_fixture(store: &MemStore) -> Ledger {
    let coordinator = Arc::new(TransactionCoordinator::new(
        Arc::new(store.clone()),
        TxOptions::default(),
    ));
    Ledger::new(coordinator, MarginThresholds::default())
}

fn tracker_fixture(store: &MemStore) -> ExecutionTracker {
    let coordinator = Arc::new(TransactionCoordinator::new(
        Arc::new(store.clone()),
        TxOptions::default(),
    ));
    let events = EventStore::new(Arc::new(store.clone()), 100, None);
    ExecutionTracker::new(coordinator, events, None)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    // Properties 1 & 2: every balance event satisfies the equation, and
    // the running sum of amounts equals the cash balance, at any point in
    // an arbitrary operation sequence (rejected operations included).
    #[test]
    fn ledger_equation_and_sum_hold(ops in prop::collection::vec(ledger_op(), 1..40)) {
        runtime().block_on(async move {
            let store = MemStore::new();
            let ledger = ledger_fixture(&store);
            ledger.create_account("acc-p", dec!(100), true).await.unwrap();
            ledger.deposit("acc-p", dec!(1000), "seed").await.unwrap();
            let position_id = Uuid::new_v4();

            // keep the orphan check quiet: the linked position exists
            let position = Position::new_pending(
                "acc-p".to_string(),
                "SYM".to_string(),
                Side::Buy,
                dec!(100),
                Decimal::ZERO,
                None,
                None,
                Utc::now(),
            );
            let mut seeded = position.clone();
            seeded.id = position_id;
            let mut txn = store.begin(Default::default()).await.unwrap();
            txn.insert_position(&seeded).await.unwrap();
            txn.commit().await.unwrap();

            for op in ops {
                // rejections (insufficient margin) are part of the property:
                // they must leave no partial effects behind
                let _ = match op {
                    LedgerOp::Deposit(amount) => {
                        ledger.deposit("acc-p", amount, "deposit").await
                    }
                    LedgerOp::Withdraw(amount) => {
                        ledger.withdraw("acc-p", amount, "withdraw").await
                    }
                    LedgerOp::Reserve(amount) => {
                        ledger.reserve_margin("acc-p", position_id, amount).await
                    }
                    LedgerOp::Release(amount) => {
                        ledger.release_margin("acc-p", position_id, amount).await
                    }
                    LedgerOp::Realize(amount) => {
                        ledger.realize_pnl("acc-p", position_id, amount, "pnl").await
                    }
                };

                let account = store.account("acc-p").await.unwrap().unwrap();
                let events = store.balance_events_by_account("acc-p").await.unwrap();
                let sum: Decimal = events.iter().map(|e| e.amount).sum();
                prop_assert!((account.balance - sum).abs() <= dec!(0.01));
                for event in &events {
                    prop_assert!(event.equation_error() <= dec!(0.0001));
                }
                prop_assert!(account.margin_used >= Decimal::ZERO);
                prop_assert_eq!(
                    account.free_margin,
                    account.equity - account.margin_used
                );
            }
            Ok(())
        })?;
    }

    // Property 5: partial-fill arithmetic on an arbitrary fill sequence
    #[test]
    fn tracker_arithmetic_holds(
        sizes in prop::collection::vec(1u32..1000, 1..20),
        prices in prop::collection::vec(1u32..100_000, 20),
    ) {
        let original: Decimal = sizes.iter().map(|s| Decimal::from(*s)).sum();
        let mut tracker = OrderTracker::new("ord-p", Uuid::new_v4(), original);

        let mut cumulative = Decimal::ZERO;
        let mut weighted = Decimal::ZERO;
        let mut at = Utc::now();
        for (i, size) in sizes.iter().enumerate() {
            let size = Decimal::from(*size);
            let price = Decimal::new(prices[i] as i64, 4);
            tracker.apply_fill(price, size, at);
            at += ChronoDuration::seconds(2);

            cumulative += size;
            weighted += price * size;

            prop_assert_eq!(tracker.filled_size, cumulative);
            prop_assert_eq!(tracker.remaining_size, original - cumulative);
            prop_assert_eq!(
                tracker.filled_size + tracker.remaining_size,
                tracker.original_size
            );
            prop_assert_eq!(tracker.is_complete, tracker.remaining_size.is_zero());
            // size-weighted mean within the monetary tolerance
            let expected = weighted / cumulative;
            prop_assert!((tracker.average_fill_price - expected).abs() <= dec!(0.0001));
            prop_assert_eq!(tracker.fill_sequence, (i + 1) as u32);
        }
        prop_assert!(tracker.is_complete);
    }

    // Property 6 (transition half): the allowed set is exactly the table
    #[test]
    fn state_machine_accepts_only_the_table(from_idx in 0usize..5, to_idx in 0usize..5) {
        use position_engine::state_machine::is_allowed;
        let all = [
            PositionStatus::Pending,
            PositionStatus::Open,
            PositionStatus::Closed,
            PositionStatus::Liquidated,
            PositionStatus::Archived,
        ];
        let from = all[from_idx];
        let to = all[to_idx];
        let table = [
            (PositionStatus::Pending, PositionStatus::Open),
            (PositionStatus::Pending, PositionStatus::Closed),
            (PositionStatus::Open, PositionStatus::Closed),
            (PositionStatus::Open, PositionStatus::Liquidated),
            (PositionStatus::Closed, PositionStatus::Archived),
            (PositionStatus::Liquidated, PositionStatus::Archived),
        ];
        prop_assert_eq!(is_allowed(from, to), table.contains(&(from, to)));
    }

    // Property 7: two independent replays of the same log are identical,
    // and match the position the live fill path produced
    #[test]
    fn replay_is_deterministic(
        fills in prop::collection::vec((1u32..500, 1u32..100_000), 1..15),
    ) {
        runtime().block_on(async move {
            let store = MemStore::new();
            let position = Position::new_pending(
                "acc-p".to_string(),
                "SYM".to_string(),
                Side::Buy,
                dec!(100),
                dec!(10),
                None,
                None,
                Utc::now(),
            );

            let mut txn = store.begin(Default::default()).await.unwrap();
            txn.insert_position(&position).await.unwrap();
            txn.insert_event(
                &PositionEvent::new(
                    position.id,
                    PositionEventType::PositionCreated,
                    created_payload(&position),
                )
                .with_created_at(position.created_at),
            )
            .await
            .unwrap();
            let mut at = position.created_at;
            for (i, (size, price)) in fills.iter().enumerate() {
                at += ChronoDuration::milliseconds(10);
                let event_type = if i + 1 == fills.len() {
                    PositionEventType::OrderFilled
                } else {
                    PositionEventType::PartialFill
                };
                txn.insert_event(
                    &PositionEvent::new(
                        position.id,
                        event_type,
                        fill_payload("ord-p", Decimal::new(*price as i64, 4), Decimal::from(*size)),
                    )
                    .with_created_at(at),
                )
                .await
                .unwrap();
            }
            txn.commit().await.unwrap();

            // small batch size forces several yielding rounds
            let events = EventStore::new(Arc::new(store), 3, None);
            let first = events.replay(position.id).await.unwrap().unwrap();
            let second = events.replay(position.id).await.unwrap().unwrap();
            prop_assert_eq!(&first, &second);
            prop_assert_eq!(
                serde_json::to_vec(&first).unwrap(),
                serde_json::to_vec(&second).unwrap()
            );

            let expected_size: Decimal = fills.iter().map(|(s, _)| Decimal::from(*s)).sum();
            prop_assert_eq!(first.size, expected_size);
            Ok(())
        })?;
    }

    // Property 8: the same closure trigger applied twice produces exactly
    // one closure, one event, one execution, one PnlRealized
    #[test]
    fn closure_is_idempotent(
        entry in 1u32..100_000,
        exit in 1u32..100_000,
        trigger_side in side(),
        delay_ms in 0i64..5_000,
    ) {
        runtime().block_on(async move {
            let store = MemStore::new();
            let ledger = ledger_fixture(&store);
            let tracker = tracker_fixture(&store);
            ledger.create_account("acc-p", dec!(100), true).await.unwrap();
            ledger.deposit("acc-p", dec!(100000), "seed").await.unwrap();

            let mut position = Position::new_pending(
                "acc-p".to_string(),
                "SYM".to_string(),
                trigger_side,
                dec!(100),
                dec!(50),
                None,
                None,
                Utc::now(),
            );
            position.size = dec!(10);
            position.avg_entry_price = Decimal::new(entry as i64, 4);
            position.status = PositionStatus::Open;
            let mut txn = store.begin(Default::default()).await.unwrap();
            txn.insert_position(&position).await.unwrap();
            txn.insert_event(&PositionEvent::new(
                position.id,
                PositionEventType::PositionCreated,
                created_payload(&position),
            ))
            .await
            .unwrap();
            txn.commit().await.unwrap();
            ledger.reserve_margin("acc-p", position.id, dec!(50)).await.unwrap();

            let triggered_at = Utc::now() + ChronoDuration::milliseconds(delay_ms);
            let exit_price = Decimal::new(exit as i64, 4);

            let first = tracker
                .trigger_stop_loss(position.id, exit_price, triggered_at)
                .await
                .unwrap();
            prop_assert!(first.is_effective());
            let second = tracker
                .trigger_stop_loss(position.id, exit_price, triggered_at)
                .await
                .unwrap();
            prop_assert!(matches!(second, ClosureOutcome::DuplicateTrigger));

            let events = store
                .events_by_position(position.id, Default::default(), None, 0)
                .await
                .unwrap();
            let closures = events
                .iter()
                .filter(|e| e.event_type == PositionEventType::StopLossTriggered)
                .count();
            prop_assert_eq!(closures, 1);
            prop_assert_eq!(
                store.executions_by_position(position.id).await.unwrap().len(),
                1
            );
            let pnl_events = store
                .balance_events_by_account("acc-p")
                .await
                .unwrap()
                .into_iter()
                .filter(|e| {
                    e.event_type == BalanceEventType::PnlRealized
                        && e.position_id == Some(position.id)
                })
                .count();
            prop_assert_eq!(pnl_events, 1);
            Ok(())
        })?;
    }

    // Property 9: lock compatibility matrix
    #[test]
    fn lock_compatibility(first in 0usize..3, second in 0usize..3) {
        runtime().block_on(async move {
            let modes = [LockMode::Read, LockMode::Write, LockMode::Exclusive];
            let a = modes[first];
            let b = modes[second];

            let locks = LockManager::new();
            let _guard = locks
                .acquire("owner-a", "res", a, std::time::Duration::from_millis(50))
                .await
                .unwrap();
            let result = locks
                .acquire("owner-b", "res", b, std::time::Duration::from_millis(20))
                .await;

            let expect_shared = a == LockMode::Read && b == LockMode::Read;
            prop_assert_eq!(result.is_ok(), expect_shared);
            Ok(())
        })?;
    }

    // Property 10: after one reconciliation cycle, every (symbol, side)
    // the broker reports closed is closed in the store too, and the
    // ledger equations survive the repairs
    #[test]
    fn reconciler_converges(
        db_spec in prop::collection::vec(("[A-E]", side()), 0..6),
        broker_spec in prop::collection::vec(("[A-E]", side()), 0..6),
    ) {
        runtime().block_on(async move {
            let store = MemStore::new();
            let ledger = ledger_fixture(&store);
            let tracker = Arc::new(tracker_fixture(&store));
            ledger.create_account("acc-p", dec!(100), true).await.unwrap();
            ledger.deposit("acc-p", dec!(100000), "seed").await.unwrap();

            // DB-open positions
            for (symbol, side) in &db_spec {
                let mut position = Position::new_pending(
                    "acc-p".to_string(),
                    symbol.clone(),
                    *side,
                    dec!(100),
                    dec!(10),
                    None,
                    None,
                    Utc::now(),
                );
                position.size = dec!(1);
                position.avg_entry_price = dec!(100);
                position.status = PositionStatus::Open;
                let mut txn = store.begin(Default::default()).await.unwrap();
                txn.insert_position(&position).await.unwrap();
                txn.insert_event(&PositionEvent::new(
                    position.id,
                    PositionEventType::PositionCreated,
                    created_payload(&position),
                ))
                .await
                .unwrap();
                txn.commit().await.unwrap();
                ledger
                    .reserve_margin("acc-p", position.id, dec!(10))
                    .await
                    .unwrap();
            }

            let broker = PaperBroker::new(PaperTradingConfig::default());
            let broker_positions: Vec<BrokerPosition> = broker_spec
                .iter()
                .enumerate()
                .map(|(i, (symbol, side))| BrokerPosition {
                    position_id: format!("br-{i}"),
                    symbol: symbol.clone(),
                    side: *side,
                    size: dec!(1),
                    entry_price: dec!(100),
                    current_price: dec!(100),
                    unrealized_pnl: Decimal::ZERO,
                    margin_used: dec!(10),
                })
                .collect();
            broker.set_open_positions(broker_positions.clone()).await;

            let alerts: Arc<dyn AlertSink> = Arc::new(TracingAlertSink);
            let monitor = Arc::new(SlTpMonitor::new(100, alerts.clone()));
            let reconciler = BrokerReconciler::new(
                Arc::new(store.clone()),
                broker,
                tracker,
                monitor,
                alerts,
                std::time::Duration::from_secs(10),
            );
            reconciler.reconcile_once().await.unwrap();

            // convergence: for every (symbol, side) the store still holds
            // open, the broker must have reported at least as many
            let open_after = store.positions_by_status(PositionStatus::Open).await.unwrap();
            for position in &open_after {
                let broker_count = broker_positions
                    .iter()
                    .filter(|b| b.symbol == position.symbol && b.side == position.side)
                    .count();
                let db_count = open_after
                    .iter()
                    .filter(|p| p.symbol == position.symbol && p.side == position.side)
                    .count();
                prop_assert!(
                    db_count <= broker_count,
                    "store still open beyond broker view for {} {:?}",
                    position.symbol,
                    position.side
                );
            }

            // ledger equations survive the repairs
            let account = store.account("acc-p").await.unwrap().unwrap();
            let events = store.balance_events_by_account("acc-p").await.unwrap();
            let sum: Decimal = events.iter().map(|e| e.amount).sum();
            prop_assert!((account.balance - sum).abs() <= dec!(0.01));
            Ok(())
        })?;
    }
}

// Properties 3 & 4 (coverage and no orphans) over a randomized lifecycle
proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn closed_positions_have_full_coverage(
        count in 1usize..5,
        close_mask in prop::collection::vec(any::<bool>(), 5),
    ) {
        runtime().block_on(async move {
            let store = MemStore::new();
            let ledger = ledger_fixture(&store);
            let tracker = tracker_fixture(&store);
            ledger.create_account("acc-p", dec!(100), true).await.unwrap();
            ledger.deposit("acc-p", dec!(100000), "seed").await.unwrap();

            let mut ids = Vec::new();
            for i in 0..count {
                let mut position = Position::new_pending(
                    "acc-p".to_string(),
                    format!("SYM{i}"),
                    Side::Buy,
                    dec!(100),
                    dec!(25),
                    None,
                    None,
                    Utc::now(),
                );
                position.size = dec!(1);
                position.avg_entry_price = dec!(100);
                position.status = PositionStatus::Open;
                let mut txn = store.begin(Default::default()).await.unwrap();
                txn.insert_position(&position).await.unwrap();
                txn.insert_event(&PositionEvent::new(
                    position.id,
                    PositionEventType::PositionCreated,
                    created_payload(&position),
                ))
                .await
                .unwrap();
                txn.commit().await.unwrap();
                ledger.reserve_margin("acc-p", position.id, dec!(25)).await.unwrap();
                ids.push(position.id);
            }

            for (i, id) in ids.iter().enumerate() {
                if close_mask[i] {
                    tracker.close_manual(*id, dec!(101), Utc::now()).await.unwrap();
                }
            }

            let events = store.balance_events_by_account("acc-p").await.unwrap();
            for (i, id) in ids.iter().enumerate() {
                let has = |t: BalanceEventType| {
                    events
                        .iter()
                        .any(|e| e.event_type == t && e.position_id == Some(*id))
                };
                // property 3: closed => full coverage
                prop_assert!(has(BalanceEventType::MarginReserved));
                if close_mask[i] {
                    prop_assert!(has(BalanceEventType::MarginReleased));
                    prop_assert!(has(BalanceEventType::PnlRealized));
                }
            }
            // property 4: no orphans - every linked position exists
            for event in &events {
                if let Some(position_id) = event.position_id {
                    prop_assert!(store.position(position_id).await.unwrap().is_some());
                }
            }
            Ok(())
        })?;
    }
}
