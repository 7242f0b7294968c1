//! SL/TP monitor: per-symbol price cache, monitored-position index and
//! trigger detection (C6).
//!
//! A price tick only touches positions watching that symbol. Detection is
//! cheap and synchronous; execution is not done here - detected triggers
//! are enqueued and a single worker drains them, so a burst of ticks can
//! never stall the price path behind closures.

pub mod queue;
pub mod worker;

pub use queue::{
    PendingTrigger, PushOutcome, RiskLevel, TriggerKind, TriggerQueue, Urgency, distance_pct,
    priority_score, risk_for, urgency_for,
};
pub use worker::{TriggerWorker, WorkerStats};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use rustc_hash::FxHashSet;
use serde_json::json;
use tokio::sync::Mutex;

use crate::alerts::{Alert, AlertSeverity, AlertSink};
use crate::models::Position;
use crate::types::{AccountId, PositionId, Side};

/// One market-data update
#[derive(Debug, Clone)]
pub struct PriceTick {
    pub symbol: String,
    pub price: Decimal,
    pub at: DateTime<Utc>,
}

/// Snapshot of the fields trigger evaluation needs; refreshed whenever the
/// position changes (fills, partial exits, SL/TP updates)
#[derive(Debug, Clone)]
struct MonitoredPosition {
    position_id: PositionId,
    account_id: AccountId,
    symbol: String,
    side: Side,
    size: Decimal,
    avg_entry_price: Decimal,
    stop_loss: Option<Decimal>,
    take_profit: Option<Decimal>,
}

impl MonitoredPosition {
    fn from_position(position: &Position) -> Self {
        MonitoredPosition {
            position_id: position.id,
            account_id: position.account_id.clone(),
            symbol: position.symbol.clone(),
            side: position.side,
            size: position.size,
            avg_entry_price: position.avg_entry_price,
            stop_loss: position.stop_loss,
            take_profit: position.take_profit,
        }
    }
}

/// SL fires at-or-beyond the stop, TP at-or-beyond the target, each on the
/// side's adverse/favorable direction. When a tick satisfies both (gapped
/// market with SL/TP inverted), the stop wins.
pub fn evaluate_trigger(
    side: Side,
    price: Decimal,
    stop_loss: Option<Decimal>,
    take_profit: Option<Decimal>,
) -> Option<(TriggerKind, Decimal)> {
    let stop_hit = stop_loss.filter(|sl| match side {
        Side::Buy => price <= *sl,
        Side::Sell => price >= *sl,
    });
    if let Some(sl) = stop_hit {
        return Some((TriggerKind::StopLoss, sl));
    }
    let target_hit = take_profit.filter(|tp| match side {
        Side::Buy => price >= *tp,
        Side::Sell => price <= *tp,
    });
    target_hit.map(|tp| (TriggerKind::TakeProfit, tp))
}

/// The monitor (C6 detection half)
pub struct SlTpMonitor {
    prices: DashMap<String, (Decimal, DateTime<Utc>)>,
    by_symbol: DashMap<String, FxHashSet<PositionId>>,
    monitored: DashMap<PositionId, MonitoredPosition>,
    queue: Arc<Mutex<TriggerQueue>>,
    alerts: Arc<dyn AlertSink>,
}

impl SlTpMonitor {
    pub fn new(queue_capacity: usize, alerts: Arc<dyn AlertSink>) -> Self {
        Self {
            prices: DashMap::new(),
            by_symbol: DashMap::new(),
            monitored: DashMap::new(),
            queue: Arc::new(Mutex::new(TriggerQueue::new(queue_capacity))),
            alerts,
        }
    }

    /// Shared handle for the drain worker
    pub fn queue(&self) -> Arc<Mutex<TriggerQueue>> {
        self.queue.clone()
    }

    pub fn latest_price(&self, symbol: &str) -> Option<Decimal> {
        self.prices.get(symbol).map(|entry| entry.0)
    }

    pub fn monitored_count(&self) -> usize {
        self.monitored.len()
    }

    /// Start (or refresh) monitoring of an open position. Positions with
    /// neither stop nor target are not watched.
    pub fn watch(&self, position: &Position) {
        if !position.is_open()
            || (position.stop_loss.is_none() && position.take_profit.is_none())
        {
            self.unwatch_sync(position.id, &position.symbol);
            return;
        }
        let snapshot = MonitoredPosition::from_position(position);
        self.by_symbol
            .entry(snapshot.symbol.clone())
            .or_default()
            .insert(snapshot.position_id);
        self.monitored.insert(snapshot.position_id, snapshot);
    }

    /// Stop monitoring immediately (closure, cancellation, liquidation)
    pub async fn unwatch(&self, position_id: PositionId) {
        if let Some((_, snapshot)) = self.monitored.remove(&position_id) {
            if let Some(mut set) = self.by_symbol.get_mut(&snapshot.symbol) {
                set.remove(&position_id);
            }
        }
        self.queue.lock().await.remove(position_id);
    }

    fn unwatch_sync(&self, position_id: PositionId, symbol: &str) {
        self.monitored.remove(&position_id);
        if let Some(mut set) = self.by_symbol.get_mut(symbol) {
            set.remove(&position_id);
        }
    }

    /// Fold one tick in: refresh the cache, re-evaluate only the positions
    /// watching this symbol, enqueue what fired. Returns the number of
    /// triggers enqueued.
    pub async fn on_price_tick(&self, tick: &PriceTick) -> usize {
        self.prices
            .insert(tick.symbol.clone(), (tick.price, tick.at));

        let watchers: Vec<PositionId> = match self.by_symbol.get(&tick.symbol) {
            Some(set) => set.iter().copied().collect(),
            None => return 0,
        };

        let mut enqueued = 0;
        for position_id in watchers {
            let snapshot = match self.monitored.get(&position_id) {
                Some(snapshot) => snapshot.clone(),
                None => continue,
            };
            let Some((kind, trigger_price)) =
                evaluate_trigger(snapshot.side, tick.price, snapshot.stop_loss, snapshot.take_profit)
            else {
                continue;
            };

            let notional = snapshot.avg_entry_price * snapshot.size;
            let upnl = (tick.price - snapshot.avg_entry_price)
                * snapshot.size
                * Decimal::from(snapshot.side.direction());
            let loss_ratio = if notional.is_zero() {
                Decimal::ZERO
            } else {
                (-upnl).max(Decimal::ZERO) / notional
            };

            let trigger = PendingTrigger {
                position_id: snapshot.position_id,
                account_id: snapshot.account_id.clone(),
                symbol: snapshot.symbol.clone(),
                side: snapshot.side,
                kind,
                trigger_price,
                current_price: tick.price,
                position_size: snapshot.size,
                risk: risk_for(loss_ratio),
                urgency: urgency_for(tick.price, trigger_price),
                detected_at: tick.at,
            };

            match self.queue.lock().await.push(trigger, tick.at) {
                PushOutcome::Queued => enqueued += 1,
                PushOutcome::AlreadyQueued => {}
                PushOutcome::QueuedEvicting(evicted) => {
                    enqueued += 1;
                    self.alerts.raise(
                        Alert::new(
                            AlertSeverity::Warning,
                            "monitor.trigger_evicted",
                            "trigger queue overflow: lowest-priority trigger evicted",
                        )
                        .with_fields(json!({
                            "position_id": evicted.position_id.to_string(),
                            "symbol": evicted.symbol,
                        })),
                    );
                }
                PushOutcome::RejectedAsLowest(rejected) => {
                    self.alerts.raise(
                        Alert::new(
                            AlertSeverity::Warning,
                            "monitor.trigger_deferred",
                            "trigger queue full: trigger deferred to next tick",
                        )
                        .with_fields(json!({
                            "position_id": rejected.position_id.to_string(),
                            "symbol": rejected.symbol,
                        })),
                    );
                }
            }
        }
        enqueued
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::ChannelAlertSink;
    use crate::types::PositionStatus;
    use rust_decimal_macros::dec;

    fn open_position(side: Side, sl: Option<Decimal>, tp: Option<Decimal>) -> Position {
        let mut p = Position::new_pending(
            "acc-1".to_string(),
            "XAUUSD".to_string(),
            side,
            dec!(100),
            dec!(400),
            sl,
            tp,
            Utc::now(),
        );
        p.size = dec!(0.2);
        p.avg_entry_price = dec!(2000);
        p.status = PositionStatus::Open;
        p
    }

    fn monitor() -> SlTpMonitor {
        let (sink, _rx) = ChannelAlertSink::new();
        SlTpMonitor::new(100, Arc::new(sink))
    }

    #[test]
    fn trigger_rules_per_side() {
        // long: SL at-or-below, TP at-or-above
        assert_eq!(
            evaluate_trigger(Side::Buy, dec!(1990), Some(dec!(1990)), Some(dec!(2020))),
            Some((TriggerKind::StopLoss, dec!(1990)))
        );
        assert_eq!(
            evaluate_trigger(Side::Buy, dec!(2020), Some(dec!(1990)), Some(dec!(2020))),
            Some((TriggerKind::TakeProfit, dec!(2020)))
        );
        assert_eq!(
            evaluate_trigger(Side::Buy, dec!(2000), Some(dec!(1990)), Some(dec!(2020))),
            None
        );
        // short: mirrored
        assert_eq!(
            evaluate_trigger(Side::Sell, dec!(1.2010), Some(dec!(1.2010)), None),
            Some((TriggerKind::StopLoss, dec!(1.2010)))
        );
        assert_eq!(
            evaluate_trigger(Side::Sell, dec!(1.1990), None, Some(dec!(1.1990))),
            Some((TriggerKind::TakeProfit, dec!(1.1990)))
        );
        assert_eq!(
            evaluate_trigger(Side::Sell, dec!(1.2009), Some(dec!(1.2010)), None),
            None
        );
    }

    #[tokio::test]
    async fn tick_enqueues_only_watching_symbol() {
        let monitor = monitor();
        let position = open_position(Side::Buy, Some(dec!(1990)), Some(dec!(2020)));
        monitor.watch(&position);

        // tick for an unrelated symbol does nothing
        let other = PriceTick {
            symbol: "EURUSD".to_string(),
            price: dec!(1.0),
            at: Utc::now(),
        };
        assert_eq!(monitor.on_price_tick(&other).await, 0);

        // in-range tick does nothing either
        let calm = PriceTick {
            symbol: "XAUUSD".to_string(),
            price: dec!(2005),
            at: Utc::now(),
        };
        assert_eq!(monitor.on_price_tick(&calm).await, 0);

        // take-profit breach enqueues exactly one trigger
        let breach = PriceTick {
            symbol: "XAUUSD".to_string(),
            price: dec!(2020),
            at: Utc::now(),
        };
        assert_eq!(monitor.on_price_tick(&breach).await, 1);
        assert_eq!(monitor.latest_price("XAUUSD"), Some(dec!(2020)));

        // the same breach again does not double-enqueue
        assert_eq!(monitor.on_price_tick(&breach).await, 0);

        let queue = monitor.queue();
        let mut queue = queue.lock().await;
        let trigger = queue.pop().unwrap();
        assert_eq!(trigger.kind, TriggerKind::TakeProfit);
        assert_eq!(trigger.trigger_price, dec!(2020));
    }

    #[tokio::test]
    async fn unwatch_removes_from_index_and_queue() {
        let monitor = monitor();
        let position = open_position(Side::Buy, Some(dec!(1990)), None);
        monitor.watch(&position);

        let breach = PriceTick {
            symbol: "XAUUSD".to_string(),
            price: dec!(1989),
            at: Utc::now(),
        };
        assert_eq!(monitor.on_price_tick(&breach).await, 1);

        monitor.unwatch(position.id).await;
        assert_eq!(monitor.monitored_count(), 0);
        assert!(monitor.queue().lock().await.is_empty());
        // no re-trigger once unwatched
        assert_eq!(monitor.on_price_tick(&breach).await, 0);
    }

    #[test]
    fn watch_without_levels_is_a_noop() {
        let monitor = monitor();
        let position = open_position(Side::Buy, None, None);
        monitor.watch(&position);
        assert_eq!(monitor.monitored_count(), 0);
    }
}
