//! Broker adapter contract and the in-process paper broker.
//!
//! The engine only ever talks to this trait. The reconciler depends on
//! `open_positions` / `close_position`; order placement and the execution
//! stream feed the tracker through the engine facade.
//!
//! The paper broker simulates fills with an explicitly seeded RNG: the same
//! seed replays the same slippage, latency, partial-fill and rejection
//! sequence.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tokio::sync::{Mutex, mpsc};

use crate::config::PaperTradingConfig;
use crate::error::{EngineError, EngineResult};
use crate::types::Side;

/// An open position as the broker reports it
#[derive(Debug, Clone)]
pub struct BrokerPosition {
    pub position_id: String,
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub margin_used: Decimal,
}

/// Order request handed to the broker
#[derive(Debug, Clone)]
pub struct OrderSpec {
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub limit_price: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerOrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

/// One execution report from the broker's stream
#[derive(Debug, Clone)]
pub struct BrokerExecution {
    pub order_id: String,
    pub price: Decimal,
    pub size: Decimal,
    pub executed_at: DateTime<Utc>,
}

/// The abstract broker the engine operates against
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn connect(&self) -> EngineResult<()>;
    async fn disconnect(&self) -> EngineResult<()>;
    async fn validate_connection(&self) -> EngineResult<bool>;

    /// Returns the broker-assigned order id
    async fn place_order(&self, spec: &OrderSpec) -> EngineResult<String>;
    async fn cancel_order(&self, order_id: &str) -> EngineResult<()>;
    async fn order_status(&self, order_id: &str) -> EngineResult<BrokerOrderStatus>;

    async fn open_positions(&self) -> EngineResult<Vec<BrokerPosition>>;
    async fn close_position(&self, position_id: &str) -> EngineResult<()>;

    /// Execution stream; a single consumer takes the receiver
    async fn subscribe_executions(&self) -> EngineResult<mpsc::UnboundedReceiver<BrokerExecution>>;
}

// ------------------------------------------------------------
// Paper broker
// ------------------------------------------------------------

#[derive(Debug, Clone)]
struct PaperOrder {
    spec: OrderSpec,
    status: BrokerOrderStatus,
}

/// Deterministic in-process broker used in paper mode and tests
pub struct PaperBroker {
    config: PaperTradingConfig,
    rng: Mutex<StdRng>,
    prices: DashMap<String, Decimal>,
    orders: Arc<DashMap<String, PaperOrder>>,
    positions: Mutex<Vec<BrokerPosition>>,
    executions_tx: mpsc::UnboundedSender<BrokerExecution>,
    executions_rx: Mutex<Option<mpsc::UnboundedReceiver<BrokerExecution>>>,
    next_order: AtomicU64,
}

impl PaperBroker {
    pub fn new(config: PaperTradingConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            rng: Mutex::new(StdRng::seed_from_u64(config.rng_seed)),
            config,
            prices: DashMap::new(),
            orders: Arc::new(DashMap::new()),
            positions: Mutex::new(Vec::new()),
            executions_tx: tx,
            executions_rx: Mutex::new(Some(rx)),
            next_order: AtomicU64::new(1),
        })
    }

    /// Feed the simulated market
    pub fn update_market_price(&self, symbol: &str, price: Decimal) {
        self.prices.insert(symbol.to_string(), price);
    }

    /// Test/reconciliation hook: what the broker believes is open
    pub async fn set_open_positions(&self, positions: Vec<BrokerPosition>) {
        *self.positions.lock().await = positions;
    }

    /// Draw the fill plan for an order: rejection, fill price with
    /// slippage, latency, and an optional partial split. One locked scope
    /// so the draw order is deterministic per seed.
    async fn plan_fills(
        &self,
        spec: &OrderSpec,
        market: Decimal,
    ) -> EngineResult<Vec<(Decimal, Decimal, Duration)>> {
        let mut rng = self.rng.lock().await;

        if self.config.rejection_rate > 0.0 && rng.gen_bool(self.config.rejection_rate.min(1.0)) {
            return Err(EngineError::Broker("paper broker rejected the order".to_string()));
        }

        let slippage_bps = if self.config.slippage_max_bps == 0 {
            0
        } else {
            rng.gen_range(0..=self.config.slippage_max_bps)
        };
        // slippage is adverse: buys fill above, sells below
        let factor = Decimal::from(slippage_bps) / Decimal::from(10_000);
        let price = match spec.side {
            Side::Buy => market * (Decimal::ONE + factor),
            Side::Sell => market * (Decimal::ONE - factor),
        };

        let latency = Duration::from_millis(rng.gen_range(
            self.config.latency_min_ms..=self.config.latency_max_ms.max(self.config.latency_min_ms),
        ));

        let fills = if self.config.partial_fills_enabled && spec.size > Decimal::ONE && rng.gen_bool(0.5)
        {
            let first = (spec.size / Decimal::TWO).round_dp(8);
            let second = spec.size - first;
            let second_latency = latency + Duration::from_millis(rng.gen_range(1..=50));
            vec![(price, first, latency), (price, second, second_latency)]
        } else {
            vec![(price, spec.size, latency)]
        };
        Ok(fills)
    }
}

#[async_trait]
impl BrokerAdapter for PaperBroker {
    async fn connect(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> EngineResult<()> {
        Ok(())
    }

    async fn validate_connection(&self) -> EngineResult<bool> {
        Ok(true)
    }

    async fn place_order(&self, spec: &OrderSpec) -> EngineResult<String> {
        let market = self
            .prices
            .get(&spec.symbol)
            .map(|p| *p)
            .or(spec.limit_price)
            .ok_or_else(|| {
                EngineError::Broker(format!("no market price for {}", spec.symbol))
            })?;

        let fills = self.plan_fills(spec, market).await?;

        let order_id = format!("paper-{}", self.next_order.fetch_add(1, Ordering::Relaxed));
        self.orders.insert(
            order_id.clone(),
            PaperOrder {
                spec: spec.clone(),
                status: BrokerOrderStatus::Pending,
            },
        );

        let tx = self.executions_tx.clone();
        let orders = self.orders.clone();
        let delivered_order = order_id.clone();
        let fill_count = fills.len();
        tokio::spawn(async move {
            for (i, (price, size, latency)) in fills.into_iter().enumerate() {
                tokio::time::sleep(latency).await;
                let _ = tx.send(BrokerExecution {
                    order_id: delivered_order.clone(),
                    price,
                    size,
                    executed_at: Utc::now(),
                });
                if let Some(mut order) = orders.get_mut(&delivered_order) {
                    order.status = if i + 1 == fill_count {
                        BrokerOrderStatus::Filled
                    } else {
                        BrokerOrderStatus::PartiallyFilled
                    };
                }
            }
        });

        Ok(order_id)
    }

    async fn cancel_order(&self, order_id: &str) -> EngineResult<()> {
        match self.orders.get_mut(order_id) {
            Some(mut order) => {
                if order.status == BrokerOrderStatus::Pending {
                    order.status = BrokerOrderStatus::Cancelled;
                    tracing::debug!(order_id, symbol = %order.spec.symbol, "paper order cancelled");
                }
                Ok(())
            }
            None => Err(EngineError::Broker(format!("unknown order {order_id}"))),
        }
    }

    async fn order_status(&self, order_id: &str) -> EngineResult<BrokerOrderStatus> {
        self.orders
            .get(order_id)
            .map(|o| o.status)
            .ok_or_else(|| EngineError::Broker(format!("unknown order {order_id}")))
    }

    async fn open_positions(&self) -> EngineResult<Vec<BrokerPosition>> {
        Ok(self.positions.lock().await.clone())
    }

    async fn close_position(&self, position_id: &str) -> EngineResult<()> {
        let mut positions = self.positions.lock().await;
        positions.retain(|p| p.position_id != position_id);
        Ok(())
    }

    async fn subscribe_executions(&self) -> EngineResult<mpsc::UnboundedReceiver<BrokerExecution>> {
        self.executions_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| EngineError::Broker("execution stream already subscribed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fast_config(seed: u64) -> PaperTradingConfig {
        PaperTradingConfig {
            slippage_max_bps: 10,
            latency_min_ms: 1,
            latency_max_ms: 2,
            partial_fills_enabled: false,
            rejection_rate: 0.0,
            rng_seed: seed,
        }
    }

    async fn collect_fills(
        rx: &mut mpsc::UnboundedReceiver<BrokerExecution>,
        n: usize,
    ) -> Vec<BrokerExecution> {
        let mut fills = Vec::new();
        for _ in 0..n {
            fills.push(
                tokio::time::timeout(Duration::from_secs(1), rx.recv())
                    .await
                    .expect("fill timed out")
                    .expect("stream closed"),
            );
        }
        fills
    }

    #[tokio::test]
    async fn same_seed_same_fill_sequence() {
        let mut prices = Vec::new();
        for _ in 0..2 {
            let broker = PaperBroker::new(fast_config(42));
            broker.update_market_price("EURUSD", dec!(1.2000));
            let mut rx = broker.subscribe_executions().await.unwrap();
            for _ in 0..5 {
                broker
                    .place_order(&OrderSpec {
                        symbol: "EURUSD".to_string(),
                        side: Side::Buy,
                        size: dec!(1),
                        limit_price: None,
                    })
                    .await
                    .unwrap();
                // serialize orders so the draw order is deterministic
                let fill = collect_fills(&mut rx, 1).await;
                prices.push(fill[0].price);
            }
        }
        assert_eq!(prices[..5], prices[5..]);
    }

    #[tokio::test]
    async fn buy_slippage_is_adverse() {
        let broker = PaperBroker::new(fast_config(7));
        broker.update_market_price("XAUUSD", dec!(2000));
        let mut rx = broker.subscribe_executions().await.unwrap();
        broker
            .place_order(&OrderSpec {
                symbol: "XAUUSD".to_string(),
                side: Side::Buy,
                size: dec!(0.2),
                limit_price: None,
            })
            .await
            .unwrap();
        let fills = collect_fills(&mut rx, 1).await;
        assert!(fills[0].price >= dec!(2000));
        // max 10 bps
        assert!(fills[0].price <= dec!(2002));
    }

    #[tokio::test]
    async fn partial_fills_sum_to_order_size() {
        let config = PaperTradingConfig {
            partial_fills_enabled: true,
            rng_seed: 3,
            ..fast_config(3)
        };
        let broker = PaperBroker::new(config);
        broker.update_market_price("EURUSD", dec!(1.2));
        let mut rx = broker.subscribe_executions().await.unwrap();

        // run several orders; every order's fills must sum to its size
        for _ in 0..10 {
            broker
                .place_order(&OrderSpec {
                    symbol: "EURUSD".to_string(),
                    side: Side::Sell,
                    size: dec!(100),
                    limit_price: None,
                })
                .await
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut by_order: std::collections::HashMap<String, Decimal> = Default::default();
        while let Ok(fill) = rx.try_recv() {
            *by_order.entry(fill.order_id).or_default() += fill.size;
        }
        assert_eq!(by_order.len(), 10);
        for total in by_order.values() {
            assert_eq!(*total, dec!(100));
        }
    }

    #[tokio::test]
    async fn full_rejection_rate_rejects() {
        let config = PaperTradingConfig {
            rejection_rate: 1.0,
            ..fast_config(1)
        };
        let broker = PaperBroker::new(config);
        broker.update_market_price("EURUSD", dec!(1.2));
        let err = broker
            .place_order(&OrderSpec {
                symbol: "EURUSD".to_string(),
                side: Side::Buy,
                size: dec!(1),
                limit_price: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Broker(_)));
    }

    #[tokio::test]
    async fn single_execution_subscriber() {
        let broker = PaperBroker::new(fast_config(1));
        assert!(broker.subscribe_executions().await.is_ok());
        assert!(broker.subscribe_executions().await.is_err());
    }
}
