//! Liquidation engine (C7).
//!
//! A periodic loop marks every account to market against the monitor's
//! price cache and consults the ledger's margin classification. An account
//! below the liquidation level enters the in-liquidation set (no
//! re-entry), its open positions are force-closed worst-unrealized-loss
//! first - each closure in its own transaction - and the cascade halts as
//! soon as the margin level recovers. The closure price is the entry price
//! adjusted by the configured max slippage; the liquidation fee is charged
//! on the aggregate realized loss as one `LiquidationLoss` ledger event.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use rustc_hash::FxHashSet;
use serde_json::json;
use tokio::sync::{Mutex, watch};
use tokio::time::MissedTickBehavior;

use crate::alerts::{Alert, AlertSeverity, AlertSink};
use crate::broker::BrokerAdapter;
use crate::error::EngineResult;
use crate::ledger::Ledger;
use crate::models::{Position, closure_idempotency_key};
use crate::monitor::SlTpMonitor;
use crate::store::Store;
use crate::tracker::{CloseRequest, ExecutionTracker};
use crate::types::{
    AccountId, BalanceEventType, CloseReason, ExecutionKind, PositionEventType, PositionStatus,
    Side,
};

/// Outcome of one account check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiquidationCheck {
    Healthy,
    MarginCall,
    /// Number of positions force-closed before the level recovered
    Liquidated(usize),
    /// Another cycle is already liquidating this account
    InProgress,
}

pub struct LiquidationEngine {
    store: Arc<dyn Store>,
    tracker: Arc<ExecutionTracker>,
    ledger: Ledger,
    monitor: Arc<SlTpMonitor>,
    broker: Arc<dyn BrokerAdapter>,
    alerts: Arc<dyn AlertSink>,
    interval: Duration,
    max_slippage: Decimal,
    fee_rate: Decimal,
    in_liquidation: Mutex<FxHashSet<AccountId>>,
}

impl LiquidationEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        tracker: Arc<ExecutionTracker>,
        ledger: Ledger,
        monitor: Arc<SlTpMonitor>,
        broker: Arc<dyn BrokerAdapter>,
        alerts: Arc<dyn AlertSink>,
        interval: Duration,
        max_slippage: Decimal,
        fee_rate: Decimal,
    ) -> Self {
        Self {
            store,
            tracker,
            ledger,
            monitor,
            broker,
            alerts,
            interval,
            max_slippage,
            fee_rate,
            in_liquidation: Mutex::new(FxHashSet::default()),
        }
    }

    /// Periodic loop; a failed cycle logs and waits for the next tick
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.check_all_accounts().await {
                        tracing::error!(error = %err, "liquidation cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("liquidation engine shutting down");
                        break;
                    }
                }
            }
        }
    }

    pub async fn check_all_accounts(&self) -> EngineResult<()> {
        for account in self.store.accounts().await? {
            if let Err(err) = self.check_account(&account.account_id).await {
                tracing::error!(
                    account_id = %account.account_id,
                    error = %err,
                    "liquidation check failed for account"
                );
            }
        }
        Ok(())
    }

    /// Mark one account to market and liquidate if its level is below the
    /// threshold
    pub async fn check_account(&self, account_id: &str) -> EngineResult<LiquidationCheck> {
        {
            let in_progress = self.in_liquidation.lock().await;
            if in_progress.contains(account_id) {
                return Ok(LiquidationCheck::InProgress);
            }
        }

        let (open, unrealized) = self.mark_to_market(account_id).await?;
        let status = self.ledger.margin_status(account_id, unrealized).await?;

        if status.is_margin_call {
            self.alerts.raise(
                Alert::new(
                    AlertSeverity::Warning,
                    "liquidation.margin_call",
                    format!("account {account_id} is on margin call"),
                )
                .with_fields(json!({
                    "account_id": account_id,
                    "margin_level": status.margin_level.map(|l| l.to_string()),
                })),
            );
            return Ok(LiquidationCheck::MarginCall);
        }
        if !status.is_liquidation {
            return Ok(LiquidationCheck::Healthy);
        }

        self.in_liquidation
            .lock()
            .await
            .insert(account_id.to_string());
        let result = self.cascade(account_id, open).await;
        self.in_liquidation.lock().await.remove(account_id);
        result
    }

    /// Force-close positions worst-first until the level recovers
    async fn cascade(
        &self,
        account_id: &str,
        mut open: Vec<(Position, Decimal)>,
    ) -> EngineResult<LiquidationCheck> {
        self.alerts.raise(
            Alert::new(
                AlertSeverity::Critical,
                "liquidation.started",
                format!("account {account_id} breached the liquidation level"),
            )
            .with_fields(json!({ "account_id": account_id, "open_positions": open.len() })),
        );

        // most negative unrealized loss first
        open.sort_by(|(_, a), (_, b)| a.cmp(b));

        let mut closed = 0usize;
        let mut aggregate_loss = Decimal::ZERO;

        for (position, _) in open {
            let now = Utc::now();
            let close_price = slippage_price(&position, self.max_slippage);
            let request = CloseRequest {
                position_id: position.id,
                exit_price: Some(close_price),
                execution_kind: Some(ExecutionKind::Liquidation),
                order_id: format!("liquidation_{}", position.id),
                event_type: PositionEventType::PositionLiquidated,
                close_reason: CloseReason::Liquidation,
                target_status: PositionStatus::Liquidated,
                idempotency_key: Some(closure_idempotency_key(position.id, now)),
                at: now,
            };

            let expected_pnl = position.pnl_at(close_price, position.size);
            match self.tracker.close_with_request(request).await {
                Ok(outcome) => {
                    if outcome.is_effective() {
                        closed += 1;
                        if expected_pnl < Decimal::ZERO {
                            aggregate_loss += -expected_pnl;
                        }
                        self.monitor.unwatch(position.id).await;
                        // best-effort emergency close on the broker side
                        if let Err(err) =
                            self.broker.close_position(&position.id.to_string()).await
                        {
                            self.alerts.raise(
                                Alert::new(
                                    AlertSeverity::Critical,
                                    "liquidation.broker_close_failed",
                                    format!("emergency broker closure failed: {err}"),
                                )
                                .with_fields(json!({
                                    "position_id": position.id.to_string(),
                                })),
                            );
                        }
                        tracing::warn!(
                            account_id,
                            position_id = %position.id,
                            close_price = %close_price,
                            "position force-closed by liquidation"
                        );
                    }
                }
                Err(err) => {
                    // keep cascading; a stuck position must not shield the rest
                    tracing::error!(
                        account_id,
                        position_id = %position.id,
                        error = %err,
                        "liquidation closure failed"
                    );
                    continue;
                }
            }

            // margin recheck after every closure; halt once recovered
            let (_, unrealized) = self.mark_to_market(account_id).await?;
            let status = self.ledger.margin_status(account_id, unrealized).await?;
            if !status.is_liquidation {
                break;
            }
        }

        if aggregate_loss > Decimal::ZERO && self.fee_rate > Decimal::ZERO {
            let fee = aggregate_loss * self.fee_rate;
            self.ledger
                .update_balance(
                    account_id,
                    BalanceEventType::LiquidationLoss,
                    -fee,
                    &format!("liquidation fee on aggregate loss {aggregate_loss}"),
                )
                .await?;
        }

        self.alerts.raise(
            Alert::new(
                AlertSeverity::Critical,
                "liquidation.completed",
                format!("liquidation of account {account_id} closed {closed} position(s)"),
            )
            .with_fields(json!({
                "account_id": account_id,
                "positions_closed": closed,
                "aggregate_loss": aggregate_loss.to_string(),
            })),
        );

        Ok(LiquidationCheck::Liquidated(closed))
    }

    /// Open positions of the account with their unrealized P&L at the
    /// cached mark price (entry price when no tick has arrived yet)
    async fn mark_to_market(
        &self,
        account_id: &str,
    ) -> EngineResult<(Vec<(Position, Decimal)>, Decimal)> {
        let positions = self.store.positions_by_account(account_id).await?;
        let mut open = Vec::new();
        let mut total = Decimal::ZERO;
        for position in positions {
            if position.status != PositionStatus::Open {
                continue;
            }
            let mark = self
                .monitor
                .latest_price(&position.symbol)
                .unwrap_or(position.avg_entry_price);
            let upnl = position.pnl_at(mark, position.size);
            total += upnl;
            open.push((position, upnl));
        }
        Ok((open, total))
    }
}

/// Liquidation close price: entry adjusted by max slippage against the
/// position
fn slippage_price(position: &Position, max_slippage: Decimal) -> Decimal {
    match position.side {
        Side::Buy => position.avg_entry_price * (Decimal::ONE - max_slippage),
        Side::Sell => position.avg_entry_price * (Decimal::ONE + max_slippage),
    }
}
