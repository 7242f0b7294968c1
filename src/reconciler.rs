//! Broker reconciler (C8).
//!
//! Every cycle diffs the store's open positions against the broker's,
//! indexed by `(symbol, side)`. A position the broker no longer reports is
//! repaired in one transaction (closure event with reason
//! `broker_reconciliation`, margin release, ledger events) and alerted; a
//! broker position with no DB match is alerted only, never auto-created.
//! A broker outage degrades to an empty broker set with an alert - repairs
//! stay idempotent through the closure keys, and the cycle never takes the
//! loop down.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, watch};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::alerts::{Alert, AlertSeverity, AlertSink};
use crate::broker::{BrokerAdapter, BrokerPosition};
use crate::error::EngineResult;
use crate::models::{Position, ReconciliationLog, closure_idempotency_key};
use crate::monitor::SlTpMonitor;
use crate::store::Store;
use crate::tracker::{CloseRequest, ClosureOutcome, ExecutionTracker};
use crate::types::{CloseReason, PositionEventType, PositionStatus, Side};

/// How a discrepancy is acted on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RepairAction {
    /// Converge the store to the broker's view
    SyncDb,
    /// Human investigation required; never auto-create
    AlertOnly,
}

/// One detected divergence between store and broker
#[derive(Debug, Clone, Serialize)]
pub struct Discrepancy {
    pub position_id: Option<Uuid>,
    pub broker_position_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub db_status: String,
    pub broker_status: String,
    pub action: RepairAction,
}

/// Result of one reconciliation cycle
#[derive(Debug, Clone)]
pub struct ReconcileReport {
    pub reconciliation_id: Uuid,
    pub positions_checked: usize,
    pub discrepancies: Vec<Discrepancy>,
    pub repaired: usize,
    pub broker_unreachable: bool,
    pub duration_ms: i64,
}

/// Running statistics across cycles
#[derive(Debug, Clone, Default)]
pub struct ReconcilerStats {
    pub total_reconciliations: u64,
    pub total_discrepancies: u64,
    pub last_run: Option<chrono::DateTime<Utc>>,
    pub average_duration_ms: f64,
}

pub struct BrokerReconciler {
    store: Arc<dyn Store>,
    broker: Arc<dyn BrokerAdapter>,
    tracker: Arc<ExecutionTracker>,
    monitor: Arc<SlTpMonitor>,
    alerts: Arc<dyn AlertSink>,
    interval: Duration,
    stats: Mutex<ReconcilerStats>,
}

impl BrokerReconciler {
    pub fn new(
        store: Arc<dyn Store>,
        broker: Arc<dyn BrokerAdapter>,
        tracker: Arc<ExecutionTracker>,
        monitor: Arc<SlTpMonitor>,
        alerts: Arc<dyn AlertSink>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            broker,
            tracker,
            monitor,
            alerts,
            interval,
            stats: Mutex::new(ReconcilerStats::default()),
        }
    }

    pub async fn stats(&self) -> ReconcilerStats {
        self.stats.lock().await.clone()
    }

    /// Periodic loop; a failed cycle logs, alerts and waits for the next
    /// tick
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.reconcile_once().await {
                        tracing::error!(error = %err, "reconciliation cycle failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("reconciler shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One full reconciliation cycle
    pub async fn reconcile_once(&self) -> EngineResult<ReconcileReport> {
        let started = Utc::now();
        let reconciliation_id = Uuid::new_v4();

        let db_open = self.store.positions_by_status(PositionStatus::Open).await?;

        let (broker_positions, broker_unreachable) = match self.broker.open_positions().await {
            Ok(positions) => (positions, false),
            Err(err) => {
                self.alerts.raise(
                    Alert::new(
                        AlertSeverity::Critical,
                        "reconciler.broker_unreachable",
                        format!("broker query failed, reconciling against empty set: {err}"),
                    )
                    .with_fields(json!({ "reconciliation_id": reconciliation_id.to_string() })),
                );
                (Vec::new(), true)
            }
        };

        // index broker positions by (symbol, side); each entry can match
        // one DB position
        let mut broker_index: FxHashMap<(String, Side), Vec<BrokerPosition>> =
            FxHashMap::default();
        for bp in broker_positions {
            broker_index
                .entry((bp.symbol.clone(), bp.side))
                .or_default()
                .push(bp);
        }

        let mut discrepancies = Vec::new();
        let mut actions = Vec::new();
        let mut repaired = 0usize;

        for position in &db_open {
            let key = (position.symbol.clone(), position.side);
            let matched = broker_index
                .get_mut(&key)
                .and_then(|entries| entries.pop())
                .is_some();
            if matched {
                continue;
            }

            let discrepancy = Discrepancy {
                position_id: Some(position.id),
                broker_position_id: None,
                symbol: position.symbol.clone(),
                side: position.side,
                db_status: "open".to_string(),
                broker_status: "closed".to_string(),
                action: RepairAction::SyncDb,
            };
            discrepancies.push(discrepancy);

            match self.repair_closed_on_broker(position, started).await {
                Ok(true) => {
                    repaired += 1;
                    actions.push(json!({
                        "action": "closed_in_db",
                        "position_id": position.id.to_string(),
                    }));
                    self.alerts.raise(
                        Alert::new(
                            AlertSeverity::Warning,
                            "reconciler.position_synced",
                            format!(
                                "position {} was open in the store but closed at the broker; store updated",
                                position.id
                            ),
                        )
                        .with_fields(json!({
                            "position_id": position.id.to_string(),
                            "symbol": position.symbol,
                        })),
                    );
                }
                Ok(false) => {
                    // lost a race against another closure path; converged anyway
                    actions.push(json!({
                        "action": "already_closed",
                        "position_id": position.id.to_string(),
                    }));
                }
                Err(err) => {
                    tracing::error!(
                        position_id = %position.id,
                        error = %err,
                        "reconciliation repair failed"
                    );
                    actions.push(json!({
                        "action": "repair_failed",
                        "position_id": position.id.to_string(),
                        "error": err.to_string(),
                    }));
                }
            }
        }

        // whatever is left in the broker index has no DB counterpart
        for ((symbol, side), entries) in broker_index {
            for bp in entries {
                discrepancies.push(Discrepancy {
                    position_id: None,
                    broker_position_id: Some(bp.position_id.clone()),
                    symbol: symbol.clone(),
                    side,
                    db_status: "missing".to_string(),
                    broker_status: "open".to_string(),
                    action: RepairAction::AlertOnly,
                });
                self.alerts.raise(
                    Alert::new(
                        AlertSeverity::Critical,
                        "reconciler.position_unknown",
                        format!(
                            "broker reports an open {symbol} position with no store counterpart"
                        ),
                    )
                    .with_fields(json!({
                        "broker_position_id": bp.position_id,
                        "symbol": symbol,
                    })),
                );
            }
        }

        let duration_ms = (Utc::now() - started).num_milliseconds();
        let report = ReconcileReport {
            reconciliation_id,
            positions_checked: db_open.len(),
            discrepancies,
            repaired,
            broker_unreachable,
            duration_ms,
        };

        self.persist_cycle(&report, actions, started).await;
        self.update_stats(&report).await;

        Ok(report)
    }

    /// Repair transaction for a DB-open / broker-closed position. Returns
    /// true when this cycle closed it.
    async fn repair_closed_on_broker(
        &self,
        position: &Position,
        cycle_started: chrono::DateTime<Utc>,
    ) -> EngineResult<bool> {
        let request = CloseRequest {
            position_id: position.id,
            // no trade happened on our side; realize nothing, release margin
            exit_price: None,
            execution_kind: None,
            order_id: format!("reconciliation_{}", position.id),
            event_type: PositionEventType::PositionClosed,
            close_reason: CloseReason::BrokerReconciliation,
            target_status: PositionStatus::Closed,
            idempotency_key: Some(closure_idempotency_key(position.id, cycle_started)),
            at: cycle_started,
        };
        let outcome = self.tracker.close_with_request(request).await?;
        self.monitor.unwatch(position.id).await;
        Ok(matches!(outcome, ClosureOutcome::Closed(_)))
    }

    /// Best-effort persistence of the cycle row
    async fn persist_cycle(
        &self,
        report: &ReconcileReport,
        actions: Vec<serde_json::Value>,
        started: chrono::DateTime<Utc>,
    ) {
        let row = ReconciliationLog {
            reconciliation_id: report.reconciliation_id,
            positions_checked: report.positions_checked as u32,
            discrepancies_found: report.discrepancies.len() as u32,
            discrepancies: serde_json::to_value(&report.discrepancies)
                .unwrap_or(serde_json::Value::Null),
            actions_taken: serde_json::Value::Array(actions),
            duration_ms: report.duration_ms,
            created_at: started,
        };
        if let Err(err) = self.store.log_reconciliation(&row).await {
            tracing::warn!(error = %err, "reconciliation log write failed");
        }
    }

    async fn update_stats(&self, report: &ReconcileReport) {
        let mut stats = self.stats.lock().await;
        let runs = stats.total_reconciliations as f64;
        stats.average_duration_ms =
            (stats.average_duration_ms * runs + report.duration_ms as f64) / (runs + 1.0);
        stats.total_reconciliations += 1;
        stats.total_discrepancies += report.discrepancies.len() as u64;
        stats.last_run = Some(Utc::now());
    }
}
