//! Integrity checker and replay-based recovery (C9).
//!
//! The report grades violations instead of failing the engine: a broken
//! ledger needs a human, not a crash loop. Critical findings raise an
//! alert. System recovery folds every position's event log back into its
//! aggregate and rebuilds each account's margin figures from the replayed
//! positions, in batches, under a hard deadline.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tokio::time::Instant;

use crate::alerts::{Alert, AlertSeverity, AlertSink};
use crate::error::{EngineError, EngineResult};
use crate::events::EventStore;
use crate::models::Position;
use crate::store::Store;
use crate::txn::TransactionCoordinator;
use crate::types::{AccountId, BalanceEventType, PositionId, PositionStatus};

/// Violation grading; Critical additionally raises an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum ViolationSeverity {
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub severity: ViolationSeverity,
    /// Which check found it: `ledger_sum`, `balance_equation`,
    /// `event_coverage`, `orphan_events`
    pub check: &'static str,
    pub message: String,
    pub position_id: Option<PositionId>,
}

/// Integrity findings for one account
#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub account_id: AccountId,
    pub checked_at: DateTime<Utc>,
    pub positions_checked: usize,
    pub balance_events_checked: usize,
    pub violations: Vec<Violation>,
}

impl IntegrityReport {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn worst(&self) -> Option<ViolationSeverity> {
        self.violations.iter().map(|v| v.severity).max()
    }
}

/// Outcome of a full system recovery
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    pub accounts_rebuilt: usize,
    pub positions_replayed: usize,
    pub positions_repaired: usize,
    pub duration_ms: i64,
}

/// Ledger-sum tolerance (1e-2)
fn ledger_sum_tolerance() -> Decimal {
    Decimal::new(1, 2)
}

/// Per-event equation tolerance (1e-4)
fn equation_tolerance() -> Decimal {
    Decimal::new(1, 4)
}

pub struct IntegrityChecker {
    store: Arc<dyn Store>,
    events: EventStore,
    coordinator: Arc<TransactionCoordinator>,
    alerts: Arc<dyn AlertSink>,
    recovery_max_duration: Duration,
}

impl IntegrityChecker {
    pub fn new(
        store: Arc<dyn Store>,
        events: EventStore,
        coordinator: Arc<TransactionCoordinator>,
        alerts: Arc<dyn AlertSink>,
        recovery_max_duration: Duration,
    ) -> Self {
        Self {
            store,
            events,
            coordinator,
            alerts,
            recovery_max_duration,
        }
    }

    /// Deterministic fold of a position's event log (alias of the event
    /// store's replay)
    pub async fn replay(&self, position_id: PositionId) -> EngineResult<Option<Position>> {
        self.events.replay(position_id).await
    }

    pub async fn check_all(&self) -> EngineResult<Vec<IntegrityReport>> {
        let mut reports = Vec::new();
        for account in self.store.accounts().await? {
            reports.push(self.check_account(&account.account_id).await?);
            tokio::task::yield_now().await;
        }
        Ok(reports)
    }

    /// Run every check for one account
    pub async fn check_account(&self, account_id: &str) -> EngineResult<IntegrityReport> {
        let account = self
            .store
            .account(account_id)
            .await?
            .ok_or_else(|| EngineError::AccountNotFound(account_id.to_string()))?;
        let balance_events = self.store.balance_events_by_account(account_id).await?;
        let positions = self.store.positions_by_account(account_id).await?;

        let mut violations = Vec::new();

        // LedgerSum: running sum of amounts vs current cash balance
        let sum: Decimal = balance_events.iter().map(|e| e.amount).sum();
        if (account.balance - sum).abs() > ledger_sum_tolerance() {
            violations.push(Violation {
                severity: ViolationSeverity::Critical,
                check: "ledger_sum",
                message: format!(
                    "balance {} diverges from ledger sum {}",
                    account.balance, sum
                ),
                position_id: None,
            });
        }

        // BalanceEquation: before + amount = after for every event
        for event in &balance_events {
            if event.equation_error() > equation_tolerance() {
                violations.push(Violation {
                    severity: ViolationSeverity::Critical,
                    check: "balance_equation",
                    message: format!(
                        "event {} breaks the balance equation: {} + {} != {}",
                        event.id, event.balance_before, event.amount, event.balance_after
                    ),
                    position_id: event.position_id,
                });
            }
        }

        // OrphanEvents: every linked position must exist
        for event in &balance_events {
            if let Some(position_id) = event.position_id {
                if self.store.position(position_id).await?.is_none() {
                    violations.push(Violation {
                        severity: ViolationSeverity::High,
                        check: "orphan_events",
                        message: format!(
                            "balance event {} references missing position {position_id}",
                            event.id
                        ),
                        position_id: Some(position_id),
                    });
                }
            }
        }

        // PositionEventCoverage
        for position in &positions {
            let has = |t: BalanceEventType| {
                balance_events
                    .iter()
                    .any(|e| e.event_type == t && e.position_id == Some(position.id))
            };
            if !has(BalanceEventType::MarginReserved) {
                violations.push(Violation {
                    severity: ViolationSeverity::High,
                    check: "event_coverage",
                    message: format!("position {} has no margin_reserved event", position.id),
                    position_id: Some(position.id),
                });
            }
            if matches!(
                position.status,
                PositionStatus::Closed | PositionStatus::Liquidated
            ) {
                for (kind, name) in [
                    (BalanceEventType::MarginReleased, "margin_released"),
                    (BalanceEventType::PnlRealized, "pnl_realized"),
                ] {
                    if !has(kind) {
                        violations.push(Violation {
                            severity: ViolationSeverity::High,
                            check: "event_coverage",
                            message: format!(
                                "{} position {} has no {name} event",
                                position.status, position.id
                            ),
                            position_id: Some(position.id),
                        });
                    }
                }
            }
            // the audit log must at least record the creation
            if self.store.count_events_by_position(position.id).await? == 0 {
                violations.push(Violation {
                    severity: ViolationSeverity::Medium,
                    check: "event_coverage",
                    message: format!("position {} has an empty event log", position.id),
                    position_id: Some(position.id),
                });
            }
        }

        let report = IntegrityReport {
            account_id: account_id.to_string(),
            checked_at: Utc::now(),
            positions_checked: positions.len(),
            balance_events_checked: balance_events.len(),
            violations,
        };

        if report.worst() == Some(ViolationSeverity::Critical) {
            self.alerts.raise(
                Alert::new(
                    AlertSeverity::Critical,
                    "integrity.violation",
                    format!(
                        "critical integrity violation(s) on account {account_id}: {}",
                        report
                            .violations
                            .iter()
                            .filter(|v| v.severity == ViolationSeverity::Critical)
                            .map(|v| v.check)
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                )
                .with_fields(json!({
                    "account_id": account_id,
                    "violations": report.violations.len(),
                })),
            );
        }

        Ok(report)
    }

    /// Replay every position and rebuild each account's margin figures
    /// from the replayed aggregates. Batched, yielding, bounded by the
    /// configured max duration.
    pub async fn system_recovery(&self) -> EngineResult<RecoveryReport> {
        let started = Utc::now();
        let deadline = Instant::now() + self.recovery_max_duration;

        let mut positions_replayed = 0usize;
        let mut positions_repaired = 0usize;
        let mut accounts_rebuilt = 0usize;

        for account in self.store.accounts().await? {
            let positions = self.store.positions_by_account(&account.account_id).await?;
            let mut margin_used = Decimal::ZERO;
            let mut unrealized = Decimal::ZERO;

            for stored in &positions {
                if Instant::now() >= deadline {
                    return Err(EngineError::Cancelled(
                        "system recovery exceeded its deadline".to_string(),
                    ));
                }
                let replayed = match self
                    .events
                    .replay_until(stored.id, Some(deadline))
                    .await?
                {
                    Some(position) => position,
                    None => continue,
                };
                positions_replayed += 1;

                // pending positions already hold reserved margin
                if matches!(
                    replayed.status,
                    PositionStatus::Open | PositionStatus::Pending
                ) {
                    margin_used += replayed.margin_used;
                }
                if replayed.status == PositionStatus::Open {
                    unrealized += replayed.unrealized_pnl;
                }

                // heal drifted rows from their own log
                if replayed.status != stored.status
                    || replayed.size != stored.size
                    || replayed.realized_pnl != stored.realized_pnl
                {
                    let repaired = replayed.clone();
                    self.coordinator
                        .run_default("integrity.repair_position", move |mut txn| {
                            let repaired = repaired.clone();
                            Box::pin(async move {
                                let result = txn.update_position(&repaired).await;
                                (txn, result)
                            })
                        })
                        .await?;
                    positions_repaired += 1;
                }
                tokio::task::yield_now().await;
            }

            let account_id = account.account_id.clone();
            let equity = account.balance + unrealized;
            let free_margin = equity - margin_used;
            self.coordinator
                .run_default("integrity.rebuild_account", move |mut txn| {
                    let account_id = account_id.clone();
                    Box::pin(async move {
                        let result = async {
                            let mut account = txn
                                .account(&account_id, true)
                                .await?
                                .ok_or_else(|| EngineError::AccountNotFound(account_id.clone()))?;
                            account.margin_used = margin_used;
                            account.equity = equity;
                            account.free_margin = free_margin;
                            account.updated_at = Utc::now();
                            txn.upsert_account(&account).await
                        }
                        .await;
                        (txn, result)
                    })
                })
                .await?;
            accounts_rebuilt += 1;
        }

        let report = RecoveryReport {
            accounts_rebuilt,
            positions_replayed,
            positions_repaired,
            duration_ms: (Utc::now() - started).num_milliseconds(),
        };
        tracing::info!(
            accounts = report.accounts_rebuilt,
            positions = report.positions_replayed,
            repaired = report.positions_repaired,
            "system recovery complete"
        );
        Ok(report)
    }
}
