//! Single drain worker for the trigger queue.
//!
//! One pop per drain tick, executed under its own timeout. A failed or
//! timed-out trigger is reported and dropped; the monitor re-detects a
//! still-due trigger on the next price tick, and the closure idempotency
//! key guarantees a retried trigger cannot double-close.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::sync::{Mutex, watch};
use tokio::time::MissedTickBehavior;

use crate::alerts::{Alert, AlertSeverity, AlertSink};
use crate::error::EngineResult;
use crate::monitor::queue::{PendingTrigger, TriggerKind, TriggerQueue};
use crate::monitor::SlTpMonitor;
use crate::tracker::{ClosureOutcome, ExecutionTracker};

/// Drain counters, shared with whoever wants to observe the worker
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub processed: AtomicU64,
    pub duplicates: AtomicU64,
    pub failed: AtomicU64,
}

pub struct TriggerWorker {
    queue: Arc<Mutex<TriggerQueue>>,
    monitor: Arc<SlTpMonitor>,
    tracker: Arc<ExecutionTracker>,
    alerts: Arc<dyn AlertSink>,
    drain_interval: Duration,
    trigger_timeout: Duration,
    stats: Arc<WorkerStats>,
}

impl TriggerWorker {
    pub fn new(
        monitor: Arc<SlTpMonitor>,
        tracker: Arc<ExecutionTracker>,
        alerts: Arc<dyn AlertSink>,
        drain_interval: Duration,
        trigger_timeout: Duration,
    ) -> Self {
        Self {
            queue: monitor.queue(),
            monitor,
            tracker,
            alerts,
            drain_interval,
            trigger_timeout,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Drain loop; returns when the shutdown flag flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.drain_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_age_refresh = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if last_age_refresh.elapsed() >= Duration::from_secs(1) {
                        self.queue.lock().await.refresh_ages(chrono::Utc::now());
                        last_age_refresh = tokio::time::Instant::now();
                    }
                    self.drain_step().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("trigger worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One drain step: pop the highest-priority trigger and execute it
    /// under the per-trigger timeout
    pub async fn drain_step(&self) {
        let trigger = match self.queue.lock().await.pop() {
            Some(trigger) => trigger,
            None => return,
        };

        let position_id = trigger.position_id;
        match tokio::time::timeout(self.trigger_timeout, self.execute(&trigger)).await {
            Ok(Ok(outcome)) => {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                if matches!(outcome, ClosureOutcome::DuplicateTrigger) {
                    self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                }
                // Whatever the path, the position is no longer open.
                self.monitor.unwatch(position_id).await;
            }
            Ok(Err(err)) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.alerts.raise(
                    Alert::new(
                        AlertSeverity::Warning,
                        "monitor.trigger_failed",
                        format!("trigger execution failed: {err}"),
                    )
                    .with_fields(json!({
                        "position_id": position_id.to_string(),
                        "symbol": trigger.symbol,
                    })),
                );
            }
            Err(_elapsed) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.alerts.raise(
                    Alert::new(
                        AlertSeverity::Warning,
                        "monitor.trigger_timeout",
                        format!(
                            "trigger execution exceeded {} ms",
                            self.trigger_timeout.as_millis()
                        ),
                    )
                    .with_fields(json!({ "position_id": position_id.to_string() })),
                );
            }
        }
    }

    async fn execute(&self, trigger: &PendingTrigger) -> EngineResult<ClosureOutcome> {
        match trigger.kind {
            TriggerKind::StopLoss => {
                self.tracker
                    .trigger_stop_loss(trigger.position_id, trigger.trigger_price, trigger.detected_at)
                    .await
            }
            TriggerKind::TakeProfit => {
                self.tracker
                    .trigger_take_profit(
                        trigger.position_id,
                        trigger.trigger_price,
                        trigger.detected_at,
                    )
                    .await
            }
        }
    }
}
