//! Priority queue for detected SL/TP triggers.
//!
//! Triggers are not executed on the price-tick path; they are enqueued
//! here and drained by a single worker. Ordering is a composite score
//! (distance to trigger, position size, risk, age), FIFO within equal
//! score. The queue is bounded; on overflow the lowest-priority entry is
//! dropped and reported - the monitor re-detects a still-due trigger on
//! the next tick, so a drop delays a closure, it never loses one.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rustc_hash::FxHashSet;

use crate::types::{AccountId, PositionId, Side};

/// Which boundary fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    StopLoss,
    TakeProfit,
}

/// Risk classification from unrealized loss over notional
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Monotone function of the distance to the trigger price
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

/// A detected, not-yet-executed trigger
#[derive(Debug, Clone)]
pub struct PendingTrigger {
    pub position_id: PositionId,
    pub account_id: AccountId,
    pub symbol: String,
    pub side: Side,
    pub kind: TriggerKind,
    pub trigger_price: Decimal,
    pub current_price: Decimal,
    pub position_size: Decimal,
    pub risk: RiskLevel,
    pub urgency: Urgency,
    pub detected_at: DateTime<Utc>,
}

/// |current - trigger| / trigger, as a percentage
pub fn distance_pct(current: Decimal, trigger: Decimal) -> Decimal {
    if trigger.is_zero() {
        return Decimal::ZERO;
    }
    ((current - trigger) / trigger * Decimal::ONE_HUNDRED).abs()
}

/// Critical under 0.05%, then High / Medium / Low by widening distance
pub fn urgency_for(current: Decimal, trigger: Decimal) -> Urgency {
    let pct = distance_pct(current, trigger);
    if pct < Decimal::new(5, 2) {
        Urgency::Critical
    } else if pct < Decimal::new(5, 1) {
        Urgency::High
    } else if pct < Decimal::TWO {
        Urgency::Medium
    } else {
        Urgency::Low
    }
}

/// Unrealized loss / notional -> risk bucket
pub fn risk_for(unrealized_loss_ratio: Decimal) -> RiskLevel {
    if unrealized_loss_ratio >= Decimal::new(5, 2) {
        RiskLevel::High
    } else if unrealized_loss_ratio >= Decimal::new(2, 2) {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

// Score contributions. Distance dominates, then risk, then size; the age
// bonus only breaks starvation, it cannot outrank a close trigger.
const DISTANCE_POINTS: [(Decimal, i64); 4] = [
    (Decimal::from_parts(1, 0, 0, false, 1), 400), // < 0.1%
    (Decimal::from_parts(5, 0, 0, false, 1), 300), // < 0.5%
    (Decimal::from_parts(1, 0, 0, false, 0), 200), // < 1%
    (Decimal::from_parts(2, 0, 0, false, 0), 100), // < 2%
];

fn distance_points(pct: Decimal) -> i64 {
    for (bound, points) in DISTANCE_POINTS {
        if pct < bound {
            return points;
        }
    }
    0
}

fn size_points(size: Decimal) -> i64 {
    if size >= Decimal::from(100_000) {
        50
    } else if size >= Decimal::from(10_000) {
        40
    } else if size >= Decimal::from(1_000) {
        30
    } else if size >= Decimal::from(100) {
        20
    } else if size >= Decimal::TEN {
        10
    } else {
        5
    }
}

fn risk_points(risk: RiskLevel) -> i64 {
    match risk {
        RiskLevel::High => 90,
        RiskLevel::Medium => 60,
        RiskLevel::Low => 30,
    }
}

fn age_points(age_secs: i64) -> i64 {
    if age_secs > 10 {
        20
    } else if age_secs > 5 {
        10
    } else {
        0
    }
}

/// Composite priority of a trigger as seen at `now`
pub fn priority_score(trigger: &PendingTrigger, now: DateTime<Utc>) -> i64 {
    let pct = distance_pct(trigger.current_price, trigger.trigger_price);
    distance_points(pct)
        + size_points(trigger.position_size)
        + risk_points(trigger.risk)
        + age_points((now - trigger.detected_at).num_seconds())
}

struct QueueEntry {
    score: i64,
    /// Insertion order; FIFO within equal score
    seq: u64,
    trigger: PendingTrigger,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score && self.seq == other.seq
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // max-heap: larger score first, then older insertion first
        self.score
            .cmp(&other.score)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Outcome of offering a trigger to the queue
#[derive(Debug)]
pub enum PushOutcome {
    Queued,
    /// Queued, at the cost of evicting the lowest-priority entry
    QueuedEvicting(PendingTrigger),
    /// The offered trigger itself was the lowest priority and was not kept
    RejectedAsLowest(PendingTrigger),
    /// The position already has a pending trigger
    AlreadyQueued,
}

/// Bounded max-priority queue, owned by the single drain worker
pub struct TriggerQueue {
    heap: BinaryHeap<QueueEntry>,
    queued_positions: FxHashSet<PositionId>,
    capacity: usize,
    next_seq: u64,
    dropped: u64,
}

impl TriggerQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            queued_positions: FxHashSet::default(),
            capacity,
            next_seq: 0,
            dropped: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Total entries evicted on overflow so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Offer a trigger; at most one pending trigger per position
    pub fn push(&mut self, trigger: PendingTrigger, now: DateTime<Utc>) -> PushOutcome {
        if self.queued_positions.contains(&trigger.position_id) {
            return PushOutcome::AlreadyQueued;
        }

        let score = priority_score(&trigger, now);
        if self.heap.len() >= self.capacity {
            // Evict the global minimum, which may be the incoming entry.
            let min_score = self
                .heap
                .iter()
                .map(|e| e.score)
                .min()
                .unwrap_or(i64::MIN);
            if score <= min_score {
                self.dropped += 1;
                return PushOutcome::RejectedAsLowest(trigger);
            }
            let evicted = self.evict_lowest();
            self.insert(score, trigger);
            self.dropped += 1;
            return match evicted {
                Some(evicted) => PushOutcome::QueuedEvicting(evicted),
                None => PushOutcome::Queued,
            };
        }

        self.insert(score, trigger);
        PushOutcome::Queued
    }

    /// Pop the highest-priority trigger
    pub fn pop(&mut self) -> Option<PendingTrigger> {
        let entry = self.heap.pop()?;
        self.queued_positions.remove(&entry.trigger.position_id);
        Some(entry.trigger)
    }

    /// Drop a pending trigger for a position that stopped being monitored
    pub fn remove(&mut self, position_id: PositionId) {
        if self.queued_positions.remove(&position_id) {
            let entries = std::mem::take(&mut self.heap).into_vec();
            self.heap = entries
                .into_iter()
                .filter(|e| e.trigger.position_id != position_id)
                .collect();
        }
    }

    /// Re-score every entry against `now`, applying the age bonus so old
    /// entries cannot starve behind a steady stream of higher scores
    pub fn refresh_ages(&mut self, now: DateTime<Utc>) {
        let entries = std::mem::take(&mut self.heap).into_vec();
        self.heap = entries
            .into_iter()
            .map(|mut e| {
                e.score = priority_score(&e.trigger, now);
                e
            })
            .collect();
    }

    fn insert(&mut self, score: i64, trigger: PendingTrigger) {
        self.queued_positions.insert(trigger.position_id);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(QueueEntry {
            score,
            seq,
            trigger,
        });
    }

    fn evict_lowest(&mut self) -> Option<PendingTrigger> {
        let entries = std::mem::take(&mut self.heap).into_vec();
        let min_idx = entries
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                // lowest score; among equals the newest goes (FIFO keeps
                // the oldest)
                a.score.cmp(&b.score).then_with(|| b.seq.cmp(&a.seq))
            })
            .map(|(i, _)| i)?;
        let mut entries = entries;
        let evicted = entries.swap_remove(min_idx);
        self.queued_positions.remove(&evicted.trigger.position_id);
        self.heap = entries.into_iter().collect();
        Some(evicted.trigger)
    }
}
