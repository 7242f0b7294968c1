//! Engine configuration types and loaders.
//!
//! Every knob carries a serde default so a partial YAML file (or none at
//! all) yields a runnable configuration. Decimal thresholds are parsed from
//! strings in YAML to keep ledger arithmetic off floats.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Complete engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Margin-call threshold on margin level (equity / margin_used)
    pub margin_call_level: Decimal,
    /// Forced-liquidation threshold on margin level
    pub liquidation_level: Decimal,
    pub max_leverage: Decimal,

    pub reconciliation_interval_ms: u64,
    pub liquidation_interval_ms: u64,
    /// Drain cadence of the SL/TP trigger queue worker
    pub sltp_drain_interval_ms: u64,
    /// Per-trigger execution budget in the queue worker
    pub trigger_timeout_ms: u64,
    /// Trigger queue capacity; overflow drops the lowest-priority entry
    /// (re-detected on the next tick)
    pub trigger_queue_capacity: usize,

    pub transaction_timeout_ms: u64,
    pub transaction_max_retries: u32,
    pub transaction_retry_base_ms: u64,

    pub replay_batch_size: usize,
    pub recovery_max_duration_ms: u64,

    /// Decimal places kept on the stored average entry price
    /// (banker's rounding); `None` stores the exact quotient
    pub avg_price_scale: Option<u32>,

    /// Max adverse price slippage applied to a forced liquidation close,
    /// as a fraction of entry (0.01 = 1%)
    pub liquidation_max_slippage: Decimal,
    /// Fee charged on liquidation, as a fraction of the realized loss
    pub liquidation_fee_rate: Decimal,

    pub paper_trading: PaperTradingConfig,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            margin_call_level: Decimal::new(5, 1),  // 0.5
            liquidation_level: Decimal::new(2, 1),  // 0.2
            max_leverage: Decimal::from(100),
            reconciliation_interval_ms: 10_000,
            liquidation_interval_ms: 5_000,
            sltp_drain_interval_ms: 25,
            trigger_timeout_ms: 3_000,
            trigger_queue_capacity: 2_000,
            transaction_timeout_ms: 5_000,
            transaction_max_retries: 3,
            transaction_retry_base_ms: 100,
            replay_batch_size: 100,
            recovery_max_duration_ms: 30_000,
            avg_price_scale: Some(8),
            liquidation_max_slippage: Decimal::new(1, 2), // 1%
            liquidation_fee_rate: Decimal::new(5, 3),     // 0.5%
            paper_trading: PaperTradingConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a YAML configuration; missing keys fall back to defaults
    pub fn from_yaml(yaml: &str) -> EngineResult<Self> {
        let config: EngineConfig =
            serde_yaml::from_str(yaml).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.liquidation_level >= self.margin_call_level {
            return Err(EngineError::Config(format!(
                "liquidation_level ({}) must be below margin_call_level ({})",
                self.liquidation_level, self.margin_call_level
            )));
        }
        if self.max_leverage < Decimal::ONE {
            return Err(EngineError::Config(format!(
                "max_leverage must be >= 1, got {}",
                self.max_leverage
            )));
        }
        if self.replay_batch_size == 0 {
            return Err(EngineError::Config("replay_batch_size must be > 0".into()));
        }
        if self.trigger_queue_capacity == 0 {
            return Err(EngineError::Config(
                "trigger_queue_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Paper-trading fill simulation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperTradingConfig {
    /// Max simulated slippage in basis points
    pub slippage_max_bps: u32,
    pub latency_min_ms: u64,
    pub latency_max_ms: u64,
    pub partial_fills_enabled: bool,
    /// Fraction of orders rejected outright, 0.0..=1.0
    pub rejection_rate: f64,
    /// Explicit seed so a paper session replays identically
    pub rng_seed: u64,
}

impl Default for PaperTradingConfig {
    fn default() -> Self {
        PaperTradingConfig {
            slippage_max_bps: 5,
            latency_min_ms: 5,
            latency_max_ms: 50,
            partial_fills_enabled: true,
            rejection_rate: 0.0,
            rng_seed: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_dir: String,
    pub log_file: String,
    /// "hourly", "daily" or anything else for a single file
    pub rotation: String,
    pub log_level: String,
    pub use_json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_dir: "logs".to_string(),
            log_file: "position-engine.log".to_string(),
            rotation: "daily".to_string(),
            log_level: "info".to_string(),
            use_json: false,
        }
    }
}
