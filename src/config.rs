//! Engine configuration. All tunables live here so deployments can override
//! them from a JSON file; the defaults match the reference machine.

use serde::{Deserialize, Serialize};

use crate::control::gains::{ControlGains, GainBounds};
use crate::profile::CriterionKind;

/// Cross-shot learning tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    /// How many recent shot summaries feed each adjustment.
    pub window: usize,
    /// Mean peak overshoot (in target units, e.g. bar) above which Kp is
    /// stepped down and Kd up.
    pub overshoot_threshold: f64,
    /// Mean settling time (seconds) above which Ki is stepped up, provided
    /// overshoot is under its threshold.
    pub settling_threshold: f64,
    pub kp_step: f64,
    pub ki_step: f64,
    pub kd_step: f64,
    pub bounds: GainBounds,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            window: 10,
            overshoot_threshold: 0.4,
            settling_threshold: 6.0,
            kp_step: 0.05,
            ki_step: 0.005,
            kd_step: 0.02,
            bounds: GainBounds::default(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Control tick period in milliseconds.
    pub tick_ms: u64,
    /// A sample older than this is treated as missing.
    pub sensor_stale_ms: u64,
    /// Consecutive ticks the primary reading may be missing before the shot
    /// aborts with a sensor fault.
    pub fault_grace_ticks: u32,
    /// Settling band as a fraction of the phase target (0.02 = 2%).
    pub tolerance_pct: f64,
    /// Tie-break order when several criteria fire on the same tick. First
    /// entry wins.
    pub breakout_priority: Vec<CriterionKind>,
    /// Completed shots retained for diagnostics and learning.
    pub history_capacity: usize,
    pub initial_gains: ControlGains,
    pub learning: LearningConfig,
    /// Capacity of the command and telemetry channels.
    pub channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_ms: 50,
            sensor_stale_ms: 150,
            fault_grace_ticks: 3,
            tolerance_pct: 0.02,
            breakout_priority: vec![
                CriterionKind::Weight,
                CriterionKind::PressurePercent,
                CriterionKind::Flow,
                CriterionKind::Time,
            ],
            history_capacity: 50,
            initial_gains: ControlGains::default(),
            learning: LearningConfig::default(),
            channel_capacity: 256,
        }
    }
}

impl EngineConfig {
    pub fn tick_seconds(&self) -> f64 {
        self.tick_ms as f64 / 1_000.0
    }

    /// Parse a configuration from JSON, e.g. a deployment override file.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_priority_puts_weight_first_time_last() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.breakout_priority.first(), Some(&CriterionKind::Weight));
        assert_eq!(cfg.breakout_priority.last(), Some(&CriterionKind::Time));
    }

    #[test]
    fn config_round_trips_through_json() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back = EngineConfig::from_json(&json).unwrap();
        assert_eq!(back.tick_ms, cfg.tick_ms);
        assert_eq!(back.breakout_priority, cfg.breakout_priority);
    }
}
