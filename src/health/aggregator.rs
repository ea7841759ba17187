//! Health scoring: system, network, sensor, and error sub-scores folded
//! into one 0–100 figure with a status tier.
//!
//! Snapshots are derived fresh on every request; nothing here persists
//! beyond the rolling error log the aggregator reads.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

use crate::health::error_log::ErrorLog;
use crate::sensing::sampler::SensorChannel;

const WEIGHT_SYSTEM: f64 = 0.20;
const WEIGHT_NETWORK: f64 = 0.20;
const WEIGHT_SENSORS: f64 = 0.30;
const WEIGHT_ERRORS: f64 = 0.30;

/// Penalty per recent log entry when scoring error pressure.
const PENALTY_WARNING: f64 = 5.0;
const PENALTY_CRITICAL: f64 = 15.0;
const PENALTY_FATAL: f64 = 40.0;

/// Memory state as reported by the platform layer.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SystemStatus {
    /// Free heap as a fraction of total.
    pub heap_free_ratio: f64,
    /// Heap fragmentation, 0 = contiguous.
    pub fragmentation_ratio: f64,
}

impl Default for SystemStatus {
    fn default() -> Self {
        Self {
            heap_free_ratio: 1.0,
            fragmentation_ratio: 0.0,
        }
    }
}

/// Link state as reported by the platform layer.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct NetworkStatus {
    pub link_up: bool,
    pub rssi_dbm: Option<i32>,
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self {
            link_up: true,
            rssi_dbm: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthTier {
    Excellent,
    Good,
    Warning,
    Error,
}

impl HealthTier {
    pub fn from_score(score: u8) -> Self {
        match score {
            90..=100 => HealthTier::Excellent,
            70..=89 => HealthTier::Good,
            50..=69 => HealthTier::Warning,
            _ => HealthTier::Error,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            HealthTier::Excellent => "excellent",
            HealthTier::Good => "good",
            HealthTier::Warning => "warning",
            HealthTier::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentScore {
    pub name: &'static str,
    pub score: u8,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub score: u8,
    pub tier: HealthTier,
    pub components: Vec<ComponentScore>,
}

pub struct HealthAggregator {
    system: Mutex<SystemStatus>,
    network: Mutex<NetworkStatus>,
    errors: Arc<ErrorLog>,
}

impl HealthAggregator {
    pub fn new(errors: Arc<ErrorLog>) -> Self {
        Self {
            system: Mutex::new(SystemStatus::default()),
            network: Mutex::new(NetworkStatus::default()),
            errors,
        }
    }

    /// Platform layers push their state in; the aggregator never polls.
    pub fn set_system_status(&self, status: SystemStatus) {
        *self.system.lock() = status;
    }

    pub fn set_network_status(&self, status: NetworkStatus) {
        *self.network.lock() = status;
    }

    /// Compute a fresh snapshot from current state. `sensor_flags` is the
    /// per-channel liveness reported by the sample bus.
    pub fn snapshot(&self, sensor_flags: &[(SensorChannel, bool)]) -> HealthSnapshot {
        let system = *self.system.lock();
        let network = *self.network.lock();

        let sys_score = (system.heap_free_ratio.clamp(0.0, 1.0)
            * (1.0 - system.fragmentation_ratio.clamp(0.0, 1.0))
            * 100.0)
            .round();
        let sys_msg = format!(
            "heap {:.0}% free, {:.0}% fragmented",
            system.heap_free_ratio * 100.0,
            system.fragmentation_ratio * 100.0
        );

        let net_score = if !network.link_up {
            0.0
        } else {
            match network.rssi_dbm {
                // -50 dBm or better is full marks, -90 dBm is unusable.
                Some(rssi) => ((rssi as f64 + 90.0) / 40.0 * 100.0).clamp(0.0, 100.0).round(),
                None => 100.0,
            }
        };
        let net_msg = match (network.link_up, network.rssi_dbm) {
            (false, _) => "link down".to_string(),
            (true, Some(rssi)) => format!("link up, {rssi} dBm"),
            (true, None) => "link up".to_string(),
        };

        let (sensor_score, sensor_msg) = if sensor_flags.is_empty() {
            (100.0, "no channels registered".to_string())
        } else {
            let ok = sensor_flags.iter().filter(|&&(_, ok)| ok).count();
            let dead: Vec<&str> = sensor_flags
                .iter()
                .filter(|&&(_, ok)| !ok)
                .map(|&(ch, _)| ch.name())
                .collect();
            let score = (ok as f64 / sensor_flags.len() as f64 * 100.0).round();
            let msg = if dead.is_empty() {
                format!("{ok}/{} channels live", sensor_flags.len())
            } else {
                format!("faulted: {}", dead.join(", "))
            };
            (score, msg)
        };

        let (warnings, criticals, fatals) = self.errors.severity_counts();
        let penalty = warnings as f64 * PENALTY_WARNING
            + criticals as f64 * PENALTY_CRITICAL
            + fatals as f64 * PENALTY_FATAL;
        let err_score = (100.0 - penalty).clamp(0.0, 100.0).round();
        let err_msg = format!("{warnings} warnings, {criticals} critical, {fatals} fatal");

        let weighted = sys_score * WEIGHT_SYSTEM
            + net_score * WEIGHT_NETWORK
            + sensor_score * WEIGHT_SENSORS
            + err_score * WEIGHT_ERRORS;
        let mut score = weighted.round().clamp(0.0, 100.0) as u8;

        // A Fatal entry forces the Error tier outright; it is not just
        // another weighted contribution.
        if fatals > 0 {
            score = score.min(49);
        }

        HealthSnapshot {
            score,
            tier: HealthTier::from_score(score),
            components: vec![
                ComponentScore {
                    name: "system",
                    score: sys_score as u8,
                    message: sys_msg,
                },
                ComponentScore {
                    name: "network",
                    score: net_score as u8,
                    message: net_msg,
                },
                ComponentScore {
                    name: "sensors",
                    score: sensor_score as u8,
                    message: sensor_msg,
                },
                ComponentScore {
                    name: "errors",
                    score: err_score as u8,
                    message: err_msg,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::error_log::Severity;

    fn all_live() -> Vec<(SensorChannel, bool)> {
        SensorChannel::ALL.iter().map(|&c| (c, true)).collect()
    }

    #[test]
    fn clean_system_scores_excellent() {
        let agg = HealthAggregator::new(Arc::new(ErrorLog::new(16)));
        let snap = agg.snapshot(&all_live());
        assert_eq!(snap.score, 100);
        assert_eq!(snap.tier, HealthTier::Excellent);
    }

    #[test]
    fn fatal_entry_forces_error_tier_even_at_full_subscores() {
        let log = Arc::new(ErrorLog::new(16));
        let agg = HealthAggregator::new(log.clone());
        log.record(Severity::Fatal, "boiler", "overtemp lockout");
        let snap = agg.snapshot(&all_live());
        assert_eq!(snap.tier, HealthTier::Error);
        assert!(snap.score < 50);
    }

    #[test]
    fn dead_sensor_drags_the_sensor_component() {
        let agg = HealthAggregator::new(Arc::new(ErrorLog::new(16)));
        let mut flags = all_live();
        flags[0].1 = false;
        let snap = agg.snapshot(&flags);
        let sensors = snap
            .components
            .iter()
            .find(|c| c.name == "sensors")
            .unwrap();
        assert_eq!(sensors.score, 75);
        assert!(sensors.message.contains("pressure"));
    }

    #[test]
    fn link_down_zeroes_the_network_component() {
        let agg = HealthAggregator::new(Arc::new(ErrorLog::new(16)));
        agg.set_network_status(NetworkStatus {
            link_up: false,
            rssi_dbm: None,
        });
        let snap = agg.snapshot(&all_live());
        let network = snap
            .components
            .iter()
            .find(|c| c.name == "network")
            .unwrap();
        assert_eq!(network.score, 0);
        // 20% weight gone: 80 is still Good, not Error.
        assert_eq!(snap.tier, HealthTier::Good);
    }

    #[test]
    fn tier_thresholds_match_the_contract() {
        assert_eq!(HealthTier::from_score(100), HealthTier::Excellent);
        assert_eq!(HealthTier::from_score(90), HealthTier::Excellent);
        assert_eq!(HealthTier::from_score(89), HealthTier::Good);
        assert_eq!(HealthTier::from_score(70), HealthTier::Good);
        assert_eq!(HealthTier::from_score(69), HealthTier::Warning);
        assert_eq!(HealthTier::from_score(50), HealthTier::Warning);
        assert_eq!(HealthTier::from_score(49), HealthTier::Error);
        assert_eq!(HealthTier::from_score(0), HealthTier::Error);
    }

    #[test]
    fn warnings_erode_the_error_score_gradually() {
        let log = Arc::new(ErrorLog::new(16));
        let agg = HealthAggregator::new(log.clone());
        for _ in 0..4 {
            log.record(Severity::Warning, "tick", "overrun");
        }
        let snap = agg.snapshot(&all_live());
        let errors = snap.components.iter().find(|c| c.name == "errors").unwrap();
        assert_eq!(errors.score, 80);
        assert_eq!(snap.score, 94);
    }
}
