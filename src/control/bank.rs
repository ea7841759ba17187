//! Interchangeable control units. Each produces a normalized pump power in
//! [0, 1] from (target, actual, dt), deterministically for identical inputs
//! and internal state.
//!
//! The set is closed: phases select one of the three variants below, there
//! is no runtime plugin registration.

use log::warn;
use pidgeon::{ControllerConfig, PidController};
use std::collections::VecDeque;

use crate::control::gains::ControlGains;
use crate::profile::Algorithm;

/// Pump power range. Output is always clamped here, whatever the error.
const CMD_MIN: f64 = 0.0;
const CMD_MAX: f64 = 1.0;

/// Errors kept by the adaptive unit for its trend estimate.
const ADAPT_WINDOW: usize = 20;
/// Samples needed before the scale moves at all.
const ADAPT_MIN_SAMPLES: usize = 8;
const ADAPT_STEP: f64 = 0.02;
const ADAPT_SCALE_MIN: f64 = 0.5;
const ADAPT_SCALE_MAX: f64 = 1.5;

/// PID unit. Integral clamping rides on the output limits, so saturation
/// during long approaches cannot wind the integral term up.
pub struct PidUnit {
    pid: PidController,
    setpoint: f64,
}

impl PidUnit {
    pub fn new(gains: &ControlGains) -> Self {
        let config = ControllerConfig::new()
            .with_kp(gains.kp)
            .with_ki(gains.ki)
            .with_kd(gains.kd)
            .with_output_limits(CMD_MIN, CMD_MAX)
            .with_anti_windup(true);
        Self {
            pid: PidController::new(config),
            setpoint: f64::NAN,
        }
    }

    pub fn command(&mut self, target: f64, actual: f64, dt: f64) -> f64 {
        if self.setpoint.is_nan() || (target - self.setpoint).abs() > f64::EPSILON {
            if self.pid.set_setpoint(target).is_err() {
                warn!("pid setpoint update to {target:.3} rejected, holding previous");
            } else {
                self.setpoint = target;
            }
        }
        self.pid.compute(actual, dt).clamp(CMD_MIN, CMD_MAX)
    }
}

/// PID wrapped with an in-shot gain-scale estimator. The scale reacts to the
/// short-term error trend within the current shot; the slower cross-shot
/// retuning of the gains themselves happens elsewhere, between shots.
pub struct AdaptiveUnit {
    pid: PidUnit,
    scale: f64,
    errors: VecDeque<f64>,
}

impl AdaptiveUnit {
    pub fn new(gains: &ControlGains) -> Self {
        Self {
            pid: PidUnit::new(gains),
            scale: 1.0,
            errors: VecDeque::with_capacity(ADAPT_WINDOW),
        }
    }

    pub fn command(&mut self, target: f64, actual: f64, dt: f64) -> f64 {
        let error = target - actual;
        if self.errors.len() == ADAPT_WINDOW {
            self.errors.pop_front();
        }
        self.errors.push_back(error);
        self.update_scale();

        (self.scale * self.pid.command(target, actual, dt)).clamp(CMD_MIN, CMD_MAX)
    }

    /// Current effective gain scale, for telemetry.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    fn update_scale(&mut self) {
        let n = self.errors.len();
        if n < ADAPT_MIN_SAMPLES {
            return;
        }

        let half = n / 2;
        let older: f64 =
            self.errors.iter().take(half).map(|e| e.abs()).sum::<f64>() / half as f64;
        let recent: f64 = self.errors.iter().skip(half).map(|e| e.abs()).sum::<f64>()
            / (n - half) as f64;

        let sign_flips = self
            .errors
            .iter()
            .zip(self.errors.iter().skip(1))
            .filter(|(a, b)| a.signum() != b.signum() && a.abs() > 1e-9 && b.abs() > 1e-9)
            .count();

        // Oscillation beats divergence: back off before pushing harder.
        if sign_flips > n / 3 {
            self.scale -= ADAPT_STEP;
        } else if recent > older * 1.1 {
            self.scale += ADAPT_STEP;
        }
        self.scale = self.scale.clamp(ADAPT_SCALE_MIN, ADAPT_SCALE_MAX);
    }
}

/// The closed variant set, dispatched by the phase's declared algorithm.
pub enum ControlUnit {
    Pid(PidUnit),
    Fuzzy(crate::control::fuzzy::FuzzyUnit),
    Adaptive(AdaptiveUnit),
}

impl ControlUnit {
    /// Build the unit a phase asked for. `reference_target` sizes the fuzzy
    /// unit's normalization; gains come from the shot-start snapshot.
    pub fn for_phase(algorithm: Algorithm, gains: &ControlGains, reference_target: f64) -> Self {
        match algorithm {
            Algorithm::Pid => ControlUnit::Pid(PidUnit::new(gains)),
            Algorithm::Fuzzy => {
                let scale = (reference_target * 0.5).max(1.0);
                ControlUnit::Fuzzy(crate::control::fuzzy::FuzzyUnit::new(scale, scale))
            }
            Algorithm::Adaptive => ControlUnit::Adaptive(AdaptiveUnit::new(gains)),
        }
    }

    /// Pump power in [0, 1].
    pub fn command(&mut self, target: f64, actual: f64, dt: f64) -> f64 {
        // dt guard against scheduler hiccups, same bounds everywhere so the
        // units stay deterministic under identical tick streams.
        let dt = dt.clamp(1e-6, 0.2);
        match self {
            ControlUnit::Pid(u) => u.command(target, actual, dt),
            ControlUnit::Fuzzy(u) => u.command(target, actual, dt),
            ControlUnit::Adaptive(u) => u.command(target, actual, dt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gains() -> ControlGains {
        ControlGains::default()
    }

    #[test]
    fn pid_command_is_clamped_for_huge_errors() {
        let mut unit = PidUnit::new(&gains());
        // Arbitrarily large error in both directions: output must stay in
        // the actuator range.
        for _ in 0..100 {
            let high = unit.command(1.0e9, 0.0, 0.05);
            assert!((0.0..=1.0).contains(&high), "high was {high}");
        }
        for _ in 0..100 {
            let low = unit.command(0.0, 1.0e9, 0.05);
            assert!((0.0..=1.0).contains(&low), "low was {low}");
        }
    }

    #[test]
    fn pid_recovers_after_saturation() {
        let mut unit = PidUnit::new(&gains());
        // Long saturation period, then the error collapses. With the
        // integral clamped to the output range the command must come off the
        // rail immediately rather than stay pinned by wound-up integral.
        for _ in 0..500 {
            unit.command(9.0, 0.0, 0.05);
        }
        let after = unit.command(9.0, 12.0, 0.05);
        assert!(after < 1.0, "command stayed saturated at {after}");
    }

    #[test]
    fn adaptive_scale_stays_bounded() {
        let mut unit = AdaptiveUnit::new(&gains());
        // Alternating error sign forces the oscillation branch repeatedly.
        for i in 0..200 {
            let actual = if i % 2 == 0 { 8.0 } else { 10.0 };
            let cmd = unit.command(9.0, actual, 0.05);
            assert!((0.0..=1.0).contains(&cmd));
        }
        assert!(unit.scale() >= ADAPT_SCALE_MIN - 1e-9);

        // Steadily growing error forces the divergence branch repeatedly.
        let mut unit = AdaptiveUnit::new(&gains());
        for i in 0..200 {
            let actual = 9.0 - i as f64 * 0.05;
            unit.command(9.0, actual, 0.05);
        }
        assert!(unit.scale() <= ADAPT_SCALE_MAX + 1e-9);
    }

    #[test]
    fn identical_input_streams_give_identical_outputs() {
        let run = || {
            let mut unit = ControlUnit::for_phase(Algorithm::Adaptive, &gains(), 9.0);
            (0..50)
                .map(|i| unit.command(9.0, i as f64 * 0.1, 0.05))
                .collect::<Vec<_>>()
        };
        assert_eq!(run(), run());
    }
}
