//! Brew profile model: an ordered sequence of phases, each with its own
//! control target and termination rules.
//!
//! Profiles are plain data, deserialized from JSON and validated once before
//! a shot may start. They are never mutated while a shot runs; the sequencer
//! holds them behind an `Arc` and reads them only.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::BrewError;

/// Which quantity a phase controls, and its target.
///
/// Closed variant set: the firmware dispatches on this tag, there is no
/// runtime registration of new modes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ControlMode {
    /// Hold a pressure target (bar).
    Pressure { target: f64 },
    /// Hold a flow target (ml/s).
    Flow { target: f64 },
    /// Slew the pressure target from `start` to `end` over `duration` seconds,
    /// then hold `end`. Target generation only; the pressure controller does
    /// the tracking.
    Ramp { start: f64, end: f64, duration: f64 },
    /// No actuation. Pump command is forced to zero for the whole phase.
    Pause,
}

impl ControlMode {
    /// Target value at `elapsed` seconds into the phase.
    pub fn target_at(&self, elapsed: f64) -> f64 {
        match *self {
            ControlMode::Pressure { target } | ControlMode::Flow { target } => target,
            ControlMode::Ramp { start, end, duration } => {
                let t = (elapsed / duration).clamp(0.0, 1.0);
                start + (end - start) * t
            }
            ControlMode::Pause => 0.0,
        }
    }

    /// True when the target does not move for the lifetime of the phase.
    /// Only such phases get overshoot/settling summaries.
    pub fn holds_constant_target(&self) -> bool {
        matches!(self, ControlMode::Pressure { .. } | ControlMode::Flow { .. })
    }
}

/// Which control algorithm tracks the phase target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    Pid,
    /// Rule-table controller; smoother, less oscillatory, no tuned gains.
    Fuzzy,
    /// PID with an in-shot gain-scale estimator.
    Adaptive,
}

/// A single termination condition. All comparisons are "reached": the
/// criterion fires once the measured quantity is at or above the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BreakoutCriterion {
    /// Elapsed phase time (seconds).
    Time { seconds: f64 },
    /// Weight gained since phase start (grams).
    Weight { grams: f64 },
    /// Instantaneous flow (ml/s).
    Flow { ml_per_s: f64 },
    /// Pressure as a percentage of the phase target.
    PressurePercent { percent: f64 },
}

impl BreakoutCriterion {
    pub fn kind(&self) -> CriterionKind {
        match self {
            BreakoutCriterion::Time { .. } => CriterionKind::Time,
            BreakoutCriterion::Weight { .. } => CriterionKind::Weight,
            BreakoutCriterion::Flow { .. } => CriterionKind::Flow,
            BreakoutCriterion::PressurePercent { .. } => CriterionKind::PressurePercent,
        }
    }

    pub fn threshold(&self) -> f64 {
        match *self {
            BreakoutCriterion::Time { seconds } => seconds,
            BreakoutCriterion::Weight { grams } => grams,
            BreakoutCriterion::Flow { ml_per_s } => ml_per_s,
            BreakoutCriterion::PressurePercent { percent } => percent,
        }
    }
}

/// Criterion kind without its threshold; used for the tie-break priority
/// order and for telemetry labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionKind {
    Time,
    Weight,
    Flow,
    PressurePercent,
}

impl CriterionKind {
    pub fn name(&self) -> &'static str {
        match self {
            CriterionKind::Time => "time",
            CriterionKind::Weight => "weight",
            CriterionKind::Flow => "flow",
            CriterionKind::PressurePercent => "pressure_percent",
        }
    }
}

/// One stage of an extraction profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub control: ControlMode,
    #[serde(default)]
    pub algorithm: Algorithm,
    /// Hard upper bound on phase duration (seconds). Enforced independently
    /// of the declared criteria and of sensor health.
    pub max_duration: f64,
    pub breakout: Vec<BreakoutCriterion>,
}

/// A complete brew profile. Dose/yield/ratio are informational; execution is
/// driven entirely by the phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default)]
    pub technique: String,
    pub default_dose: f64,
    pub default_yield: f64,
    pub default_ratio: f64,
    pub phases: Vec<Phase>,
}

impl Profile {
    /// Validate before a shot may start. Rejection here means nothing was
    /// executed: no partial shots.
    pub fn validate(&self) -> Result<(), BrewError> {
        let fail = |reason: String| BrewError::ProfileInvalid {
            name: self.name.clone(),
            reason,
        };

        if self.phases.is_empty() {
            return Err(fail("profile has no phases".into()));
        }

        for (i, phase) in self.phases.iter().enumerate() {
            if phase.breakout.is_empty() {
                return Err(fail(format!(
                    "phase {} (`{}`) has no breakout criteria",
                    i, phase.name
                )));
            }
            if !(phase.max_duration > 0.0) {
                return Err(fail(format!(
                    "phase {} (`{}`) needs a positive max_duration",
                    i, phase.name
                )));
            }
            for c in &phase.breakout {
                if !(c.threshold() > 0.0) {
                    return Err(fail(format!(
                        "phase {} (`{}`): {} threshold must be positive",
                        i,
                        phase.name,
                        c.kind().name()
                    )));
                }
            }
            match phase.control {
                ControlMode::Ramp { duration, .. } if !(duration > 0.0) => {
                    return Err(fail(format!(
                        "phase {} (`{}`): ramp duration must be positive",
                        i, phase.name
                    )));
                }
                ControlMode::Pressure { target } | ControlMode::Flow { target }
                    if !(target > 0.0) =>
                {
                    return Err(fail(format!(
                        "phase {} (`{}`): target must be positive",
                        i, phase.name
                    )));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Copy of this profile with every Weight criterion threshold replaced by
    /// `grams`. Used by the per-shot target-weight override; the stored
    /// profile is untouched.
    pub fn with_target_weight(&self, grams: f64) -> Arc<Profile> {
        let mut p = self.clone();
        for phase in &mut p.phases {
            for c in &mut phase.breakout {
                if let BreakoutCriterion::Weight { grams: g } = c {
                    *g = grams;
                }
            }
        }
        Arc::new(p)
    }
}

/// Parse a profile from JSON and validate it.
pub fn parse_profile(json: &str) -> Result<Profile, BrewError> {
    let profile: Profile =
        serde_json::from_str(json).map_err(|e| BrewError::ProfileInvalid {
            name: "<unparsed>".into(),
            reason: e.to_string(),
        })?;
    profile.validate()?;
    Ok(profile)
}
