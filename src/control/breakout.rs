//! Breakout arbitration: decides, once per tick, whether the active phase is
//! done and which criterion ended it.
//!
//! Criteria on a phase are OR'd. When several are satisfied on the same
//! tick, a fixed priority order breaks the tie so the most proximate
//! quality/safety signal preempts a time fallback. The order is
//! configuration, not code: deployments may reorder it.

use crate::profile::{BreakoutCriterion, CriterionKind, Phase};

/// Sensor-derived quantities a criterion may test. `None` means the reading
/// is missing this tick; criteria that need it are skipped, never satisfied.
#[derive(Debug, Clone, Copy)]
pub struct BreakoutContext {
    /// Time since phase start, seconds.
    pub elapsed: f64,
    /// Weight gained since phase start, grams.
    pub weight_delta: Option<f64>,
    /// Instantaneous flow, ml/s.
    pub flow: Option<f64>,
    /// Current pressure, bar.
    pub pressure: Option<f64>,
    /// Current phase target, for the pressure-percent criterion.
    pub target: f64,
}

/// The criterion that ended a phase.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Breakout {
    pub kind: CriterionKind,
    pub threshold: f64,
    /// True when the hard max-duration fallback fired rather than an
    /// author-declared criterion.
    pub synthetic: bool,
}

pub struct BreakoutEvaluator {
    priority: Vec<CriterionKind>,
}

impl BreakoutEvaluator {
    pub fn new(priority: Vec<CriterionKind>) -> Self {
        Self { priority }
    }

    /// First satisfied criterion in priority order, or the synthetic
    /// max-duration breakout, or `None` while the phase keeps running.
    ///
    /// The max-duration check depends only on elapsed time, so every phase
    /// terminates even with all sensors dead.
    pub fn evaluate(&self, phase: &Phase, ctx: &BreakoutContext) -> Option<Breakout> {
        for kind in &self.priority {
            for criterion in phase.breakout.iter().filter(|c| c.kind() == *kind) {
                if Self::satisfied(criterion, ctx) {
                    return Some(Breakout {
                        kind: *kind,
                        threshold: criterion.threshold(),
                        synthetic: false,
                    });
                }
            }
        }

        if ctx.elapsed >= phase.max_duration {
            return Some(Breakout {
                kind: CriterionKind::Time,
                threshold: phase.max_duration,
                synthetic: true,
            });
        }
        None
    }

    fn satisfied(criterion: &BreakoutCriterion, ctx: &BreakoutContext) -> bool {
        match *criterion {
            BreakoutCriterion::Time { seconds } => ctx.elapsed >= seconds,
            BreakoutCriterion::Weight { grams } => {
                ctx.weight_delta.is_some_and(|w| w >= grams)
            }
            BreakoutCriterion::Flow { ml_per_s } => ctx.flow.is_some_and(|f| f >= ml_per_s),
            BreakoutCriterion::PressurePercent { percent } => {
                ctx.target > 0.0
                    && ctx
                        .pressure
                        .is_some_and(|p| p / ctx.target * 100.0 >= percent)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::profile::{Algorithm, ControlMode};

    fn evaluator() -> BreakoutEvaluator {
        BreakoutEvaluator::new(EngineConfig::default().breakout_priority)
    }

    fn phase(criteria: Vec<BreakoutCriterion>, max_duration: f64) -> Phase {
        Phase {
            name: "extraction".into(),
            control: ControlMode::Pressure { target: 9.0 },
            algorithm: Algorithm::Pid,
            max_duration,
            breakout: criteria,
        }
    }

    fn ctx(elapsed: f64) -> BreakoutContext {
        BreakoutContext {
            elapsed,
            weight_delta: None,
            flow: None,
            pressure: None,
            target: 9.0,
        }
    }

    #[test]
    fn weight_beats_time_on_the_same_tick() {
        let p = phase(
            vec![
                BreakoutCriterion::Time { seconds: 25.0 },
                BreakoutCriterion::Weight { grams: 36.0 },
            ],
            60.0,
        );
        let mut c = ctx(25.0);
        c.weight_delta = Some(36.0);
        let b = evaluator().evaluate(&p, &c).expect("should fire");
        assert_eq!(b.kind, CriterionKind::Weight);
        assert!(!b.synthetic);
    }

    #[test]
    fn weight_fires_before_the_time_fallback() {
        let p = phase(
            vec![
                BreakoutCriterion::Weight { grams: 36.0 },
                BreakoutCriterion::Time { seconds: 30.0 },
            ],
            60.0,
        );
        let mut c = ctx(25.0);
        c.weight_delta = Some(36.2);
        c.pressure = Some(9.0);
        let b = evaluator().evaluate(&p, &c).expect("should fire");
        assert_eq!(b.kind, CriterionKind::Weight);
    }

    #[test]
    fn missing_reading_skips_the_criterion() {
        let p = phase(
            vec![
                BreakoutCriterion::Weight { grams: 36.0 },
                BreakoutCriterion::Time { seconds: 30.0 },
            ],
            60.0,
        );
        // Scale dropped out; only the time fallback can end the phase.
        assert!(evaluator().evaluate(&p, &ctx(29.9)).is_none());
        let b = evaluator().evaluate(&p, &ctx(30.0)).expect("time fires");
        assert_eq!(b.kind, CriterionKind::Time);
        assert!(!b.synthetic);
    }

    #[test]
    fn hard_max_duration_fires_synthetically() {
        let p = phase(vec![BreakoutCriterion::Weight { grams: 36.0 }], 40.0);
        // No weight reading ever arrives.
        assert!(evaluator().evaluate(&p, &ctx(39.9)).is_none());
        let b = evaluator().evaluate(&p, &ctx(40.0)).expect("fallback fires");
        assert_eq!(b.kind, CriterionKind::Time);
        assert!(b.synthetic);
        assert!((b.threshold - 40.0).abs() < 1e-9);
    }

    #[test]
    fn pressure_percent_needs_target_and_reading() {
        let p = phase(
            vec![BreakoutCriterion::PressurePercent { percent: 95.0 }],
            60.0,
        );
        let mut c = ctx(5.0);
        assert!(evaluator().evaluate(&p, &c).is_none());
        c.pressure = Some(8.6);
        let b = evaluator().evaluate(&p, &c).expect("95% of 9 bar is 8.55");
        assert_eq!(b.kind, CriterionKind::PressurePercent);
    }

    #[test]
    fn priority_order_is_configuration() {
        let flipped = BreakoutEvaluator::new(vec![
            CriterionKind::Time,
            CriterionKind::Weight,
            CriterionKind::Flow,
            CriterionKind::PressurePercent,
        ]);
        let p = phase(
            vec![
                BreakoutCriterion::Time { seconds: 25.0 },
                BreakoutCriterion::Weight { grams: 36.0 },
            ],
            60.0,
        );
        let mut c = ctx(25.0);
        c.weight_delta = Some(36.0);
        let b = flipped.evaluate(&p, &c).expect("should fire");
        assert_eq!(b.kind, CriterionKind::Time);
    }
}
