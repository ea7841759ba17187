//! The core brew state machine.
//!
//! Walks the ordered phases of a profile, latches controller and targets on
//! phase entry, and advances on breakout. One `tick` call does everything a
//! control period needs: read, compute, arbitrate, transition. The sequencer
//! keeps no wall clock; the caller supplies `dt`, which makes every state
//! transition reproducible in tests.

use log::{debug, info, warn};
use std::sync::Arc;

use crate::control::bank::ControlUnit;
use crate::control::breakout::{Breakout, BreakoutContext, BreakoutEvaluator};
use crate::control::gains::ControlGains;
use crate::error::{AbortReason, BrewError};
use crate::profile::{ControlMode, CriterionKind, Profile};
use crate::sensing::sampler::{SensorChannel, TickSample};

/// Sequencer states. `ShotComplete` and `Aborted` are terminal: a new shot
/// requires passing back through `Idle` via [`PhaseSequencer::reset`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SequencerState {
    Idle,
    PhaseActive(usize),
    ShotComplete,
    Aborted(AbortReason),
}

/// State change produced by a tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    PhaseAdvanced { next: usize, breakout: Breakout },
    ShotComplete { breakout: Breakout },
    Aborted { reason: AbortReason },
}

/// Everything one tick produced, for actuation, recording, and telemetry.
#[derive(Debug, Clone, Copy)]
pub struct TickOutput {
    /// Normalized pump power in [0, 1]. Already 0 on abort/complete.
    pub command: f64,
    /// Phase that was active when the tick ran.
    pub phase_index: usize,
    pub target: f64,
    pub actual: f64,
    pub elapsed: f64,
    pub transition: Option<Transition>,
}

pub struct PhaseSequencer {
    state: SequencerState,
    profile: Option<Arc<Profile>>,
    evaluator: BreakoutEvaluator,
    fault_grace_ticks: u32,
    shot_gains: ControlGains,
    unit: Option<ControlUnit>,
    phase_elapsed: f64,
    shot_elapsed: f64,
    phase_start_weight: Option<f64>,
    last_weight: Option<f64>,
    last_actual: f64,
    last_command: f64,
    consecutive_missing: u32,
    shot_counter: u64,
}

impl PhaseSequencer {
    pub fn new(priority: Vec<CriterionKind>, fault_grace_ticks: u32) -> Self {
        Self {
            state: SequencerState::Idle,
            profile: None,
            evaluator: BreakoutEvaluator::new(priority),
            fault_grace_ticks,
            shot_gains: ControlGains::default(),
            unit: None,
            phase_elapsed: 0.0,
            shot_elapsed: 0.0,
            phase_start_weight: None,
            last_weight: None,
            last_actual: 0.0,
            last_command: 0.0,
            consecutive_missing: 0,
            shot_counter: 0,
        }
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn shot_elapsed(&self) -> f64 {
        self.shot_elapsed
    }

    /// Gains latched for the running shot.
    pub fn shot_gains(&self) -> ControlGains {
        self.shot_gains
    }

    /// Begin a shot. Only valid from `Idle`; anything else means a shot is
    /// in flight or not yet acknowledged, and the command is rejected
    /// without touching current state.
    pub fn start_shot(
        &mut self,
        profile: Arc<Profile>,
        gains: ControlGains,
    ) -> Result<u64, BrewError> {
        if self.state != SequencerState::Idle {
            return Err(BrewError::ShotInProgress);
        }
        profile.validate()?;

        self.shot_counter += 1;
        info!(
            "shot {} started: profile `{}`, {} phases, kp={:.2} ki={:.3} kd={:.2}",
            self.shot_counter,
            profile.name,
            profile.phases.len(),
            gains.kp,
            gains.ki,
            gains.kd
        );

        self.shot_gains = gains;
        self.profile = Some(profile);
        self.shot_elapsed = 0.0;
        self.last_actual = 0.0;
        self.last_command = 0.0;
        // Scale is tared when the shot begins.
        self.last_weight = Some(0.0);
        self.enter_phase(0);
        self.state = SequencerState::PhaseActive(0);
        Ok(self.shot_counter)
    }

    /// Stop the running shot. Takes effect within the current tick; the
    /// caller must drive the actuator to zero with the returned state.
    pub fn abort(&mut self, reason: AbortReason) -> bool {
        match self.state {
            SequencerState::PhaseActive(i) => {
                warn!(
                    "shot {} aborted in phase {}: {}",
                    self.shot_counter,
                    i,
                    reason.code()
                );
                self.state = SequencerState::Aborted(reason);
                self.last_command = 0.0;
                true
            }
            _ => false,
        }
    }

    /// Acknowledge a terminal state and return to `Idle`.
    pub fn reset(&mut self) {
        match self.state {
            SequencerState::ShotComplete | SequencerState::Aborted(_) => {
                self.state = SequencerState::Idle;
                self.profile = None;
                self.unit = None;
            }
            SequencerState::Idle => {}
            SequencerState::PhaseActive(_) => {
                warn!("reset ignored while a shot is active");
            }
        }
    }

    /// Run one control period. Returns `None` unless a shot is active.
    pub fn tick(&mut self, dt: f64, sample: &TickSample) -> Option<TickOutput> {
        let SequencerState::PhaseActive(index) = self.state else {
            return None;
        };
        let profile = self.profile.clone().expect("active shot has a profile");
        let phase = &profile.phases[index];

        self.phase_elapsed += dt;
        self.shot_elapsed += dt;

        // Primary reading for the controlled quantity. Pause needs none.
        let primary_channel = match phase.control {
            ControlMode::Pressure { .. } | ControlMode::Ramp { .. } => {
                Some(SensorChannel::Pressure)
            }
            ControlMode::Flow { .. } => Some(SensorChannel::Flow),
            ControlMode::Pause => None,
        };
        let primary = match primary_channel {
            Some(SensorChannel::Pressure) => sample.pressure,
            Some(SensorChannel::Flow) => sample.flow,
            _ => None,
        };

        if let Some(channel) = primary_channel {
            match primary {
                Some(value) => {
                    self.consecutive_missing = 0;
                    self.last_actual = value;
                }
                None => {
                    self.consecutive_missing += 1;
                    debug!(
                        "missing {} sample ({} consecutive)",
                        channel.name(),
                        self.consecutive_missing
                    );
                    if self.consecutive_missing >= self.fault_grace_ticks {
                        let reason = AbortReason::SensorFault(channel);
                        self.state = SequencerState::Aborted(reason);
                        self.last_command = 0.0;
                        return Some(TickOutput {
                            command: 0.0,
                            phase_index: index,
                            target: phase.control.target_at(self.phase_elapsed),
                            actual: self.last_actual,
                            elapsed: self.phase_elapsed,
                            transition: Some(Transition::Aborted { reason }),
                        });
                    }
                }
            }
        }

        let target = phase.control.target_at(self.phase_elapsed);
        let actual = self.last_actual;

        let mut command = match (&phase.control, primary, self.unit.as_mut()) {
            (ControlMode::Pause, _, _) => 0.0,
            // Inside the grace window: hold the previous command rather than
            // control against a reading we do not have.
            (_, None, _) => self.last_command,
            (_, Some(actual), Some(unit)) => unit.command(target, actual, dt),
            (_, Some(_), None) => 0.0,
        };

        if let Some(w) = sample.weight {
            // Baseline for later phases is the weight carried into them; if
            // the scale was silent at entry, the first reading stands in.
            if self.phase_start_weight.is_none() {
                self.phase_start_weight = Some(w);
            }
            self.last_weight = Some(w);
        }
        let weight_delta = match (sample.weight, self.phase_start_weight) {
            (Some(w), Some(base)) => Some(w - base),
            _ => None,
        };

        let ctx = BreakoutContext {
            elapsed: self.phase_elapsed,
            weight_delta,
            flow: sample.flow,
            pressure: sample.pressure,
            target,
        };

        let transition = self.evaluator.evaluate(phase, &ctx).map(|breakout| {
            debug!(
                "phase {} `{}` breakout: {} >= {:.2}{}",
                index,
                phase.name,
                breakout.kind.name(),
                breakout.threshold,
                if breakout.synthetic { " (max duration)" } else { "" }
            );
            if index + 1 < profile.phases.len() {
                self.enter_phase(index + 1);
                self.state = SequencerState::PhaseActive(index + 1);
                Transition::PhaseAdvanced {
                    next: index + 1,
                    breakout,
                }
            } else {
                self.state = SequencerState::ShotComplete;
                command = 0.0;
                Transition::ShotComplete { breakout }
            }
        });

        self.last_command = command;
        Some(TickOutput {
            command,
            phase_index: index,
            target,
            actual,
            elapsed: self.phase_elapsed,
            transition,
        })
    }

    /// Latch everything the phase needs: its control unit built from the
    /// shot-start gain snapshot, a fresh clock, and a fresh weight baseline.
    fn enter_phase(&mut self, index: usize) {
        let profile = self.profile.as_ref().expect("entering a phase of a profile");
        let phase = &profile.phases[index];
        self.phase_elapsed = 0.0;
        self.phase_start_weight = self.last_weight;
        self.consecutive_missing = 0;
        self.unit = match phase.control {
            ControlMode::Pause => None,
            ControlMode::Pressure { target } | ControlMode::Flow { target } => Some(
                ControlUnit::for_phase(phase.algorithm, &self.shot_gains, target),
            ),
            ControlMode::Ramp { end, .. } => Some(ControlUnit::for_phase(
                phase.algorithm,
                &self.shot_gains,
                end,
            )),
        };
        debug!("entering phase {} `{}`", index, phase.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::profile::{Algorithm, BreakoutCriterion, Phase};

    const DT: f64 = 0.05;

    fn sequencer() -> PhaseSequencer {
        let cfg = EngineConfig::default();
        PhaseSequencer::new(cfg.breakout_priority, cfg.fault_grace_ticks)
    }

    fn profile(phases: Vec<Phase>) -> Arc<Profile> {
        Arc::new(Profile {
            name: "test".into(),
            technique: String::new(),
            default_dose: 18.0,
            default_yield: 36.0,
            default_ratio: 2.0,
            phases,
        })
    }

    fn pressure_phase(target: f64, criteria: Vec<BreakoutCriterion>, max: f64) -> Phase {
        Phase {
            name: "pressure".into(),
            control: ControlMode::Pressure { target },
            algorithm: Algorithm::Pid,
            max_duration: max,
            breakout: criteria,
        }
    }

    fn sample(pressure: f64, flow: f64, weight: f64) -> TickSample {
        TickSample {
            pressure: Some(pressure),
            flow: Some(flow),
            weight: Some(weight),
            temperature: Some(92.0),
        }
    }

    #[test]
    fn empty_profile_is_rejected_before_start() {
        let mut seq = sequencer();
        let err = seq
            .start_shot(profile(vec![]), ControlGains::default())
            .unwrap_err();
        assert!(matches!(err, BrewError::ProfileInvalid { .. }));
        assert_eq!(seq.state(), SequencerState::Idle);
    }

    #[test]
    fn second_start_is_rejected_and_shot_unaffected() {
        let mut seq = sequencer();
        let p = profile(vec![pressure_phase(
            9.0,
            vec![BreakoutCriterion::Time { seconds: 30.0 }],
            45.0,
        )]);
        seq.start_shot(p.clone(), ControlGains::default()).unwrap();
        let err = seq.start_shot(p, ControlGains::default()).unwrap_err();
        assert_eq!(err, BrewError::ShotInProgress);
        assert_eq!(seq.state(), SequencerState::PhaseActive(0));
    }

    #[test]
    fn weight_breakout_preempts_time_at_25s() {
        // 9 bar phase, weight >= 36g or time >= 30s. Weight crosses 36g at
        // t=25s while pressure holds: the shot must end at 25s via weight.
        let mut seq = sequencer();
        let p = profile(vec![pressure_phase(
            9.0,
            vec![
                BreakoutCriterion::Weight { grams: 36.0 },
                BreakoutCriterion::Time { seconds: 30.0 },
            ],
            60.0,
        )]);
        seq.start_shot(p, ControlGains::default()).unwrap();

        let mut elapsed = 0.0;
        loop {
            elapsed += DT;
            let weight = 1.44 * elapsed; // 36g at exactly t=25
            let out = seq.tick(DT, &sample(9.0, 1.44, weight)).unwrap();
            if let Some(Transition::ShotComplete { breakout }) = out.transition {
                assert_eq!(breakout.kind, CriterionKind::Weight);
                assert!(!breakout.synthetic);
                assert!((elapsed - 25.0).abs() < DT, "ended at {elapsed}");
                break;
            }
            assert!(elapsed < 29.0, "weight breakout never fired");
        }
    }

    #[test]
    fn pause_phase_commands_zero_and_ends_on_time() {
        let mut seq = sequencer();
        let p = profile(vec![Phase {
            name: "bloom".into(),
            control: ControlMode::Pause,
            algorithm: Algorithm::Pid,
            max_duration: 30.0,
            breakout: vec![BreakoutCriterion::Time { seconds: 25.0 }],
        }]);
        seq.start_shot(p, ControlGains::default()).unwrap();

        let mut elapsed = 0.0;
        loop {
            elapsed += DT;
            let out = seq.tick(DT, &sample(0.2, 0.0, 0.0)).unwrap();
            assert_eq!(out.command, 0.0, "pause must not actuate");
            if let Some(Transition::ShotComplete { breakout }) = out.transition {
                assert_eq!(breakout.kind, CriterionKind::Time);
                assert!((elapsed - 25.0).abs() < 1e-9, "ended at {elapsed}");
                break;
            }
        }
    }

    #[test]
    fn phases_advance_and_latch_new_targets() {
        let mut seq = sequencer();
        let p = profile(vec![
            pressure_phase(2.5, vec![BreakoutCriterion::Time { seconds: 1.0 }], 5.0),
            pressure_phase(9.0, vec![BreakoutCriterion::Time { seconds: 1.0 }], 5.0),
        ]);
        seq.start_shot(p, ControlGains::default()).unwrap();

        let mut saw_advance = false;
        for _ in 0..40 {
            let out = seq.tick(DT, &sample(2.5, 1.0, 5.0)).unwrap();
            match out.transition {
                Some(Transition::PhaseAdvanced { next, .. }) => {
                    assert_eq!(next, 1);
                    saw_advance = true;
                }
                Some(Transition::ShotComplete { .. }) => {
                    assert!(saw_advance);
                    return;
                }
                _ => {
                    let expected = if saw_advance { 9.0 } else { 2.5 };
                    assert!((out.target - expected).abs() < 1e-9);
                }
            }
        }
        panic!("shot never completed");
    }

    #[test]
    fn abort_is_terminal_and_zeroes_command() {
        let mut seq = sequencer();
        let p = profile(vec![pressure_phase(
            9.0,
            vec![BreakoutCriterion::Time { seconds: 30.0 }],
            45.0,
        )]);
        seq.start_shot(p, ControlGains::default()).unwrap();
        seq.tick(DT, &sample(5.0, 1.0, 2.0)).unwrap();

        assert!(seq.abort(AbortReason::OperatorStop));
        assert_eq!(
            seq.state(),
            SequencerState::Aborted(AbortReason::OperatorStop)
        );
        // Terminal: no further ticks run.
        assert!(seq.tick(DT, &sample(5.0, 1.0, 2.0)).is_none());
        // And a new shot needs reset back through Idle first.
        seq.reset();
        assert_eq!(seq.state(), SequencerState::Idle);
    }

    #[test]
    fn persistent_sensor_fault_aborts_after_grace() {
        let mut seq = sequencer();
        let p = profile(vec![pressure_phase(
            9.0,
            vec![BreakoutCriterion::Time { seconds: 30.0 }],
            45.0,
        )]);
        seq.start_shot(p, ControlGains::default()).unwrap();

        // A healthy tick, then the pressure transducer goes silent.
        seq.tick(DT, &sample(8.0, 1.0, 2.0)).unwrap();
        let dead = TickSample {
            pressure: None,
            flow: Some(1.0),
            weight: Some(2.0),
            temperature: Some(92.0),
        };
        let out1 = seq.tick(DT, &dead).unwrap();
        assert!(out1.transition.is_none(), "one miss is within grace");
        let out2 = seq.tick(DT, &dead).unwrap();
        assert!(out2.transition.is_none(), "two misses are within grace");
        let out3 = seq.tick(DT, &dead).unwrap();
        match out3.transition {
            Some(Transition::Aborted { reason }) => {
                assert_eq!(reason, AbortReason::SensorFault(SensorChannel::Pressure));
                assert_eq!(out3.command, 0.0);
            }
            other => panic!("expected abort on third miss, got {other:?}"),
        }
    }

    #[test]
    fn transient_fault_within_grace_recovers() {
        let mut seq = sequencer();
        let p = profile(vec![pressure_phase(
            9.0,
            vec![BreakoutCriterion::Time { seconds: 30.0 }],
            45.0,
        )]);
        seq.start_shot(p, ControlGains::default()).unwrap();
        seq.tick(DT, &sample(8.0, 1.0, 2.0)).unwrap();

        let dead = TickSample {
            pressure: None,
            flow: None,
            weight: None,
            temperature: None,
        };
        let held = seq.tick(DT, &dead).unwrap();
        let healthy = seq.tick(DT, &sample(8.5, 1.0, 2.1)).unwrap();
        assert!(healthy.transition.is_none());
        // Held command during the gap, live control after recovery.
        assert_eq!(held.command, held.command.clamp(0.0, 1.0));
        assert_eq!(seq.state(), SequencerState::PhaseActive(0));
    }

    #[test]
    fn shot_terminates_within_sum_of_max_durations() {
        // No criterion can ever be satisfied (weight never arrives), so both
        // phases must fall back to their hard max durations.
        let mut seq = sequencer();
        let p = profile(vec![
            pressure_phase(9.0, vec![BreakoutCriterion::Weight { grams: 36.0 }], 1.0),
            pressure_phase(6.0, vec![BreakoutCriterion::Weight { grams: 50.0 }], 2.0),
        ]);
        seq.start_shot(p, ControlGains::default()).unwrap();

        let no_weight = TickSample {
            pressure: Some(8.0),
            flow: Some(1.0),
            weight: None,
            temperature: None,
        };
        let budget = 1.0 + 2.0;
        loop {
            let out = seq.tick(DT, &no_weight).unwrap();
            if let Some(Transition::ShotComplete { breakout }) = out.transition {
                assert!(breakout.synthetic);
                break;
            }
            assert!(
                seq.shot_elapsed() <= budget + 2.0 * DT,
                "ran past the duration budget: {}",
                seq.shot_elapsed()
            );
        }
    }
}
