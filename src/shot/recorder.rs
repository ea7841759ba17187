//! Per-shot trace capture and summary statistics.
//!
//! The recorder accumulates one sample per control tick while a shot runs
//! and, when the shot ends, derives per-phase summaries: peak overshoot and
//! settling time for phases that held a constant target, plus the average
//! pressure/flow and weight gain the analytics side expects for every phase.
//! A finished [`ShotRecord`] is immutable.

use serde::Serialize;
use statrs::statistics::Statistics;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::control::breakout::Breakout;
use crate::error::AbortReason;
use crate::profile::Profile;

/// One control tick, as recorded.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TraceSample {
    /// Seconds since shot start.
    pub elapsed: f64,
    pub phase: usize,
    pub target: f64,
    pub actual: f64,
    pub command: f64,
    pub pressure: Option<f64>,
    pub flow: Option<f64>,
    pub weight: Option<f64>,
}

/// How a phase ended.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PhaseEnd {
    pub criterion: &'static str,
    pub threshold: f64,
    /// True when the hard max-duration fallback fired.
    pub synthetic: bool,
}

/// Summary derived for one executed phase.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseSummary {
    pub index: usize,
    pub name: String,
    pub duration: f64,
    /// The held target, for phases that had one (pressure/flow holds).
    pub held_target: Option<f64>,
    /// max(actual − target) while the target was held, floored at zero.
    pub peak_overshoot: Option<f64>,
    /// Seconds from phase start until the actual value stayed inside the
    /// tolerance band for the rest of the phase.
    pub settling_time: Option<f64>,
    pub avg_pressure: f64,
    pub avg_flow: f64,
    pub weight_gain: f64,
    pub ended_by: Option<PhaseEnd>,
}

/// Immutable record of a completed (or aborted) shot.
#[derive(Debug, Clone, Serialize)]
pub struct ShotRecord {
    pub shot_id: u64,
    pub profile: String,
    pub started_epoch_s: u64,
    pub duration: f64,
    pub phases: Vec<PhaseSummary>,
    pub peak_pressure: f64,
    pub avg_pressure: f64,
    /// 100 − coefficient of variation, clamped to [0, 100].
    pub pressure_stability: f64,
    pub peak_flow: f64,
    pub avg_flow: f64,
    pub flow_stability: f64,
    pub final_weight: f64,
    pub abort_reason: Option<&'static str>,
    pub trace: Vec<TraceSample>,
}

impl ShotRecord {
    /// Mean peak overshoot over the phases that held a target.
    pub fn mean_overshoot(&self) -> Option<f64> {
        mean_of(self.phases.iter().filter_map(|p| p.peak_overshoot))
    }

    /// Mean settling time over the phases that settled.
    pub fn mean_settling(&self) -> Option<f64> {
        mean_of(self.phases.iter().filter_map(|p| p.settling_time))
    }
}

fn mean_of(values: impl Iterator<Item = f64>) -> Option<f64> {
    let v: Vec<f64> = values.collect();
    if v.is_empty() { None } else { Some(v.iter().mean()) }
}

struct PhaseMark {
    index: usize,
    name: String,
    start_trace: usize,
    start_elapsed: f64,
    held_target: Option<f64>,
    ended_by: Option<PhaseEnd>,
}

/// Accumulates one shot. Created at shot start, consumed by `finish`.
pub struct ShotRecorder {
    shot_id: u64,
    profile: String,
    started_epoch_s: u64,
    tolerance_pct: f64,
    trace: Vec<TraceSample>,
    marks: Vec<PhaseMark>,
}

impl ShotRecorder {
    pub fn begin(shot_id: u64, profile: &Profile, tolerance_pct: f64) -> Self {
        let started_epoch_s = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let mut rec = Self {
            shot_id,
            profile: profile.name.clone(),
            started_epoch_s,
            tolerance_pct,
            trace: Vec::with_capacity(1024),
            marks: Vec::with_capacity(profile.phases.len()),
        };
        rec.mark_phase(0, profile);
        rec
    }

    /// Record entry into `index`. Phase 0 is marked by `begin`.
    pub fn mark_phase(&mut self, index: usize, profile: &Profile) {
        let phase = &profile.phases[index];
        let held_target = phase
            .control
            .holds_constant_target()
            .then(|| phase.control.target_at(0.0));
        self.marks.push(PhaseMark {
            index,
            name: phase.name.clone(),
            start_trace: self.trace.len(),
            start_elapsed: self.trace.last().map(|s| s.elapsed).unwrap_or(0.0),
            held_target,
            ended_by: None,
        });
    }

    /// Close the phase currently being recorded with its breakout.
    pub fn close_phase(&mut self, breakout: &Breakout) {
        if let Some(mark) = self.marks.last_mut() {
            mark.ended_by = Some(PhaseEnd {
                criterion: breakout.kind.name(),
                threshold: breakout.threshold,
                synthetic: breakout.synthetic,
            });
        }
    }

    /// Append one tick.
    pub fn push(&mut self, sample: TraceSample) {
        self.trace.push(sample);
    }

    pub fn len(&self) -> usize {
        self.trace.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trace.is_empty()
    }

    /// Derive summaries and seal the record.
    pub fn finish(self, abort: Option<AbortReason>) -> ShotRecord {
        let duration = self.trace.last().map(|s| s.elapsed).unwrap_or(0.0);

        let mut phases = Vec::with_capacity(self.marks.len());
        for (i, mark) in self.marks.iter().enumerate() {
            let end = self
                .marks
                .get(i + 1)
                .map(|m| m.start_trace)
                .unwrap_or(self.trace.len());
            let slice = &self.trace[mark.start_trace..end];
            phases.push(summarize_phase(mark, slice, self.tolerance_pct));
        }

        let pressures: Vec<f64> = self.trace.iter().filter_map(|s| s.pressure).collect();
        let flows: Vec<f64> = self.trace.iter().filter_map(|s| s.flow).collect();
        let final_weight = self
            .trace
            .iter()
            .rev()
            .find_map(|s| s.weight)
            .unwrap_or(0.0);

        let (peak_pressure, avg_pressure, pressure_stability) = series_stats(&pressures);
        let (peak_flow, avg_flow, flow_stability) = series_stats(&flows);

        ShotRecord {
            shot_id: self.shot_id,
            profile: self.profile,
            started_epoch_s: self.started_epoch_s,
            duration,
            phases,
            peak_pressure,
            avg_pressure,
            pressure_stability,
            peak_flow,
            avg_flow,
            flow_stability,
            final_weight,
            abort_reason: abort.map(|r| r.code()),
            trace: self.trace,
        }
    }
}

fn summarize_phase(mark: &PhaseMark, slice: &[TraceSample], tolerance_pct: f64) -> PhaseSummary {
    let duration = slice
        .last()
        .map(|s| s.elapsed - mark.start_elapsed)
        .unwrap_or(0.0);

    let (peak_overshoot, settling_time) = match mark.held_target {
        Some(target) if !slice.is_empty() => {
            let overshoot = slice
                .iter()
                .map(|s| s.actual - target)
                .fold(0.0_f64, f64::max);
            let band = (target * tolerance_pct).abs();
            (Some(overshoot), settling_time(slice, target, band, mark.start_elapsed))
        }
        _ => (None, None),
    };

    let pressures: Vec<f64> = slice.iter().filter_map(|s| s.pressure).collect();
    let flows: Vec<f64> = slice.iter().filter_map(|s| s.flow).collect();
    let weight_gain = match (
        slice.iter().find_map(|s| s.weight),
        slice.iter().rev().find_map(|s| s.weight),
    ) {
        (Some(first), Some(last)) => last - first,
        _ => 0.0,
    };

    PhaseSummary {
        index: mark.index,
        name: mark.name.clone(),
        duration,
        held_target: mark.held_target,
        peak_overshoot,
        settling_time,
        avg_pressure: if pressures.is_empty() { 0.0 } else { pressures.iter().mean() },
        avg_flow: if flows.is_empty() { 0.0 } else { flows.iter().mean() },
        weight_gain,
        ended_by: mark.ended_by,
    }
}

/// Earliest time after which the actual value never left the band again.
fn settling_time(
    slice: &[TraceSample],
    target: f64,
    band: f64,
    start_elapsed: f64,
) -> Option<f64> {
    let mut settled_from = None;
    for s in slice {
        if (s.actual - target).abs() <= band {
            settled_from.get_or_insert(s.elapsed);
        } else {
            settled_from = None;
        }
    }
    settled_from.map(|t| t - start_elapsed)
}

/// (peak, mean, stability%) of a series. Stability is 100 − CV, the same
/// figure the analytics dashboard shows.
fn series_stats(values: &[f64]) -> (f64, f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let peak = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mean = values.iter().mean();
    let std = if values.len() > 1 { values.iter().std_dev() } else { 0.0 };
    let stability = if mean.abs() > 1e-9 {
        (100.0 - std / mean * 100.0).clamp(0.0, 100.0)
    } else {
        0.0
    };
    (peak, mean, stability)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{Algorithm, BreakoutCriterion, ControlMode, CriterionKind, Phase};

    fn one_phase_profile() -> Profile {
        Profile {
            name: "test".into(),
            technique: String::new(),
            default_dose: 18.0,
            default_yield: 36.0,
            default_ratio: 2.0,
            phases: vec![Phase {
                name: "extraction".into(),
                control: ControlMode::Pressure { target: 9.0 },
                algorithm: Algorithm::Pid,
                max_duration: 45.0,
                breakout: vec![BreakoutCriterion::Time { seconds: 30.0 }],
            }],
        }
    }

    fn sample(elapsed: f64, actual: f64) -> TraceSample {
        TraceSample {
            elapsed,
            phase: 0,
            target: 9.0,
            actual,
            command: 0.5,
            pressure: Some(actual),
            flow: Some(1.8),
            weight: Some(elapsed * 1.5),
        }
    }

    #[test]
    fn overshoot_is_peak_excursion_above_target() {
        let profile = one_phase_profile();
        let mut rec = ShotRecorder::begin(1, &profile, 0.02);
        for (t, p) in [(0.05, 6.0), (0.10, 9.4), (0.15, 9.8), (0.20, 9.1)] {
            rec.push(sample(t, p));
        }
        let record = rec.finish(None);
        let overshoot = record.phases[0].peak_overshoot.unwrap();
        assert!((overshoot - 0.8).abs() < 1e-9);
    }

    #[test]
    fn undershoot_never_reports_negative_overshoot() {
        let profile = one_phase_profile();
        let mut rec = ShotRecorder::begin(1, &profile, 0.02);
        for (t, p) in [(0.05, 6.0), (0.10, 7.0), (0.15, 8.0)] {
            rec.push(sample(t, p));
        }
        let record = rec.finish(None);
        assert_eq!(record.phases[0].peak_overshoot, Some(0.0));
    }

    #[test]
    fn settling_time_is_entry_into_the_final_in_band_run() {
        let profile = one_phase_profile();
        let mut rec = ShotRecorder::begin(1, &profile, 0.02);
        // Band is 9.0 * 2% = 0.18. In band, out again, then settled for good
        // from t=0.30.
        for (t, p) in [
            (0.10, 9.05),
            (0.20, 9.50),
            (0.30, 9.10),
            (0.40, 8.95),
            (0.50, 9.02),
        ] {
            rec.push(sample(t, p));
        }
        let record = rec.finish(None);
        let settling = record.phases[0].settling_time.unwrap();
        assert!((settling - 0.30).abs() < 1e-9);
    }

    #[test]
    fn never_settling_yields_none() {
        let profile = one_phase_profile();
        let mut rec = ShotRecorder::begin(1, &profile, 0.02);
        for (t, p) in [(0.10, 6.0), (0.20, 12.0), (0.30, 6.0)] {
            rec.push(sample(t, p));
        }
        let record = rec.finish(None);
        assert_eq!(record.phases[0].settling_time, None);
    }

    #[test]
    fn pause_and_ramp_phases_get_no_overshoot_summary() {
        let profile = Profile {
            phases: vec![Phase {
                name: "bloom".into(),
                control: ControlMode::Pause,
                algorithm: Algorithm::Pid,
                max_duration: 30.0,
                breakout: vec![BreakoutCriterion::Time { seconds: 10.0 }],
            }],
            ..one_phase_profile()
        };
        let mut rec = ShotRecorder::begin(1, &profile, 0.02);
        rec.push(sample(0.05, 0.3));
        let record = rec.finish(None);
        assert_eq!(record.phases[0].peak_overshoot, None);
        assert_eq!(record.phases[0].settling_time, None);
    }

    #[test]
    fn phase_breakdown_tracks_weight_gain_and_end() {
        let profile = one_phase_profile();
        let mut rec = ShotRecorder::begin(1, &profile, 0.02);
        for i in 1..=10 {
            rec.push(sample(i as f64 * 0.1, 9.0));
        }
        rec.close_phase(&Breakout {
            kind: CriterionKind::Weight,
            threshold: 36.0,
            synthetic: false,
        });
        let record = rec.finish(None);
        let phase = &record.phases[0];
        assert!((phase.weight_gain - (1.5 - 0.15)).abs() < 1e-9);
        let end = phase.ended_by.expect("phase was closed");
        assert_eq!(end.criterion, "weight");
        assert!(!end.synthetic);
        assert!((record.final_weight - 1.5).abs() < 1e-9);
    }

    #[test]
    fn abort_reason_is_carried_on_the_record() {
        let profile = one_phase_profile();
        let mut rec = ShotRecorder::begin(1, &profile, 0.02);
        rec.push(sample(0.05, 4.0));
        let record = rec.finish(Some(AbortReason::OperatorStop));
        assert_eq!(record.abort_reason, Some("operator_stop"));
    }
}
