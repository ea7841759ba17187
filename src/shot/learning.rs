//! Cross-shot gain retuning.
//!
//! Runs once per completed shot on its own thread, never inside the control
//! tick. Reads a window of recent shot summaries, proposes at most one
//! bounded gain step, clamps it into the safety envelope, and stores the
//! result for the *next* shot to snapshot. Disabling learning freezes the
//! gains while shots keep being recorded.

use crossbeam::channel::Receiver;
use log::{debug, info, warn};
use statrs::statistics::Statistics;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::config::LearningConfig;
use crate::control::gains::{ControlGains, SharedGains};
use crate::shot::history::{SharedHistory, ShotHistory};
use crate::shot::recorder::ShotRecord;
use crate::telemetry::events::{BrewEvent, EventRecorder};

/// One applied gain step, for telemetry.
#[derive(Debug, Clone, Copy)]
pub struct GainAdjustment {
    pub before: ControlGains,
    pub after: ControlGains,
    /// True when the proposed step ran into the safety envelope.
    pub clamped: bool,
}

pub struct LearningEngine {
    cfg: LearningConfig,
    gains: SharedGains,
    enabled: Arc<AtomicBool>,
}

impl LearningEngine {
    pub fn new(cfg: LearningConfig, gains: SharedGains, enabled: Arc<AtomicBool>) -> Self {
        Self { cfg, gains, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Evaluate the learning window after a shot landed in history. Returns
    /// the applied adjustment, or `None` when nothing changed.
    ///
    /// Aborted shots stay in history for diagnostics but do not feed tuning:
    /// their truncated traces would bias the settling statistics.
    pub fn on_shot_complete(&self, history: &ShotHistory) -> Option<GainAdjustment> {
        if !self.is_enabled() {
            debug!("learning disabled, gains frozen");
            return None;
        }

        let window: Vec<_> = history
            .recent(self.cfg.window)
            .into_iter()
            .filter(|r| r.abort_reason.is_none())
            .collect();
        if window.is_empty() {
            return None;
        }

        let overshoots: Vec<f64> = window.iter().filter_map(|r| r.mean_overshoot()).collect();
        let settlings: Vec<f64> = window.iter().filter_map(|r| r.mean_settling()).collect();
        let mean_overshoot = if overshoots.is_empty() { 0.0 } else { overshoots.iter().mean() };
        let mean_settling = if settlings.is_empty() { 0.0 } else { settlings.iter().mean() };

        let before = self.gains.snapshot();
        let mut proposed = before;

        // One bounded step per shot, overshoot correction first: an
        // oscillating machine must calm down before it speeds up.
        if mean_overshoot > self.cfg.overshoot_threshold {
            proposed.kp -= self.cfg.kp_step;
            proposed.kd += self.cfg.kd_step;
        } else if mean_settling > self.cfg.settling_threshold {
            proposed.ki += self.cfg.ki_step;
        } else {
            debug!(
                "window ok (overshoot {:.3}, settling {:.2}s), no adjustment",
                mean_overshoot, mean_settling
            );
            return None;
        }

        let (after, clamped) = self.cfg.bounds.clamp(proposed);
        if clamped {
            warn!(
                "gain step clamped into safety bounds: kp {:.3} ki {:.4} kd {:.3}",
                after.kp, after.ki, after.kd
            );
        }
        self.gains.store(after);
        info!(
            "gains retuned: kp {:.3}->{:.3} ki {:.4}->{:.4} kd {:.3}->{:.3}",
            before.kp, after.kp, before.ki, after.ki, before.kd, after.kd
        );
        Some(GainAdjustment { before, after, clamped })
    }
}

/// Consume completed shots off the channel: append to history, then retune.
/// Runs until the sending side hangs up.
pub fn spawn_learning(
    rx: Receiver<Arc<ShotRecord>>,
    history: SharedHistory,
    engine: LearningEngine,
    events: Arc<EventRecorder>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        while let Ok(record) = rx.recv() {
            let shot_id = record.shot_id;
            let adjustment = {
                let mut h = history.lock();
                h.push(record);
                engine.on_shot_complete(&h)
            };
            if let Some(adj) = adjustment {
                events.record(BrewEvent::GainsAdjusted {
                    shot_id,
                    ts_ns: events.now_ns(),
                    kp: adj.after.kp,
                    ki: adj.after.ki,
                    kd: adj.after.kd,
                    clamped: adj.clamped,
                });
            }
        }
        debug!("learning thread stopped");
    })
}
