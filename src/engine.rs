//! The brew engine: one real-time tick loop driving the phase sequencer,
//! plus the channel surface the outside world talks to.
//!
//! Scheduling model: a single periodic tick runs the sequencer, controller,
//! and breakout arbitration synchronously. Commands are drained without
//! blocking at the top of each tick; telemetry leaves through a bounded
//! channel with non-blocking sends; learning and export run on other
//! threads and never touch the tick's deadline.

use crossbeam::channel::{Receiver, Sender};
use log::{error, info, warn};
use serde::Serialize;
use spin_sleep::{SpinSleeper, SpinStrategy};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thread_priority::{ThreadBuilderExt, ThreadPriority};

use crate::config::EngineConfig;
use crate::control::gains::{ControlGains, SharedGains};
use crate::control::sequencer::{PhaseSequencer, TickOutput, Transition};
use crate::error::AbortReason;
use crate::health::aggregator::{HealthAggregator, HealthSnapshot};
use crate::health::error_log::{ErrorLog, Severity};
use crate::profile::Profile;
use crate::sensing::rig::Actuator;
use crate::sensing::sampler::{SampleBus, TickSample};
use crate::shot::history::{SharedHistory, shared_history};
use crate::shot::recorder::{ShotRecord, ShotRecorder, TraceSample};
use crate::telemetry::events::{BrewEvent, EventRecorder};
use crate::telemetry::metrics::{SharedMetrics, lock_metrics, push_capped, push_capped_u64};

/// Consecutive tick overruns that escalate from counter to error-log entry.
const OVERRUN_CONFIRM: u32 = 3;
/// Health snapshots are also pushed unprompted every this many ticks.
const HEALTH_PUBLISH_TICKS: u64 = 100;

/// Commands the engine accepts. All are drained at tick boundaries.
#[derive(Debug, Clone)]
pub enum Command {
    StartShot {
        profile: Arc<Profile>,
        /// Replaces the threshold of every Weight criterion for this shot.
        target_weight: Option<f64>,
    },
    AbortShot,
    SetLearningEnabled(bool),
    RequestHealth,
    RequestDiagnostics,
}

/// Per-tick telemetry published while a shot is active.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TickTelemetry {
    pub shot_id: u64,
    pub elapsed: f64,
    pub phase: usize,
    pub target: f64,
    pub actual: f64,
    pub pressure: Option<f64>,
    pub flow: Option<f64>,
    pub weight: Option<f64>,
    pub command: f64,
}

/// On-demand view of engine internals.
#[derive(Debug, Clone)]
pub struct DiagnosticSnapshot {
    pub gains: ControlGains,
    pub learning_enabled: bool,
    pub shots_recorded: usize,
    pub total_ticks: u64,
    pub tick_overruns: u64,
    pub dropped_events: u64,
}

/// Everything the engine publishes.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ShotStarted { shot_id: u64, profile: String },
    Tick(TickTelemetry),
    PhaseChanged { shot_id: u64, phase: usize, name: String },
    ShotFinished(Arc<ShotRecord>),
    Health(HealthSnapshot),
    Diagnostics(DiagnosticSnapshot),
    CommandRejected { command: &'static str, error: String },
}

/// State shared between the engine and its satellite threads.
#[derive(Clone)]
pub struct EngineShared {
    pub gains: SharedGains,
    pub learning_enabled: Arc<AtomicBool>,
    pub history: SharedHistory,
    pub error_log: Arc<ErrorLog>,
    pub health: Arc<HealthAggregator>,
    pub events: Arc<EventRecorder>,
    pub metrics: SharedMetrics,
}

impl EngineShared {
    pub fn new(cfg: &EngineConfig) -> Self {
        let error_log = Arc::new(ErrorLog::new(256));
        Self {
            gains: SharedGains::new(cfg.initial_gains),
            learning_enabled: Arc::new(AtomicBool::new(true)),
            history: shared_history(cfg.history_capacity),
            health: Arc::new(HealthAggregator::new(error_log.clone())),
            error_log,
            events: Arc::new(EventRecorder::new()),
            metrics: SharedMetrics::default(),
        }
    }
}

pub struct BrewEngine {
    cfg: EngineConfig,
    sequencer: PhaseSequencer,
    bus: Arc<SampleBus>,
    actuator: Box<dyn Actuator + Send>,
    shared: EngineShared,
    cmd_rx: Receiver<Command>,
    out_tx: Sender<EngineEvent>,
    shots_tx: Sender<Arc<ShotRecord>>,
    running: Arc<AtomicBool>,

    // Shot-scoped state.
    recorder: Option<ShotRecorder>,
    active_profile: Option<Arc<Profile>>,
    shot_id: u64,
    /// Raw scale reading at shot start; readings are tared against it so the
    /// sequencer sees weight gained this shot.
    tare: f64,
    ticks: u64,
}

impl BrewEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: EngineConfig,
        bus: Arc<SampleBus>,
        actuator: Box<dyn Actuator + Send>,
        shared: EngineShared,
        cmd_rx: Receiver<Command>,
        out_tx: Sender<EngineEvent>,
        shots_tx: Sender<Arc<ShotRecord>>,
        running: Arc<AtomicBool>,
    ) -> Self {
        let sequencer =
            PhaseSequencer::new(cfg.breakout_priority.clone(), cfg.fault_grace_ticks);
        Self {
            cfg,
            sequencer,
            bus,
            actuator,
            shared,
            cmd_rx,
            out_tx,
            shots_tx,
            running,
            recorder: None,
            active_profile: None,
            shot_id: 0,
            tare: 0.0,
            ticks: 0,
        }
    }

    /// The real-time loop. Fixed period, spin-sleep scheduling, overrun
    /// accounting against the tick budget.
    pub fn run(&mut self) {
        let period = Duration::from_millis(self.cfg.tick_ms);
        let budget_us = self.cfg.tick_ms * 1_000;
        let sleeper = SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread);

        let mut next_deadline = Instant::now() + period;
        let mut last_tick = Instant::now();
        let mut consecutive_overruns: u32 = 0;

        info!("control loop up: {}ms tick", self.cfg.tick_ms);
        while self.running.load(Ordering::Acquire) {
            let now = Instant::now();
            if now < next_deadline {
                sleeper.sleep(next_deadline - now);
            }

            let cycle_start = Instant::now();
            let dt = cycle_start
                .duration_since(last_tick)
                .as_secs_f64()
                .clamp(1e-6, 0.2);
            last_tick = cycle_start;

            self.step(dt);

            // Overruns are recorded immediately; three in a row escalate to
            // the error log as sustained overload.
            let elapsed_us = cycle_start.elapsed().as_micros() as u64;
            {
                let mut m = lock_metrics(&self.shared.metrics);
                push_capped_u64(&mut m.tick_latency_us, elapsed_us);
                m.total_ticks += 1;
                if elapsed_us > budget_us {
                    m.tick_overruns += 1;
                }
            }
            if elapsed_us > budget_us {
                consecutive_overruns += 1;
                if consecutive_overruns >= OVERRUN_CONFIRM {
                    self.shared.error_log.record(
                        Severity::Warning,
                        "tick",
                        format!("{consecutive_overruns} consecutive tick overruns"),
                    );
                    consecutive_overruns = 0;
                }
            } else {
                consecutive_overruns = 0;
            }

            next_deadline += period;
        }

        // Leaving the loop must never leave the pump energized.
        self.actuator.apply(0.0);
        info!("control loop stopped");
    }

    /// One control period, wall-clock free. `run` calls this with measured
    /// dt; tests call it directly.
    pub fn step(&mut self, dt: f64) {
        self.ticks += 1;
        self.drain_commands();

        let raw = self.bus.collect();
        let sample = TickSample {
            weight: raw.weight.map(|w| w - self.tare),
            ..raw
        };

        match self.sequencer.tick(dt, &sample) {
            Some(out) => {
                self.actuator.apply(out.command);
                self.record_tick(&out, &sample);
                if let Some(transition) = out.transition {
                    self.handle_transition(transition, &out);
                }
            }
            None => self.actuator.apply(0.0),
        }

        if self.ticks % HEALTH_PUBLISH_TICKS == 0 {
            let snapshot = self.shared.health.snapshot(&self.bus.channel_flags());
            self.emit(EngineEvent::Health(snapshot));
        }
    }

    fn drain_commands(&mut self) {
        while let Ok(cmd) = self.cmd_rx.try_recv() {
            match cmd {
                Command::StartShot { profile, target_weight } => {
                    self.start_shot(profile, target_weight)
                }
                Command::AbortShot => self.abort_shot(),
                Command::SetLearningEnabled(enabled) => {
                    self.shared.learning_enabled.store(enabled, Ordering::Relaxed);
                    info!("learning {}", if enabled { "enabled" } else { "disabled" });
                    self.shared.error_log.record(
                        Severity::Info,
                        "learning",
                        if enabled { "enabled" } else { "disabled, gains frozen" },
                    );
                }
                Command::RequestHealth => {
                    let snapshot = self.shared.health.snapshot(&self.bus.channel_flags());
                    self.emit(EngineEvent::Health(snapshot));
                }
                Command::RequestDiagnostics => {
                    let (total_ticks, tick_overruns) = {
                        let m = lock_metrics(&self.shared.metrics);
                        (m.total_ticks, m.tick_overruns)
                    };
                    self.emit(EngineEvent::Diagnostics(DiagnosticSnapshot {
                        gains: self.shared.gains.snapshot(),
                        learning_enabled: self.shared.learning_enabled.load(Ordering::Relaxed),
                        shots_recorded: self.shared.history.lock().len(),
                        total_ticks,
                        tick_overruns,
                        dropped_events: self.shared.events.dropped_count(),
                    }));
                }
            }
        }
    }

    fn start_shot(&mut self, profile: Arc<Profile>, target_weight: Option<f64>) {
        let profile = match target_weight {
            Some(grams) => profile.with_target_weight(grams),
            None => profile,
        };

        let gains = self.shared.gains.snapshot();
        match self.sequencer.start_shot(profile.clone(), gains) {
            Ok(shot_id) => {
                self.shot_id = shot_id;
                // Tare the scale so weight criteria see gain for this shot.
                self.tare = self.bus.collect().weight.unwrap_or(0.0);
                self.recorder = Some(ShotRecorder::begin(
                    shot_id,
                    &profile,
                    self.cfg.tolerance_pct,
                ));
                self.active_profile = Some(profile.clone());
                self.shared.events.record(BrewEvent::ShotStarted {
                    shot_id,
                    ts_ns: self.shared.events.now_ns(),
                    profile: profile.name.clone(),
                });
                self.emit(EngineEvent::ShotStarted {
                    shot_id,
                    profile: profile.name.clone(),
                });
            }
            Err(e) => {
                self.shared
                    .error_log
                    .record(Severity::Warning, "command", e.to_string());
                self.emit(EngineEvent::CommandRejected {
                    command: "start_shot",
                    error: e.to_string(),
                });
            }
        }
    }

    fn abort_shot(&mut self) {
        if self.sequencer.abort(AbortReason::OperatorStop) {
            // Pump off before anything else; cleanup must not block.
            self.actuator.apply(0.0);
            self.shared.error_log.record(
                Severity::Info,
                "shot",
                format!("shot {} stopped by operator", self.shot_id),
            );
            self.finish_shot(Some(AbortReason::OperatorStop));
        } else {
            self.emit(EngineEvent::CommandRejected {
                command: "abort_shot",
                error: "no shot in progress".into(),
            });
        }
    }

    fn record_tick(&mut self, out: &TickOutput, sample: &TickSample) {
        let elapsed = self.sequencer.shot_elapsed();
        if let Some(rec) = self.recorder.as_mut() {
            rec.push(TraceSample {
                elapsed,
                phase: out.phase_index,
                target: out.target,
                actual: out.actual,
                command: out.command,
                pressure: sample.pressure,
                flow: sample.flow,
                weight: sample.weight,
            });
        }

        self.shared.events.record(BrewEvent::ControlTick {
            shot_id: self.shot_id,
            ts_ns: self.shared.events.now_ns(),
            phase: out.phase_index,
            target: out.target,
            actual: out.actual,
            command: out.command,
        });

        {
            let mut m = lock_metrics(&self.shared.metrics);
            if let Some(p) = sample.pressure {
                push_capped(&mut m.pressure, p);
            }
            if let Some(f) = sample.flow {
                push_capped(&mut m.flow, f);
            }
            if let Some(w) = sample.weight {
                push_capped(&mut m.weight, w);
            }
            if let Some(t) = sample.temperature {
                push_capped(&mut m.temperature, t);
            }
            push_capped(&mut m.pump_command, out.command);
        }

        self.emit(EngineEvent::Tick(TickTelemetry {
            shot_id: self.shot_id,
            elapsed,
            phase: out.phase_index,
            target: out.target,
            actual: out.actual,
            pressure: sample.pressure,
            flow: sample.flow,
            weight: sample.weight,
            command: out.command,
        }));
    }

    fn handle_transition(&mut self, transition: Transition, out: &TickOutput) {
        match transition {
            Transition::PhaseAdvanced { next, breakout } => {
                if let Some(rec) = self.recorder.as_mut() {
                    rec.close_phase(&breakout);
                }
                let Some(profile) = self.active_profile.clone() else {
                    return;
                };
                if let Some(rec) = self.recorder.as_mut() {
                    rec.mark_phase(next, &profile);
                }
                self.shared.events.record(BrewEvent::BreakoutFired {
                    shot_id: self.shot_id,
                    ts_ns: self.shared.events.now_ns(),
                    phase: out.phase_index,
                    criterion: breakout.kind.name(),
                    synthetic: breakout.synthetic,
                });
                let name = profile.phases[next].name.clone();
                self.shared.events.record(BrewEvent::PhaseEntered {
                    shot_id: self.shot_id,
                    ts_ns: self.shared.events.now_ns(),
                    phase: next,
                    name: name.clone(),
                });
                self.emit(EngineEvent::PhaseChanged {
                    shot_id: self.shot_id,
                    phase: next,
                    name,
                });
            }
            Transition::ShotComplete { breakout } => {
                if let Some(rec) = self.recorder.as_mut() {
                    rec.close_phase(&breakout);
                }
                self.shared.events.record(BrewEvent::BreakoutFired {
                    shot_id: self.shot_id,
                    ts_ns: self.shared.events.now_ns(),
                    phase: out.phase_index,
                    criterion: breakout.kind.name(),
                    synthetic: breakout.synthetic,
                });
                self.finish_shot(None);
            }
            Transition::Aborted { reason } => {
                if let AbortReason::SensorFault(channel) = reason {
                    let mut m = lock_metrics(&self.shared.metrics);
                    m.sensor_faults += 1;
                    drop(m);
                    self.shared.error_log.record(
                        Severity::Critical,
                        "sensors",
                        format!("{} silent past grace window, shot aborted", channel.name()),
                    );
                }
                self.finish_shot(Some(reason));
            }
        }
    }

    /// Seal the record, hand it to the learning thread, publish the summary,
    /// and pass back through Idle so the next shot can start.
    fn finish_shot(&mut self, abort: Option<AbortReason>) {
        let Some(recorder) = self.recorder.take() else {
            return;
        };
        let record = Arc::new(recorder.finish(abort));

        match abort {
            Some(reason) => {
                self.shared.events.record(BrewEvent::ShotAborted {
                    shot_id: record.shot_id,
                    ts_ns: self.shared.events.now_ns(),
                    reason: reason.code(),
                });
                let mut m = lock_metrics(&self.shared.metrics);
                m.shots_aborted += 1;
            }
            None => {
                self.shared.events.record(BrewEvent::ShotCompleted {
                    shot_id: record.shot_id,
                    ts_ns: self.shared.events.now_ns(),
                    duration_s: record.duration,
                    final_weight: record.final_weight,
                });
                info!(
                    "shot {} complete: {:.1}s, {:.1}g",
                    record.shot_id, record.duration, record.final_weight
                );
                let mut m = lock_metrics(&self.shared.metrics);
                m.shots_completed += 1;
            }
        }

        // Learning runs on its own thread; a full channel means a record is
        // dropped from tuning, never a stalled tick.
        if self.shots_tx.try_send(record.clone()).is_err() {
            warn!("learning channel full, shot {} not tuned", record.shot_id);
        }
        self.emit(EngineEvent::ShotFinished(record));

        self.active_profile = None;
        self.sequencer.reset();
    }

    /// Non-blocking publish with a fast-path capacity check; telemetry is
    /// droppable, the tick deadline is not.
    fn emit(&self, event: EngineEvent) {
        if self.out_tx.len() >= self.cfg.channel_capacity {
            return;
        }
        if let Err(e) = self.out_tx.try_send(event) {
            if e.is_disconnected() {
                error!("telemetry channel disconnected");
            }
        }
    }
}

/// Spawn the engine on a dedicated max-priority thread, optionally pinned to
/// a core so background work cannot preempt the tick.
pub fn spawn_engine(mut engine: BrewEngine, pin_core: Option<usize>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("control-tick".into())
        .spawn_with_priority(ThreadPriority::Max, move |priority_result| {
            if priority_result.is_err() {
                warn!("control thread running without elevated priority");
            }
            if let Some(core) = pin_core {
                let core_ids = core_affinity::get_core_ids().unwrap_or_default();
                match core_ids.get(core) {
                    Some(id) if core_affinity::set_for_current(*id) => {
                        info!("control thread pinned to core {core}");
                    }
                    _ => warn!("could not pin control thread to core {core}"),
                }
            }
            engine.run();
        })
        .expect("failed to spawn control thread")
}
