//! Interactive harness for the brew engine.
//!
//! Wires the simulated hydraulic rig, the real-time control thread, the
//! learning thread, and the telemetry exporter together, then drives shots
//! from a small menu. Shot traces and summaries land under `data/`.

use brew_engine::config::EngineConfig;
use brew_engine::engine::{
    BrewEngine, Command, EngineEvent, EngineShared, spawn_engine,
};
use brew_engine::profile::{
    Algorithm, BreakoutCriterion, ControlMode, Phase, Profile, parse_profile,
};
use brew_engine::sensing::rig::{HydraulicRig, spawn_rig};
use brew_engine::sensing::sampler::SampleBus;
use brew_engine::shot::learning::{LearningEngine, spawn_learning};
use brew_engine::telemetry::export::export_shot;

use crossbeam::channel::{Receiver, Sender, bounded};
use log::{error, info};
use std::{
    fs::create_dir_all,
    io::{Write, stdin, stdout},
    path::Path,
    sync::Arc,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

const DEFAULT_PIN_CORE: usize = 0;
const RIG_SAMPLE_INTERVAL_MS: u64 = 10;
const RIG_FAULT_RATE: f64 = 0.002;

fn main() {
    env_logger::init();
    info!("=== BREW ENGINE START ===");

    let cfg = load_config();
    create_dir_all("data/logs").ok();

    let shared = EngineShared::new(&cfg);
    let bus = Arc::new(SampleBus::new(Duration::from_millis(cfg.sensor_stale_ms)));
    let running = Arc::new(AtomicBool::new(true));

    // Simulated machine: pump + puck + scale on its own thread.
    let rig = HydraulicRig::new(bus.clone(), running.clone(), RIG_SAMPLE_INTERVAL_MS, RIG_FAULT_RATE);
    let pump = rig.pump_handle();
    let rig_handle = spawn_rig(rig);

    // Event CSV exporter drains the lock-free queue in the background.
    let _exporter = shared
        .events
        .start_exporter("data/logs/brew_events.csv".into());

    // Learning thread: consumes completed shots, retunes gains between shots.
    let (shots_tx, shots_rx) = bounded(cfg.channel_capacity);
    let learning = LearningEngine::new(
        cfg.learning.clone(),
        shared.gains.clone(),
        shared.learning_enabled.clone(),
    );
    let learning_handle = spawn_learning(
        shots_rx,
        shared.history.clone(),
        learning,
        shared.events.clone(),
    );

    // Control thread: max priority, pinned, fixed tick.
    let (cmd_tx, cmd_rx) = bounded(cfg.channel_capacity);
    let (out_tx, out_rx) = bounded(cfg.channel_capacity);
    let engine = BrewEngine::new(
        cfg.clone(),
        bus,
        Box::new(pump),
        shared.clone(),
        cmd_rx,
        out_tx,
        shots_tx,
        running.clone(),
    );
    let engine_handle = spawn_engine(engine, Some(DEFAULT_PIN_CORE));

    let profiles = builtin_profiles();
    loop {
        match prompt_menu().as_str() {
            "1" | "" => {
                let profile = prompt_profile(&profiles);
                let target = prompt_target_weight();
                run_shot(&cmd_tx, &out_rx, profile, target);
            }
            "2" => {
                let profile = prompt_profile(&profiles);
                let shots = prompt_shot_count();
                for n in 1..=shots {
                    println!("--- shot {n}/{shots} ---");
                    run_shot(&cmd_tx, &out_rx, profile.clone(), None);
                    show_diagnostics(&cmd_tx, &out_rx);
                }
            }
            "3" => {
                let enabled = prompt_yes_no("Enable learning?");
                let _ = cmd_tx.send(Command::SetLearningEnabled(enabled));
            }
            "4" => {
                let _ = cmd_tx.send(Command::RequestHealth);
                if let Some(EngineEvent::Health(h)) =
                    wait_for(&out_rx, |e| matches!(e, EngineEvent::Health(_)))
                {
                    println!("health: {} ({})", h.score, h.tier.name());
                    for c in &h.components {
                        println!("  {:<8} {:>3}  {}", c.name, c.score, c.message);
                    }
                }
            }
            "5" => show_diagnostics(&cmd_tx, &out_rx),
            "6" => break,
            other => println!("Unrecognized option '{other}', please try again."),
        }
    }

    println!("Shutting down...");
    running.store(false, Ordering::Release);
    let _ = engine_handle.join();
    let _ = rig_handle.join();
    let _ = learning_handle.join();
    info!("=== BREW ENGINE FINISHED ===");
}

/// Optional JSON config override as the first CLI argument.
fn load_config() -> EngineConfig {
    match std::env::args().nth(1) {
        Some(path) => match std::fs::read_to_string(&path) {
            Ok(json) => match EngineConfig::from_json(&json) {
                Ok(cfg) => {
                    info!("config loaded from {path}");
                    cfg
                }
                Err(e) => {
                    error!("bad config {path}: {e}; using defaults");
                    EngineConfig::default()
                }
            },
            Err(e) => {
                error!("cannot read {path}: {e}; using defaults");
                EngineConfig::default()
            }
        },
        None => EngineConfig::default(),
    }
}

/// Drive one shot to completion, printing progress, then export its record.
fn run_shot(
    cmd_tx: &Sender<Command>,
    out_rx: &Receiver<EngineEvent>,
    profile: Arc<Profile>,
    target_weight: Option<f64>,
) {
    if cmd_tx
        .send(Command::StartShot { profile, target_weight })
        .is_err()
    {
        error!("engine is gone");
        return;
    }

    let mut last_print = 0.0_f64;
    loop {
        match out_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(EngineEvent::ShotStarted { shot_id, profile }) => {
                println!("shot {shot_id}: `{profile}`");
            }
            Ok(EngineEvent::Tick(t)) => {
                if t.elapsed - last_print >= 1.0 {
                    last_print = t.elapsed;
                    println!(
                        "  {:5.1}s  phase {}  target {:4.1}  actual {:4.1}  power {:3.0}%  weight {:5.1}g",
                        t.elapsed,
                        t.phase,
                        t.target,
                        t.actual,
                        t.command * 100.0,
                        t.weight.unwrap_or(0.0),
                    );
                }
            }
            Ok(EngineEvent::PhaseChanged { phase, name, .. }) => {
                println!("  -> phase {phase}: {name}");
            }
            Ok(EngineEvent::ShotFinished(record)) => {
                match record.abort_reason {
                    Some(reason) => println!("  aborted: {reason}"),
                    None => println!(
                        "  done: {:.1}s, {:.1}g, peak {:.1} bar, stability {:.0}%",
                        record.duration,
                        record.final_weight,
                        record.peak_pressure,
                        record.pressure_stability,
                    ),
                }
                export_shot(&record, Path::new("data/shots"));
                return;
            }
            Ok(EngineEvent::CommandRejected { command, error }) => {
                println!("  rejected ({command}): {error}");
                return;
            }
            Ok(_) => {}
            Err(_) => {
                error!("no events from engine; giving up on this shot");
                return;
            }
        }
    }
}

fn show_diagnostics(cmd_tx: &Sender<Command>, out_rx: &Receiver<EngineEvent>) {
    let _ = cmd_tx.send(Command::RequestDiagnostics);
    if let Some(EngineEvent::Diagnostics(d)) =
        wait_for(out_rx, |e| matches!(e, EngineEvent::Diagnostics(_)))
    {
        println!(
            "gains kp={:.3} ki={:.4} kd={:.3} | learning {} | {} shots recorded | {} ticks, {} overruns, {} events dropped",
            d.gains.kp,
            d.gains.ki,
            d.gains.kd,
            if d.learning_enabled { "on" } else { "off" },
            d.shots_recorded,
            d.total_ticks,
            d.tick_overruns,
            d.dropped_events,
        );
    }
}

/// Wait for the first event matching `pred`, discarding others.
fn wait_for(
    out_rx: &Receiver<EngineEvent>,
    pred: impl Fn(&EngineEvent) -> bool,
) -> Option<EngineEvent> {
    let deadline = std::time::Instant::now() + Duration::from_secs(3);
    while std::time::Instant::now() < deadline {
        match out_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(e) if pred(&e) => return Some(e),
            Ok(_) => {}
            Err(_) => {}
        }
    }
    None
}

fn builtin_profiles() -> Vec<Arc<Profile>> {
    vec![
        Arc::new(Profile {
            name: "classic 9 bar".into(),
            technique: "flat".into(),
            default_dose: 18.0,
            default_yield: 36.0,
            default_ratio: 2.0,
            phases: vec![
                Phase {
                    name: "preinfusion".into(),
                    control: ControlMode::Pressure { target: 2.5 },
                    algorithm: Algorithm::Pid,
                    max_duration: 15.0,
                    breakout: vec![BreakoutCriterion::Time { seconds: 8.0 }],
                },
                Phase {
                    name: "extraction".into(),
                    control: ControlMode::Pressure { target: 9.0 },
                    algorithm: Algorithm::Pid,
                    max_duration: 40.0,
                    breakout: vec![
                        BreakoutCriterion::Weight { grams: 36.0 },
                        BreakoutCriterion::Time { seconds: 30.0 },
                    ],
                },
            ],
        }),
        Arc::new(Profile {
            name: "bloom and ramp".into(),
            technique: "soft".into(),
            default_dose: 18.0,
            default_yield: 40.0,
            default_ratio: 2.2,
            phases: vec![
                Phase {
                    name: "wetting".into(),
                    control: ControlMode::Pressure { target: 2.0 },
                    algorithm: Algorithm::Fuzzy,
                    max_duration: 12.0,
                    breakout: vec![BreakoutCriterion::Time { seconds: 6.0 }],
                },
                Phase {
                    name: "bloom".into(),
                    control: ControlMode::Pause,
                    algorithm: Algorithm::Pid,
                    max_duration: 30.0,
                    breakout: vec![BreakoutCriterion::Time { seconds: 15.0 }],
                },
                Phase {
                    name: "ramp to peak".into(),
                    control: ControlMode::Ramp { start: 2.0, end: 9.0, duration: 8.0 },
                    algorithm: Algorithm::Pid,
                    max_duration: 20.0,
                    breakout: vec![BreakoutCriterion::PressurePercent { percent: 95.0 }],
                },
                Phase {
                    name: "hold".into(),
                    control: ControlMode::Pressure { target: 9.0 },
                    algorithm: Algorithm::Adaptive,
                    max_duration: 40.0,
                    breakout: vec![
                        BreakoutCriterion::Weight { grams: 40.0 },
                        BreakoutCriterion::Time { seconds: 35.0 },
                    ],
                },
            ],
        }),
        Arc::new(Profile {
            name: "flow profiled".into(),
            technique: "lever-like".into(),
            default_dose: 18.0,
            default_yield: 45.0,
            default_ratio: 2.5,
            phases: vec![
                Phase {
                    name: "gentle fill".into(),
                    control: ControlMode::Flow { target: 2.0 },
                    algorithm: Algorithm::Pid,
                    max_duration: 20.0,
                    breakout: vec![BreakoutCriterion::PressurePercent { percent: 80.0 }],
                },
                Phase {
                    name: "drawdown".into(),
                    control: ControlMode::Flow { target: 1.5 },
                    algorithm: Algorithm::Pid,
                    max_duration: 45.0,
                    breakout: vec![
                        BreakoutCriterion::Weight { grams: 45.0 },
                        BreakoutCriterion::Time { seconds: 40.0 },
                    ],
                },
            ],
        }),
    ]
}

fn prompt_menu() -> String {
    println!("\n┌─────────────────────────────────────┐");
    println!("│        BREW ENGINE MENU             │");
    println!("├─────────────────────────────────────┤");
    println!("│  1) Pull a shot                     │");
    println!("│  2) Pull N shots (watch learning)   │");
    println!("│  3) Toggle learning                 │");
    println!("│  4) Health snapshot                 │");
    println!("│  5) Diagnostics                     │");
    println!("│  6) Exit                            │");
    println!("└─────────────────────────────────────┘");
    print!("Select [1-6] (default: 1): ");
    read_line()
}

fn prompt_profile(profiles: &[Arc<Profile>]) -> Arc<Profile> {
    println!("Profiles:");
    for (i, p) in profiles.iter().enumerate() {
        println!(
            "  {}) {} ({} phases, {:.0}g -> {:.0}g)",
            i + 1,
            p.name,
            p.phases.len(),
            p.default_dose,
            p.default_yield,
        );
    }
    println!("  f) load from JSON file");
    print!("Profile [1-{}] (default: 1): ", profiles.len());
    let input = read_line();
    if input == "f" {
        print!("Path: ");
        let path = read_line();
        match std::fs::read_to_string(&path) {
            Ok(json) => match parse_profile(&json) {
                Ok(p) => return Arc::new(p),
                Err(e) => println!("  {e}; falling back to default"),
            },
            Err(e) => println!("  cannot read {path}: {e}; falling back to default"),
        }
        return profiles[0].clone();
    }
    let idx = input.parse::<usize>().unwrap_or(1).clamp(1, profiles.len());
    profiles[idx - 1].clone()
}

fn prompt_target_weight() -> Option<f64> {
    print!("Target weight override in grams (empty: none): ");
    read_line().parse::<f64>().ok().filter(|g| *g > 0.0)
}

fn prompt_shot_count() -> usize {
    print!("How many shots [default: 10]: ");
    read_line().parse::<usize>().unwrap_or(10).max(1)
}

fn prompt_yes_no(question: &str) -> bool {
    print!("{question} [y/N]: ");
    matches!(read_line().as_str(), "y" | "Y" | "yes")
}

fn read_line() -> String {
    let _ = stdout().flush();
    let mut input = String::new();
    let _ = stdin().read_line(&mut input);
    input.trim().to_string()
}
