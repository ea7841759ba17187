//! Non-blocking event recording with background CSV export.
//!
//! The control tick must never wait on I/O, so events go through a bounded
//! lock-free queue and a background thread drains them to disk. If the queue
//! fills, events are dropped and counted rather than blocking the producer.

use crossbeam_queue::ArrayQueue;
use log::error;
use std::{
    fs::File,
    io::{BufWriter, Write},
    sync::Arc,
    sync::atomic::{AtomicU64, Ordering},
    thread,
    time::{Duration, Instant},
};

const EVENT_QUEUE_CAPACITY: usize = 16_384;

/// Lifecycle events of the brew engine. Each variant carries the shot it
/// belongs to and a nanosecond timestamp relative to recorder creation.
#[derive(Debug, Clone)]
pub enum BrewEvent {
    ShotStarted {
        shot_id: u64,
        ts_ns: u64,
        profile: String,
    },
    PhaseEntered {
        shot_id: u64,
        ts_ns: u64,
        phase: usize,
        name: String,
    },
    /// One control period: target vs actual and the commanded pump power.
    ControlTick {
        shot_id: u64,
        ts_ns: u64,
        phase: usize,
        target: f64,
        actual: f64,
        command: f64,
    },
    BreakoutFired {
        shot_id: u64,
        ts_ns: u64,
        phase: usize,
        criterion: &'static str,
        synthetic: bool,
    },
    ShotCompleted {
        shot_id: u64,
        ts_ns: u64,
        duration_s: f64,
        final_weight: f64,
    },
    ShotAborted {
        shot_id: u64,
        ts_ns: u64,
        reason: &'static str,
    },
    GainsAdjusted {
        shot_id: u64,
        ts_ns: u64,
        kp: f64,
        ki: f64,
        kd: f64,
        clamped: bool,
    },
}

impl BrewEvent {
    /// CSV row: shot,event,ts_ns,field1,field2,field3
    pub fn to_csv_row(&self) -> String {
        match self {
            BrewEvent::ShotStarted { shot_id, ts_ns, profile } => {
                format!("{shot_id},ShotStarted,{ts_ns},{profile},,")
            }
            BrewEvent::PhaseEntered { shot_id, ts_ns, phase, name } => {
                format!("{shot_id},PhaseEntered,{ts_ns},{phase},{name},")
            }
            BrewEvent::ControlTick { shot_id, ts_ns, phase, target, actual, command } => {
                format!("{shot_id},ControlTick,{ts_ns},{phase},target={target:.3};actual={actual:.3},{command:.4}")
            }
            BrewEvent::BreakoutFired { shot_id, ts_ns, phase, criterion, synthetic } => {
                format!("{shot_id},BreakoutFired,{ts_ns},{phase},{criterion},{synthetic}")
            }
            BrewEvent::ShotCompleted { shot_id, ts_ns, duration_s, final_weight } => {
                format!("{shot_id},ShotCompleted,{ts_ns},{duration_s:.2},{final_weight:.1},")
            }
            BrewEvent::ShotAborted { shot_id, ts_ns, reason } => {
                format!("{shot_id},ShotAborted,{ts_ns},{reason},,")
            }
            BrewEvent::GainsAdjusted { shot_id, ts_ns, kp, ki, kd, clamped } => {
                format!("{shot_id},GainsAdjusted,{ts_ns},kp={kp:.3};ki={ki:.4};kd={kd:.3},{clamped},")
            }
        }
    }
}

/// Lock-free recorder. `record` never blocks; a full queue drops the event
/// and bumps a counter instead.
pub struct EventRecorder {
    queue: Arc<ArrayQueue<BrewEvent>>,
    dropped: AtomicU64,
    run_start: Instant,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self {
            queue: Arc::new(ArrayQueue::new(EVENT_QUEUE_CAPACITY)),
            dropped: AtomicU64::new(0),
            run_start: Instant::now(),
        }
    }

    #[inline]
    pub fn record(&self, event: BrewEvent) {
        if self.queue.push(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Nanoseconds since recorder creation.
    #[inline]
    pub fn now_ns(&self) -> u64 {
        self.run_start.elapsed().as_nanos() as u64
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Spawn the drain thread. Exits once the queue stays empty after the
    /// recorder's other owners are gone; callers usually just let it run for
    /// the process lifetime.
    pub fn start_exporter(&self, output_csv: String) -> thread::JoinHandle<()> {
        let queue = self.queue.clone();

        thread::spawn(move || {
            let file = match File::create(&output_csv) {
                Ok(f) => f,
                Err(e) => {
                    error!("failed to create event CSV {output_csv}: {e}");
                    return;
                }
            };
            let mut writer = BufWriter::new(file);
            let _ = writeln!(writer, "shot,event,ts_ns,field1,field2,field3");

            loop {
                match queue.pop() {
                    Some(event) => {
                        let _ = writeln!(writer, "{}", event.to_csv_row());
                    }
                    None => {
                        let _ = writer.flush();
                        if Arc::strong_count(&queue) == 1 && queue.is_empty() {
                            break;
                        }
                        thread::sleep(Duration::from_millis(10));
                    }
                }
            }
            let _ = writer.flush();
        })
    }
}

impl Default for EventRecorder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_rows_carry_shot_and_event_name() {
        let row = BrewEvent::ShotStarted {
            shot_id: 7,
            ts_ns: 123,
            profile: "classic".into(),
        }
        .to_csv_row();
        assert!(row.starts_with("7,ShotStarted,123,classic"));
    }

    #[test]
    fn full_queue_drops_and_counts_instead_of_blocking() {
        let rec = EventRecorder::new();
        for i in 0..(EVENT_QUEUE_CAPACITY as u64 + 10) {
            rec.record(BrewEvent::ShotAborted {
                shot_id: i,
                ts_ns: 0,
                reason: "operator_stop",
            });
        }
        assert_eq!(rec.dropped_count(), 10);
    }

    #[test]
    fn timestamps_are_monotonic() {
        let rec = EventRecorder::new();
        let a = rec.now_ns();
        let b = rec.now_ns();
        assert!(b >= a);
    }
}
