//! Live metric buffers for external dashboards.
//!
//! Subsystems push readings and counters in as they work; consumers read a
//! bounded window (the most recent [`MAX_POINTS`] samples per series). This
//! is the feed a remote UI renders, kept deliberately small and lossy.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

pub const MAX_POINTS: usize = 1_000;

/// Rolling view of the machine, bounded per series.
#[derive(Default, Clone)]
pub struct Metrics {
    /// Sensor readings (newest last).
    pub pressure: VecDeque<f64>,
    pub flow: VecDeque<f64>,
    pub weight: VecDeque<f64>,
    pub temperature: VecDeque<f64>,

    /// Commanded pump power per tick.
    pub pump_command: VecDeque<f64>,

    /// Control-tick execution time (microseconds).
    pub tick_latency_us: VecDeque<u64>,

    pub tick_overruns: u64,
    pub sensor_faults: u64,
    pub shots_completed: u64,
    pub shots_aborted: u64,
    pub total_ticks: u64,
}

pub type SharedMetrics = Arc<Mutex<Metrics>>;

/// Append, evicting the oldest point at capacity.
#[inline]
pub fn push_capped(buf: &mut VecDeque<f64>, val: f64) {
    if buf.len() >= MAX_POINTS {
        buf.pop_front();
    }
    buf.push_back(val);
}

#[inline]
pub fn push_capped_u64(buf: &mut VecDeque<u64>, val: u64) {
    if buf.len() >= MAX_POINTS {
        buf.pop_front();
    }
    buf.push_back(val);
}

/// Lock the shared metrics, recovering from a poisoned mutex: a panicked
/// writer must not take the dashboard feed down with it.
pub fn lock_metrics(metrics: &SharedMetrics) -> std::sync::MutexGuard<'_, Metrics> {
    match metrics.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Min/max/mean summary of a series.
#[derive(Debug, Clone)]
pub struct Stats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub count: usize,
}

pub fn calculate_stats(data: &VecDeque<f64>) -> Option<Stats> {
    if data.is_empty() {
        return None;
    }
    let count = data.len();
    let min = data.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = data.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let mean = data.iter().sum::<f64>() / count as f64;
    Some(Stats { min, max, mean, count })
}

pub fn calculate_stats_u64(data: &VecDeque<u64>) -> Option<Stats> {
    if data.is_empty() {
        return None;
    }
    let count = data.len();
    let min = data.iter().map(|&x| x as f64).fold(f64::INFINITY, f64::min);
    let max = data.iter().map(|&x| x as f64).fold(f64::NEG_INFINITY, f64::max);
    let mean = data.iter().map(|&x| x as f64).sum::<f64>() / count as f64;
    Some(Stats { min, max, mean, count })
}
