//! Latest-value sample cache between sensor drivers and the control tick.
//!
//! Drivers publish readings from their own threads at whatever rate the
//! hardware produces them; the control tick consumes only the newest value
//! per channel, without blocking. A value older than the staleness window is
//! treated as missing, which the sequencer handles as a fault, never a stall.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// One physical measurement channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorChannel {
    Pressure,
    Flow,
    Weight,
    Temperature,
}

impl SensorChannel {
    pub const ALL: [SensorChannel; 4] = [
        SensorChannel::Pressure,
        SensorChannel::Flow,
        SensorChannel::Weight,
        SensorChannel::Temperature,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SensorChannel::Pressure => "pressure",
            SensorChannel::Flow => "flow",
            SensorChannel::Weight => "weight",
            SensorChannel::Temperature => "temperature",
        }
    }
}

/// A single timestamped reading.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub value: f64,
    pub seq: u64,
    pub at: Instant,
}

/// Everything the control tick needs from the sensors, collected in one
/// non-blocking pass. `None` means missing or stale.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickSample {
    pub pressure: Option<f64>,
    pub flow: Option<f64>,
    pub weight: Option<f64>,
    pub temperature: Option<f64>,
}

/// Concurrent latest-value store, one slot per channel.
pub struct SampleBus {
    latest: DashMap<SensorChannel, Sample>,
    stale_after: Duration,
    stale_reads: AtomicU64,
}

impl SampleBus {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            latest: DashMap::new(),
            stale_after,
            stale_reads: AtomicU64::new(0),
        }
    }

    /// Publish a new reading. Overwrites whatever was there; the bus keeps
    /// only the newest value per channel.
    pub fn publish(&self, channel: SensorChannel, value: f64, seq: u64) {
        self.latest.insert(
            channel,
            Sample {
                value,
                seq,
                at: Instant::now(),
            },
        );
    }

    /// Newest reading for `channel`, or `None` if nothing fresh enough
    /// exists. Stale hits are counted for health scoring.
    pub fn latest(&self, channel: SensorChannel) -> Option<f64> {
        match self.latest.get(&channel) {
            Some(s) if s.at.elapsed() <= self.stale_after => Some(s.value),
            Some(_) => {
                self.stale_reads.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => None,
        }
    }

    /// Snapshot all channels for one control tick.
    pub fn collect(&self) -> TickSample {
        TickSample {
            pressure: self.latest(SensorChannel::Pressure),
            flow: self.latest(SensorChannel::Flow),
            weight: self.latest(SensorChannel::Weight),
            temperature: self.latest(SensorChannel::Temperature),
        }
    }

    /// Per-channel liveness, consumed by the health aggregator.
    pub fn channel_flags(&self) -> Vec<(SensorChannel, bool)> {
        SensorChannel::ALL
            .iter()
            .map(|&ch| {
                let ok = self
                    .latest
                    .get(&ch)
                    .map(|s| s.at.elapsed() <= self.stale_after)
                    .unwrap_or(false);
                (ch, ok)
            })
            .collect()
    }

    /// Cumulative count of reads that found only a stale value.
    pub fn stale_read_count(&self) -> u64 {
        self.stale_reads.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_sample_is_returned() {
        let bus = SampleBus::new(Duration::from_millis(150));
        bus.publish(SensorChannel::Pressure, 9.0, 1);
        assert_eq!(bus.latest(SensorChannel::Pressure), Some(9.0));
    }

    #[test]
    fn missing_channel_reads_none() {
        let bus = SampleBus::new(Duration::from_millis(150));
        assert_eq!(bus.latest(SensorChannel::Weight), None);
        let flags = bus.channel_flags();
        assert!(flags.iter().all(|&(_, ok)| !ok));
    }

    #[test]
    fn stale_sample_reads_none_and_is_counted() {
        let bus = SampleBus::new(Duration::from_millis(0));
        bus.publish(SensorChannel::Flow, 2.0, 1);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(bus.latest(SensorChannel::Flow), None);
        assert!(bus.stale_read_count() >= 1);
    }

    #[test]
    fn collect_snapshots_all_channels() {
        let bus = SampleBus::new(Duration::from_millis(150));
        bus.publish(SensorChannel::Pressure, 8.8, 1);
        bus.publish(SensorChannel::Weight, 12.0, 1);
        let s = bus.collect();
        assert_eq!(s.pressure, Some(8.8));
        assert_eq!(s.weight, Some(12.0));
        assert_eq!(s.flow, None);
    }
}
