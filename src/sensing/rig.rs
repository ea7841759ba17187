//! Simulated hydraulic rig: pump, puck, and scale.
//!
//! Stands in for the real machine so the engine can run end to end on a
//! workstation. Pump power drives pressure through a first-order lag, flow
//! follows pressure through the puck, weight integrates flow. Readings get
//! sensor noise and an optional fault rate that silently drops publishes,
//! which is exactly how a flaky transducer looks to the sample bus.

use rand::random_range;
use spin_sleep::{SpinSleeper, SpinStrategy};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::debug;

use crate::sensing::sampler::{SampleBus, SensorChannel};

/// The actuation seam. The engine writes one normalized pump power per tick;
/// real hardware maps it to a dimmer/PWM duty, the rig integrates it into
/// its plant model.
pub trait Actuator: Send + Sync {
    fn apply(&self, power: f64);
}

/// Pump ceiling with the dimmer fully open.
const MAX_PUMP_BAR: f64 = 10.0;
/// Pump pressure time constant, seconds.
const PUMP_TAU_S: f64 = 0.8;
/// Flow per sqrt-bar through a typical puck.
const PUCK_FLOW_COEFF: f64 = 0.6;
/// Group temperature around which the rig hovers.
const GROUP_TEMP_C: f64 = 92.0;

/// Shared pump-power cell written by the engine thread, read by the rig
/// thread. A single f64 slot, so a lock would be overkill.
#[derive(Clone)]
pub struct PumpHandle {
    power_bits: Arc<AtomicU64>,
}

impl Actuator for PumpHandle {
    fn apply(&self, power: f64) {
        self.power_bits
            .store(power.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }
}

pub struct HydraulicRig {
    bus: Arc<SampleBus>,
    running: Arc<AtomicBool>,
    power_bits: Arc<AtomicU64>,
    sample_interval_ms: u64,
    /// Probability that a given channel's publish is dropped this cycle.
    fault_rate: f64,
}

impl HydraulicRig {
    pub fn new(
        bus: Arc<SampleBus>,
        running: Arc<AtomicBool>,
        sample_interval_ms: u64,
        fault_rate: f64,
    ) -> Self {
        Self {
            bus,
            running,
            power_bits: Arc::new(AtomicU64::new(0.0_f64.to_bits())),
            sample_interval_ms,
            fault_rate,
        }
    }

    /// Handle the engine actuates through.
    pub fn pump_handle(&self) -> PumpHandle {
        PumpHandle {
            power_bits: self.power_bits.clone(),
        }
    }

    /// Run the plant until the shutdown flag drops. Periodic release via
    /// spin sleeping, same scheduling as the control tick.
    pub fn run(self) {
        let period = Duration::from_millis(self.sample_interval_ms);
        let dt = self.sample_interval_ms as f64 / 1_000.0;
        let sleeper = SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread);

        let mut pressure = 0.0_f64;
        let mut weight = 0.0_f64;
        let mut seq: u64 = 1;

        while self.running.load(Ordering::Acquire) {
            sleeper.sleep(period);

            let power = f64::from_bits(self.power_bits.load(Ordering::Relaxed));

            // First-order pump response toward the commanded pressure.
            let target = power * MAX_PUMP_BAR;
            pressure += (target - pressure) * (dt / PUMP_TAU_S).min(1.0);

            // Flow through the puck, weight into the cup.
            let flow = PUCK_FLOW_COEFF * pressure.max(0.0).sqrt();
            weight += flow * dt;

            self.publish(SensorChannel::Pressure, pressure + random_range(-0.05..0.05), seq);
            self.publish(SensorChannel::Flow, (flow + random_range(-0.02..0.02)).max(0.0), seq);
            self.publish(SensorChannel::Weight, weight + random_range(-0.1..0.1), seq);
            self.publish(
                SensorChannel::Temperature,
                GROUP_TEMP_C + random_range(-0.2..0.2),
                seq,
            );

            seq += 1;
        }
        debug!("rig stopped after {seq} cycles");
    }

    fn publish(&self, channel: SensorChannel, value: f64, seq: u64) {
        if self.fault_rate > 0.0 && random_range(0.0..1.0) < self.fault_rate {
            // Dropped publish: the bus goes stale on this channel, which the
            // control side sees as a missing reading.
            return;
        }
        self.bus.publish(channel, value, seq);
    }
}

/// Spawn the rig on its own thread.
pub fn spawn_rig(rig: HydraulicRig) -> JoinHandle<()> {
    thread::Builder::new()
        .name("hydraulic-rig".into())
        .spawn(move || rig.run())
        .expect("failed to spawn rig thread")
}
