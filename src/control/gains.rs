//! PID gain block shared between the learning engine and the control loop.
//!
//! Single-writer discipline: the learning thread is the only writer, the
//! sequencer takes a snapshot at shot start and never looks again until the
//! next shot. No lock is held inside the control tick.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// PID coefficients. Frozen for the duration of a shot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ControlGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl Default for ControlGains {
    fn default() -> Self {
        // Starting point for an unlearned machine.
        Self { kp: 1.2, ki: 0.01, kd: 0.2 }
    }
}

/// Safety envelope for self-tuning. Proposed gains outside the envelope are
/// clamped, never rejected.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct GainBounds {
    pub kp: (f64, f64),
    pub ki: (f64, f64),
    pub kd: (f64, f64),
}

impl Default for GainBounds {
    fn default() -> Self {
        Self {
            kp: (0.5, 8.0),
            ki: (0.0, 1.0),
            kd: (0.0, 2.0),
        }
    }
}

impl GainBounds {
    /// Clamp `gains` into the envelope. Returns the clamped gains and whether
    /// any component was actually clamped.
    pub fn clamp(&self, gains: ControlGains) -> (ControlGains, bool) {
        let clamped = ControlGains {
            kp: gains.kp.clamp(self.kp.0, self.kp.1),
            ki: gains.ki.clamp(self.ki.0, self.ki.1),
            kd: gains.kd.clamp(self.kd.0, self.kd.1),
        };
        (clamped, clamped != gains)
    }
}

/// Shared gain block. Writer: learning thread. Readers: snapshot at shot
/// start only.
#[derive(Clone)]
pub struct SharedGains {
    inner: Arc<Mutex<ControlGains>>,
}

impl SharedGains {
    pub fn new(initial: ControlGains) -> Self {
        Self {
            inner: Arc::new(Mutex::new(initial)),
        }
    }

    /// Copy of the current gains.
    pub fn snapshot(&self) -> ControlGains {
        *self.inner.lock()
    }

    /// Replace the gains. Learning-thread only.
    pub fn store(&self, gains: ControlGains) {
        *self.inner.lock() = gains;
    }
}
