//! Error taxonomy for the brew control core.
//!
//! Failures that reach an operator do so in exactly two ways: a command is
//! rejected up front with a [`BrewError`], or a running shot terminates as
//! `Aborted` carrying an [`AbortReason`]. Everything else (gain clamping,
//! actuator saturation) is resolved inside the tick that detected it and is
//! visible only through telemetry.

use thiserror::Error;

use crate::sensing::sampler::SensorChannel;

/// Command-level failures. Rejections happen before any shot state changes;
/// the current shot, if any, is unaffected.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BrewError {
    /// Profile failed validation; nothing was started.
    #[error("profile `{name}` rejected: {reason}")]
    ProfileInvalid { name: String, reason: String },

    /// A conflicting command arrived while a shot is active.
    #[error("shot already in progress")]
    ShotInProgress,

    /// A sensor channel went silent past the grace window.
    #[error("sensor fault on {channel:?}: {missed} consecutive missing samples")]
    SensorFault { channel: SensorChannel, missed: u32 },
}

/// Why a shot ended in the `Aborted` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// External stop command.
    OperatorStop,
    /// A required sensor stayed silent past the grace window.
    SensorFault(SensorChannel),
}

impl AbortReason {
    /// Stable reason code, used in telemetry rows and the error log.
    pub fn code(&self) -> &'static str {
        match self {
            AbortReason::OperatorStop => "operator_stop",
            AbortReason::SensorFault(_) => "sensor_fault",
        }
    }
}
