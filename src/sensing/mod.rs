//! Sensor side of the engine: the latest-sample cache consumed by the
//! control tick, and a simulated hydraulic rig that stands in for the real
//! pump/puck/scale hardware.

pub mod rig;
pub mod sampler;
