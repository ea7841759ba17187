//! System health: the rolling error log every subsystem reports into, and
//! the aggregator that condenses it with system/network/sensor state into a
//! single 0–100 score.

pub mod aggregator;
pub mod error_log;
