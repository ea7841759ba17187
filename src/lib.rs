//! # brew_engine
//!
//! Closed-loop brew controller core for an espresso machine: multi-phase
//! extraction profiles executed under pressure/flow control, breakout
//! arbitration between competing termination criteria, per-shot trace
//! recording, and a learning pass that retunes PID gains from shot history
//! inside a safety envelope.
//!
//! ## Architecture
//! - **Sensing** ([`sensing`]): drivers publish into a latest-value sample
//!   bus; the control tick consumes only the newest reading per channel.
//! - **Control** ([`control`]): the phase sequencer walks a profile's
//!   phases, one interchangeable control unit (PID / fuzzy / adaptive) per
//!   phase, with OR-semantics breakout criteria and a mandatory hard
//!   max-duration fallback.
//! - **Engine** ([`engine`]): a single fixed-period real-time tick drives
//!   everything; commands in and telemetry out ride bounded channels with
//!   non-blocking sends.
//! - **Shots** ([`shot`]): per-tick traces, summary statistics, a bounded
//!   circular history, and cross-shot gain learning on its own thread.
//! - **Health** ([`health`]): a rolling error log and an aggregator that
//!   folds system/network/sensor/error state into one 0–100 score.
//! - **Telemetry** ([`telemetry`]): lock-free event recording with CSV
//!   export, plus live metric buffers for dashboards.

pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod health;
pub mod profile;
pub mod sensing;
pub mod shot;
pub mod telemetry;
