//! Shot capture and cross-shot learning: the per-tick trace recorder, the
//! bounded shot history, and the gain-retuning engine that consumes it.

pub mod history;
pub mod learning;
pub mod recorder;
