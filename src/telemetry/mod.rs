//! Observability: lock-free event recording with CSV export, live bounded
//! metric buffers, and end-of-shot trace export.

pub mod events;
pub mod export;
pub mod metrics;
