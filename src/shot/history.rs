//! Bounded circular history of completed shots. Oldest records are evicted
//! once capacity is reached; records are never mutated after insertion.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::shot::recorder::ShotRecord;

pub struct ShotHistory {
    records: VecDeque<Arc<ShotRecord>>,
    capacity: usize,
}

impl ShotHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, record: Arc<ShotRecord>) {
        if self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The most recent `n` records, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Arc<ShotRecord>> {
        let skip = self.records.len().saturating_sub(n);
        self.records.iter().skip(skip).cloned().collect()
    }

    pub fn last(&self) -> Option<Arc<ShotRecord>> {
        self.records.back().cloned()
    }
}

pub type SharedHistory = Arc<Mutex<ShotHistory>>;

pub fn shared_history(capacity: usize) -> SharedHistory {
    Arc::new(Mutex::new(ShotHistory::new(capacity)))
}
