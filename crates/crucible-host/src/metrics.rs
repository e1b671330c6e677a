//! In-process counters, surfaced over `/info`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Metrics {
    pub new_keys_total: AtomicU64,
    pub compiled_scripts_total: AtomicU64,
    pub compilation_failures_total: AtomicU64,
    pub executed_scripts_total: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub new_keys_total: u64,
    pub compiled_scripts_total: u64,
    pub compilation_failures_total: u64,
    pub executed_scripts_total: u64,
}

impl Metrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            new_keys_total: self.new_keys_total.load(Ordering::Relaxed),
            compiled_scripts_total: self.compiled_scripts_total.load(Ordering::Relaxed),
            compilation_failures_total: self.compilation_failures_total.load(Ordering::Relaxed),
            executed_scripts_total: self.executed_scripts_total.load(Ordering::Relaxed),
        }
    }
}

pub(crate) fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
