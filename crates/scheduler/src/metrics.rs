//! Process-wide command counters, broken down by command name.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use once_cell::sync::Lazy;

#[derive(Default)]
struct CommandStats {
    enqueued: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    wait_ms: AtomicU64,
    run_ms: AtomicU64,
}

static STATS: Lazy<DashMap<String, CommandStats>> = Lazy::new(DashMap::new);

fn with_stats(command: &str, update: impl FnOnce(&CommandStats)) {
    if let Some(stats) = STATS.get(command) {
        update(stats.value());
        return;
    }
    let stats = STATS.entry(command.to_string()).or_default();
    update(stats.value());
}

pub fn record_enqueued(command: &str) {
    with_stats(command, |stats| {
        stats.enqueued.fetch_add(1, Ordering::Relaxed);
    });
}

pub fn record_rejected(command: &str) {
    with_stats(command, |stats| {
        stats.rejected.fetch_add(1, Ordering::Relaxed);
    });
}

pub fn record_finished(command: &str, succeeded: bool, wait_ms: u64, run_ms: u64) {
    with_stats(command, |stats| {
        let counter = if succeeded {
            &stats.completed
        } else {
            &stats.failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
        stats.wait_ms.fetch_add(wait_ms, Ordering::Relaxed);
        stats.run_ms.fetch_add(run_ms, Ordering::Relaxed);
    });
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandCounts {
    pub enqueued: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    pub wait_ms: u64,
    pub run_ms: u64,
}

#[derive(Clone, Debug, Default)]
pub struct QueueMetricsSnapshot {
    pub enqueued: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
    pub by_command: BTreeMap<String, CommandCounts>,
}

pub fn snapshot() -> QueueMetricsSnapshot {
    let mut snapshot = QueueMetricsSnapshot::default();
    for entry in STATS.iter() {
        let stats = entry.value();
        let counts = CommandCounts {
            enqueued: stats.enqueued.load(Ordering::Relaxed),
            rejected: stats.rejected.load(Ordering::Relaxed),
            completed: stats.completed.load(Ordering::Relaxed),
            failed: stats.failed.load(Ordering::Relaxed),
            wait_ms: stats.wait_ms.load(Ordering::Relaxed),
            run_ms: stats.run_ms.load(Ordering::Relaxed),
        };
        snapshot.enqueued += counts.enqueued;
        snapshot.rejected += counts.rejected;
        snapshot.completed += counts.completed;
        snapshot.failed += counts.failed;
        snapshot.by_command.insert(entry.key().clone(), counts);
    }
    snapshot
}
