//! Process counters.
//!
//! Shared across the provisioner and updated by the component that observes
//! each event. All fields are atomics, so recording never locks.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Scanner counters.
#[derive(Debug, Default)]
pub struct ScanStats {
    cycles: AtomicU64,
    errors: AtomicU64,
    appeared: AtomicU64,
    vanished: AtomicU64,
}

impl ScanStats {
    /// Completed cycles are tracked by number, not counted.
    pub fn set_cycles(&self, cycles: u64) {
        self.cycles.store(cycles, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        bump(&self.errors);
    }

    pub fn record_appeared(&self) {
        bump(&self.appeared);
    }

    pub fn record_vanished(&self) {
        bump(&self.vanished);
    }

    pub fn cycles(&self) -> u64 {
        load(&self.cycles)
    }

    pub fn errors(&self) -> u64 {
        load(&self.errors)
    }
}

/// Join outcome counters.
#[derive(Debug, Default)]
pub struct JoinStats {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl JoinStats {
    pub fn record_attempt(&self) {
        bump(&self.attempts);
    }

    pub fn record_success(&self) {
        bump(&self.successes);
    }

    pub fn record_failure(&self) {
        bump(&self.failures);
    }

    pub fn attempts(&self) -> u64 {
        load(&self.attempts)
    }

    pub fn successes(&self) -> u64 {
        load(&self.successes)
    }

    pub fn failures(&self) -> u64 {
        load(&self.failures)
    }
}

/// GATT traffic counters.
#[derive(Debug, Default)]
pub struct GattStats {
    reads: AtomicU64,
    writes: AtomicU64,
    rejections: AtomicU64,
    notifications: AtomicU64,
}

impl GattStats {
    pub fn record_read(&self) {
        bump(&self.reads);
    }

    pub fn record_write(&self) {
        bump(&self.writes);
    }

    /// A read or write answered with an ATT error.
    pub fn record_rejection(&self) {
        bump(&self.rejections);
    }

    pub fn record_notification(&self) {
        bump(&self.notifications);
    }

    pub fn reads(&self) -> u64 {
        load(&self.reads)
    }

    pub fn rejections(&self) -> u64 {
        load(&self.rejections)
    }

    pub fn notifications(&self) -> u64 {
        load(&self.notifications)
    }
}

/// All counters for one process.
#[derive(Debug)]
pub struct ProvisionerStats {
    start_time: Instant,
    pub scan: ScanStats,
    pub join: JoinStats,
    pub gatt: GattStats,
}

impl ProvisionerStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            scan: ScanStats::default(),
            join: JoinStats::default(),
            gatt: GattStats::default(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Point-in-time copy for serialization.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.uptime_secs(),
            scan: ScanCounts {
                cycles: load(&self.scan.cycles),
                errors: load(&self.scan.errors),
                appeared: load(&self.scan.appeared),
                vanished: load(&self.scan.vanished),
            },
            join: JoinCounts {
                attempts: load(&self.join.attempts),
                successes: load(&self.join.successes),
                failures: load(&self.join.failures),
            },
            gatt: GattCounts {
                reads: load(&self.gatt.reads),
                writes: load(&self.gatt.writes),
                rejections: load(&self.gatt.rejections),
                notifications: load(&self.gatt.notifications),
            },
        }
    }
}

impl Default for ProvisionerStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanCounts {
    pub cycles: u64,
    pub errors: u64,
    pub appeared: u64,
    pub vanished: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinCounts {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GattCounts {
    pub reads: u64,
    pub writes: u64,
    pub rejections: u64,
    pub notifications: u64,
}

/// Serializable copy of [`ProvisionerStats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub scan: ScanCounts,
    pub join: JoinCounts,
    pub gatt: GattCounts,
}
