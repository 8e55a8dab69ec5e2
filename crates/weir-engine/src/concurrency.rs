use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Neutral priority assigned to indexes with no declared or configured
/// priority, so unconfigured sources sort ahead of loaded ones without
/// special-casing.
pub const DEFAULT_PRIORITY: i64 = i32::MAX as i64;

/// Live subscription counter plus configured limits for one source index.
#[derive(Debug)]
pub struct ConcurrencyRecord {
    current: AtomicU64,
    /// Configured maximum concurrent subscriptions, 0 = unlimited.
    cap: u64,
    /// Configured priority, higher preferred.
    priority: i64,
}

impl ConcurrencyRecord {
    fn new(cap: u64, priority: i64) -> Self {
        Self {
            current: AtomicU64::new(0),
            cap,
            priority,
        }
    }
}

/// Process-wide registry of per-index subscription counters.
///
/// Caps and priorities come from the environment (`M3U_MAX_CONCURRENCY_<index>`
/// and `M3U_PRIORITY_<index>`), resolved on first touch of each index. The
/// counters themselves are in-memory only and do not survive restarts.
#[derive(Debug, Default)]
pub struct ConcurrencyManager {
    records: RwLock<HashMap<String, Arc<ConcurrencyRecord>>>,
}

impl ConcurrencyManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override cap/priority for an index. Intended for tests and embedders
    /// that do not configure through the environment; resets the live count.
    pub fn set_limits(&self, index: &str, cap: u64, priority: i64) {
        self.records
            .write()
            .insert(index.to_string(), Arc::new(ConcurrencyRecord::new(cap, priority)));
    }

    /// Seed an index's record from a source declaration.
    ///
    /// First contact wins: an existing record is left untouched, and the
    /// environment variables still override the declared values.
    pub fn declare(&self, index: &str, max_concurrency: u64, priority: i64) {
        if self.records.read().contains_key(index) {
            return;
        }
        let mut records = self.records.write();
        records.entry(index.to_string()).or_insert_with(|| {
            let cap = env_u64(&format!("M3U_MAX_CONCURRENCY_{index}")).unwrap_or(max_concurrency);
            let priority = env_i64(&format!("M3U_PRIORITY_{index}")).unwrap_or(priority);
            debug!(index, cap, priority, "Registered declared concurrency record");
            Arc::new(ConcurrencyRecord::new(cap, priority))
        });
    }

    fn record(&self, index: &str) -> Arc<ConcurrencyRecord> {
        if let Some(record) = self.records.read().get(index) {
            return Arc::clone(record);
        }

        let mut records = self.records.write();
        // A racing creator may have won between the locks.
        Arc::clone(records.entry(index.to_string()).or_insert_with(|| {
            let cap = env_u64(&format!("M3U_MAX_CONCURRENCY_{index}")).unwrap_or(0);
            let priority =
                env_i64(&format!("M3U_PRIORITY_{index}")).unwrap_or(DEFAULT_PRIORITY);
            debug!(index, cap, priority, "Registered concurrency record");
            Arc::new(ConcurrencyRecord::new(cap, priority))
        }))
    }

    pub fn increment(&self, index: &str) {
        self.record(index).current.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement the live count, clamped at zero.
    pub fn decrement(&self, index: &str) {
        let record = self.record(index);
        let mut current = record.current.load(Ordering::SeqCst);
        while current > 0 {
            match record.current.compare_exchange(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Whether the index is at or over its configured cap.
    pub fn check_concurrency(&self, index: &str) -> bool {
        let record = self.record(index);
        record.cap > 0 && record.current.load(Ordering::SeqCst) >= record.cap
    }

    /// Desirability of an index for the balancer's sort: configured priority
    /// minus live subscriptions, higher = more desirable.
    pub fn priority_value(&self, index: &str) -> i64 {
        let record = self.record(index);
        record.priority - record.current.load(Ordering::SeqCst) as i64
    }

    /// Read-only `(current, cap, priority)` snapshot.
    pub fn status(&self, index: &str) -> (u64, u64, i64) {
        let record = self.record(index);
        (
            record.current.load(Ordering::SeqCst),
            record.cap,
            record.priority,
        )
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.trim().parse::<u64>().ok()
}

fn env_i64(key: &str) -> Option<i64> {
    std::env::var(key).ok()?.trim().parse::<i64>().ok()
}
