use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(5);

/// Sliding-window throughput average for the minimum-throughput guard.
///
/// Samples older than the 5 s window are evicted on every record; the check
/// only engages once a full window of history exists, so slow starts are not
/// punished.
#[derive(Debug)]
pub struct ThroughputMeter {
    /// Minimum acceptable bytes/s; 0 disables the meter.
    minimum: u64,
    samples: VecDeque<(Instant, usize)>,
    started: Instant,
}

impl ThroughputMeter {
    pub fn new(minimum: u64) -> Self {
        Self {
            minimum,
            samples: VecDeque::new(),
            started: Instant::now(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.minimum > 0
    }

    /// Record `bytes` received now.
    pub fn record(&mut self, bytes: usize) {
        if !self.enabled() {
            return;
        }
        let now = Instant::now();
        self.samples.push_back((now, bytes));
        self.evict(now);
    }

    fn evict(&mut self, now: Instant) {
        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Whether the windowed average has dropped below the floor.
    pub fn is_starved(&mut self) -> bool {
        if !self.enabled() {
            return false;
        }
        let now = Instant::now();
        if now.duration_since(self.started) < WINDOW {
            return false;
        }
        self.evict(now);
        let total: usize = self.samples.iter().map(|(_, bytes)| bytes).sum();
        let rate = total as f64 / WINDOW.as_secs_f64();
        rate < self.minimum as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_meter_never_starves() {
        let mut meter = ThroughputMeter::new(0);
        assert!(!meter.is_starved());
    }

    #[test]
    fn fresh_meter_grants_a_grace_window() {
        let mut meter = ThroughputMeter::new(1_000_000);
        meter.record(1);
        assert!(!meter.is_starved());
    }

    #[test]
    fn starvation_after_window_with_no_bytes() {
        let mut meter = ThroughputMeter::new(1000);
        // Age the meter past the window without feeding it.
        meter.started = Instant::now() - Duration::from_secs(6);
        assert!(meter.is_starved());
    }

    #[test]
    fn healthy_rate_is_not_starved() {
        let mut meter = ThroughputMeter::new(10);
        meter.started = Instant::now() - Duration::from_secs(6);
        meter.record(10_000);
        assert!(!meter.is_starved());
    }
}
