//! Sliding-window transfer rate estimation

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Smoothed bytes-per-second estimate over a trailing window.
///
/// Samples older than the window are discarded on every update. Until a
/// full window has elapsed the rate is computed over the elapsed time, so
/// a fresh connection does not report an artificially low rate.
#[derive(Debug, Clone)]
pub struct RateMeter {
    window: Duration,
    started: Instant,
    samples: VecDeque<(Instant, u64)>,
    total: u64,
}

impl RateMeter {
    pub fn new(window: Duration) -> Self {
        Self::starting_at(window, Instant::now())
    }

    pub fn starting_at(window: Duration, started: Instant) -> Self {
        Self {
            window: window.max(Duration::from_millis(100)),
            started,
            samples: VecDeque::new(),
            total: 0,
        }
    }

    /// Records transferred bytes at the current instant.
    pub fn record(&mut self, bytes: u64) {
        self.record_at(bytes, Instant::now());
    }

    pub fn record_at(&mut self, bytes: u64, now: Instant) {
        self.total = self.total.saturating_add(bytes);
        match self.samples.back_mut() {
            // Coalesce bursts within 100ms into one sample
            Some((at, amount)) if now.duration_since(*at) < Duration::from_millis(100) => {
                *amount += bytes;
            }
            _ => self.samples.push_back((now, bytes)),
        }
        self.prune(now);
    }

    /// Current rate in bytes per second.
    pub fn rate(&self) -> u64 {
        self.rate_at(Instant::now())
    }

    pub fn rate_at(&self, now: Instant) -> u64 {
        let in_window: u64 = self
            .samples
            .iter()
            .filter(|(at, _)| now.saturating_duration_since(*at) <= self.window)
            .map(|(_, bytes)| *bytes)
            .sum();

        let span = now
            .saturating_duration_since(self.started)
            .clamp(Duration::from_secs(1), self.window.max(Duration::from_secs(1)));
        (in_window as f64 / span.as_secs_f64()) as u64
    }

    /// Total bytes recorded since creation.
    pub fn total(&self) -> u64 {
        self.total
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.samples.front() {
            if now.saturating_duration_since(*at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_over_window() {
        let start = Instant::now();
        let mut meter = RateMeter::starting_at(Duration::from_secs(5), start);

        for second in 0..5 {
            meter.record_at(1000, start + Duration::from_secs(second));
        }

        assert_eq!(meter.rate_at(start + Duration::from_secs(5)), 1000);
        assert_eq!(meter.total(), 5000);
    }

    #[test]
    fn test_old_samples_expire() {
        let start = Instant::now();
        let mut meter = RateMeter::starting_at(Duration::from_secs(2), start);

        meter.record_at(10_000, start);
        assert_eq!(meter.rate_at(start + Duration::from_secs(10)), 0);
        assert_eq!(meter.total(), 10_000);
    }

    #[test]
    fn test_fresh_meter_uses_elapsed_time() {
        let start = Instant::now();
        let mut meter = RateMeter::starting_at(Duration::from_secs(5), start);

        meter.record_at(4000, start + Duration::from_millis(500));
        // One second minimum span
        assert_eq!(meter.rate_at(start + Duration::from_millis(900)), 4000);
        assert_eq!(meter.rate_at(start + Duration::from_secs(2)), 2000);
    }
}
