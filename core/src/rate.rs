//! Transfer-Rate Calculator: windowed byte-rate estimator (spec.md §4.F step 4, GLOSSARY).
//!
//! An exponential moving average over `window` (default 5 s), updated on every
//! bytes-sent/received event. Atomic counters only; never locked across a suspension
//! point (spec.md §5 Shared-resource policy).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_WINDOW: Duration = Duration::from_secs(5);

/// EMA byte-rate estimator. `rate_bytes_per_sec()` is safe to call from any task.
pub struct TransferRateCalculator {
    window: Duration,
    rate_milli_bytes_per_sec: AtomicU64,
    last_update: Mutex<Instant>,
}

impl TransferRateCalculator {
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self {
            window,
            rate_milli_bytes_per_sec: AtomicU64::new(0),
            last_update: Mutex::new(Instant::now()),
        }
    }

    /// Record `bytes` transferred just now, folding them into the EMA.
    pub fn add_data(&self, bytes: u64) {
        let now = Instant::now();
        let elapsed = {
            let mut last = self.last_update.lock().unwrap();
            let elapsed = now.duration_since(*last);
            *last = now;
            elapsed
        };
        let instantaneous = if elapsed.as_secs_f64() > 0.0 {
            bytes as f64 / elapsed.as_secs_f64()
        } else {
            bytes as f64
        };
        // alpha tuned so the EMA half-life is roughly one window.
        let alpha = (elapsed.as_secs_f64() / self.window.as_secs_f64()).clamp(0.0, 1.0);
        let prev = self.rate_milli_bytes_per_sec.load(Ordering::Relaxed) as f64 / 1000.0;
        let next = prev + alpha * (instantaneous - prev);
        self.rate_milli_bytes_per_sec
            .store((next.max(0.0) * 1000.0) as u64, Ordering::Relaxed);
    }

    pub fn rate_bytes_per_sec(&self) -> u64 {
        self.rate_milli_bytes_per_sec.load(Ordering::Relaxed) / 1000
    }
}

impl Default for TransferRateCalculator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_zero() {
        let calc = TransferRateCalculator::new();
        assert_eq!(calc.rate_bytes_per_sec(), 0);
    }

    #[test]
    fn increases_after_data() {
        let calc = TransferRateCalculator::with_window(Duration::from_millis(50));
        std::thread::sleep(Duration::from_millis(20));
        calc.add_data(1_000_000);
        assert!(calc.rate_bytes_per_sec() > 0);
    }
}
