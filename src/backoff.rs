//! Exponential backoff with jitter.
//!
//! One [`Backoff`] is kept per failure domain. The attempt counter lives
//! behind a lock so a single instance can be shared across tasks.

use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;

/// Fraction of the delay used as jitter in either direction.
const JITTER_FRACTION: f64 = 0.25;

/// Stateful exponential backoff calculator.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    attempt: Mutex<u32>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: if multiplier.is_finite() && multiplier >= 1.0 { multiplier } else { 1.0 },
            attempt: Mutex::new(0),
        }
    }

    /// Advance the attempt counter and return the jittered delay for it.
    pub fn next(&self) -> Duration {
        let attempt = {
            let mut attempt = self.attempt.lock();
            *attempt = attempt.saturating_add(1);
            *attempt
        };

        let base = self.base_delay(attempt).as_secs_f64();
        let jitter = base * JITTER_FRACTION * rand::thread_rng().gen_range(-1.0..=1.0);
        let delay = (base + jitter).max(self.initial.as_secs_f64());

        Duration::from_secs_f64(delay)
    }

    /// Un-jittered delay for a 1-based attempt number.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.initial.as_secs_f64() * self.multiplier.powi(exponent);

        if !delay.is_finite() || delay >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(delay)
        }
    }

    pub fn reset(&self) {
        *self.attempt.lock() = 0;
    }

    pub fn attempt(&self) -> u32 {
        *self.attempt.lock()
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn standard() -> Backoff {
        Backoff::new(Duration::from_secs(1), Duration::from_secs(60), 2.0)
    }

    #[test]
    fn test_base_delays_double_then_cap() {
        let backoff = standard();
        let bases: Vec<u64> = (1..=10).map(|a| backoff.base_delay(a).as_secs()).collect();
        assert_eq!(bases, vec![1, 2, 4, 8, 16, 32, 60, 60, 60, 60]);
    }

    #[test]
    fn test_jittered_delay_stays_in_bounds() {
        let backoff = standard();
        for attempt in 1..=10 {
            let delay = backoff.next().as_secs_f64();
            let base = backoff.base_delay(attempt).as_secs_f64();
            assert!(delay >= base * 0.75 - 1e-9, "attempt {attempt}: {delay} < {base}*0.75");
            assert!(delay <= base * 1.25 + 1e-9, "attempt {attempt}: {delay} > {base}*1.25");
            assert!(delay >= 1.0);
        }
        assert_eq!(backoff.attempt(), 10);
    }

    #[test]
    fn test_reset_returns_to_first_attempt() {
        let backoff = standard();
        for _ in 0..5 {
            backoff.next();
        }
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);

        let delay = backoff.next();
        assert!(delay >= Duration::from_secs(1));
        assert!(delay <= Duration::from_millis(1250));
    }

    #[test]
    fn test_huge_attempt_does_not_overflow() {
        let backoff = standard();
        assert_eq!(backoff.base_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_shared_across_threads() {
        let backoff = std::sync::Arc::new(standard());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let b = backoff.clone();
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        b.next();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(backoff.attempt(), 100);
    }
}
