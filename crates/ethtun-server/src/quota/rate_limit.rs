//! Rolling-window frame-rate limiter.
//!
//! Remembers the arrival instant of every frame seen in the last second and
//! refuses a frame once that many arrivals would exceed the capacity.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct FrameRateLimiter {
    /// Frames allowed within any one-second window; 0 disables the check.
    max_per_second: u64,
    /// Arrival instants still inside the window, oldest first.
    arrivals: VecDeque<Instant>,
}

impl FrameRateLimiter {
    pub fn new(max_per_second: u64) -> Self {
        Self {
            max_per_second,
            arrivals: VecDeque::new(),
        }
    }

    /// Record a frame arriving at `now`. Returns `false` if it exceeds the rate.
    pub fn check_and_record_at(&mut self, now: Instant) -> bool {
        if self.max_per_second == 0 {
            return true;
        }

        // Expire arrivals that left the window.
        while let Some(&oldest) = self.arrivals.front() {
            if now.saturating_duration_since(oldest) >= WINDOW {
                self.arrivals.pop_front();
            } else {
                break;
            }
        }

        if self.arrivals.len() as u64 >= self.max_per_second {
            return false;
        }

        self.arrivals.push_back(now);
        true
    }

    /// Arrivals currently counted against the window.
    pub fn in_window(&self) -> usize {
        self.arrivals.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_capacity() {
        let mut limiter = FrameRateLimiter::new(3);
        let t0 = Instant::now();
        assert!(limiter.check_and_record_at(t0));
        assert!(limiter.check_and_record_at(t0));
        assert!(limiter.check_and_record_at(t0));
        assert!(!limiter.check_and_record_at(t0));
    }

    #[test]
    fn window_rolls_rather_than_resets() {
        let mut limiter = FrameRateLimiter::new(2);
        let t0 = Instant::now();
        assert!(limiter.check_and_record_at(t0));
        assert!(limiter.check_and_record_at(t0 + Duration::from_millis(600)));
        assert!(!limiter.check_and_record_at(t0 + Duration::from_millis(900)));
        assert!(limiter.check_and_record_at(t0 + Duration::from_millis(1000)));
        // A fixed bucket would have reset at 1000ms; the rolling window still
        // holds the 600ms arrival.
        assert!(!limiter.check_and_record_at(t0 + Duration::from_millis(1100)));
        assert!(limiter.check_and_record_at(t0 + Duration::from_millis(1600)));
    }

    #[test]
    fn steady_rate_never_trips() {
        let mut limiter = FrameRateLimiter::new(10);
        let t0 = Instant::now();
        for i in 0..100u64 {
            assert!(limiter.check_and_record_at(t0 + Duration::from_millis(i * 100)));
        }
        assert!(limiter.in_window() <= 10);
    }

    #[test]
    fn zero_is_unbounded() {
        let mut limiter = FrameRateLimiter::new(0);
        let t0 = Instant::now();
        for _ in 0..10_000 {
            assert!(limiter.check_and_record_at(t0));
        }
        assert_eq!(limiter.in_window(), 0);
    }
}
