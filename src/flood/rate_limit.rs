//! Token bucket bounding how many flood messages an area sends per second
use chrono::Utc;

use crate::settings::FloodRate;

#[derive(Clone, Debug)]
pub struct FloodRateLimiter {
    tokens: f64,
    last_refill: i64,
    flood_msg_per_sec: f64,
    flood_msg_burst_size: f64,
}

impl FloodRateLimiter {
    pub fn new(rate: &FloodRate) -> Self {
        Self {
            tokens: f64::from(rate.flood_msg_burst_size),
            last_refill: Utc::now().timestamp_millis(),
            flood_msg_per_sec: f64::from(rate.flood_msg_per_sec),
            flood_msg_burst_size: f64::from(rate.flood_msg_burst_size),
        }
    }

    /// Tokens are added at `flood_msg_per_sec` for the time since the last
    /// refill, never beyond the burst size.
    fn refill(&mut self) {
        let now = Utc::now().timestamp_millis();
        let diff_ms = now - self.last_refill;
        // Intervals under a millisecond are not worth the float math
        if diff_ms < 1 {
            return;
        }
        let tokens_to_add = self.flood_msg_per_sec / 1000.0 * diff_ms as f64;
        self.tokens = (self.tokens + tokens_to_add).clamp(0.0, self.flood_msg_burst_size);
        self.last_refill = now;
    }

    /// Take a token if one is available
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn available(&mut self) -> u32 {
        self.refill();
        self.tokens.trunc().clamp(0.0, u32::MAX.into()) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_limited() {
        let mut limiter = FloodRateLimiter::new(&FloodRate {
            flood_msg_per_sec: 1,
            flood_msg_burst_size: 3,
        });
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_refill_over_time() {
        let mut limiter = FloodRateLimiter::new(&FloodRate {
            flood_msg_per_sec: 1000,
            flood_msg_burst_size: 2,
        });
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(limiter.available() >= 1);
        assert!(limiter.available() <= 2);
    }
}
