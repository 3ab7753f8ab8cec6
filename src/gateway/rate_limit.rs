//! Per-connection token bucket

use std::time::Instant;

pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    capacity: f64,
    refill_rate: f64, // tokens per second
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_second: u32) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill: Instant::now(),
            capacity: capacity as f64,
            refill_rate: refill_per_second as f64,
        }
    }

    pub fn try_consume(&mut self, tokens: f64) -> bool {
        self.refill();

        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();

        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    pub fn tokens_available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_reject() {
        let mut bucket = TokenBucket::new(3, 0);
        assert!(bucket.try_consume(1.0));
        assert!(bucket.try_consume(1.0));
        assert!(bucket.try_consume(1.0));
        assert!(!bucket.try_consume(1.0));
        assert!(bucket.tokens_available() < 1.0);
    }

    #[test]
    fn test_refill_is_capped() {
        let mut bucket = TokenBucket::new(2, 1_000);
        assert!(bucket.try_consume(2.0));
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(bucket.tokens_available() <= 2.0);
        assert!(bucket.try_consume(1.0));
    }
}
