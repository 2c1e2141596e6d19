use std::time::{Duration, Instant};

/// Token bucket pacing outgoing bytes.
///
/// Tokens refill continuously at the configured rate up to one second
/// of burst. A send may drive the balance negative; the returned delay
/// is how long the caller must wait before putting those bytes on the
/// wire, which keeps the long-run rate at the configured budget even
/// for chunks larger than the bucket.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Construct a bucket with the given bytes/sec budget.
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec as f64;
        Self {
            rate,
            capacity: rate,
            tokens: rate,
            last_refill: Instant::now(),
        }
    }

    /// Withdraw `bytes` tokens. Returns the delay the caller must sleep
    /// before sending, or `None` when the send may go out immediately.
    pub fn pace(&mut self, bytes: usize) -> Option<Duration> {
        self.refill(Instant::now());
        self.tokens -= bytes as f64;
        if self.tokens >= 0.0 {
            None
        } else {
            Some(Duration::from_secs_f64(-self.tokens / self.rate))
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }
}
