//! Non-blocking token bucket.

use std::sync::Mutex;
use std::time::Instant;

struct BucketState {
    tokens: f64,
    last: Instant,
}

/// Token bucket with a refill rate and a burst ceiling.
///
/// `allow` is an instantaneous token check, never a wait-for-token primitive.
pub struct TokenBucket {
    /// Tokens per second; `None` disables limiting entirely.
    rate: Option<f64>,
    burst: u32,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(rate_per_second: Option<f64>, burst: u32) -> Self {
        Self {
            rate: rate_per_second.filter(|r| *r > 0.0),
            burst,
            state: Mutex::new(BucketState {
                tokens: burst as f64,
                last: Instant::now(),
            }),
        }
    }

    /// Build a bucket from the configured calls-per-minute value.
    ///
    /// An unparseable or zero rate means no rate limiting; a zero burst size
    /// means the maximum possible burst.
    pub fn from_config(rate_per_minute: &str, burst_size: u32) -> Self {
        let rate = match rate_per_minute.parse::<f64>() {
            Ok(per_minute) if per_minute > 0.0 => Some(per_minute / 60.0),
            _ => None,
        };
        let burst = if burst_size == 0 { u32::MAX } else { burst_size };
        Self::new(rate, burst)
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    pub fn allow(&self) -> bool {
        self.allow_at(Instant::now())
    }

    fn allow_at(&self, now: Instant) -> bool {
        let Some(rate) = self.rate else {
            return true;
        };

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = now.saturating_duration_since(state.last).as_secs_f64();
        state.tokens = (state.tokens + elapsed * rate).min(self.burst as f64);
        state.last = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
