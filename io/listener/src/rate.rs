//! Accept-rate limiting with adaptive recovery.

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::time::Instant;

/// Multiplicative decrease applied when a consumer queue is saturated.
pub const ACCEPT_RATE_DECREASE_STEP: f64 = 0.1;

/// Probabilistic accept-rate controller.
///
/// While `rate < 1`, each accepted connection survives with probability
/// `rate`. The rate recovers multiplicatively with the idle time between
/// accepts (`rate *= 1 + adjust_speed * elapsed_ms`) and is cut by
/// [`ACCEPT_RATE_DECREASE_STEP`] whenever dispatch finds a full queue.
pub(crate) struct AcceptRateLimiter {
    rate: f64,
    adjust_speed: f64,
    last_accept: Instant,
    rng: Xoshiro256PlusPlus,
}

pub(crate) enum RateDecision {
    Keep,
    Drop,
}

impl AcceptRateLimiter {
    pub(crate) fn new() -> Self {
        Self::with_seed(rand::rng().random())
    }

    pub(crate) fn with_seed(seed: u64) -> Self {
        Self {
            rate: 1.0,
            adjust_speed: 0.0,
            last_accept: Instant::now(),
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }

    pub(crate) fn rate(&self) -> f64 {
        self.rate
    }

    pub(crate) fn set_rate(&mut self, rate: f64) {
        self.rate = rate.clamp(f64::MIN_POSITIVE, 1.0);
    }

    /// Recovery factor per millisecond between accepts. Zero disables both
    /// recovery and the saturation decrease.
    pub(crate) fn set_adjust_speed(&mut self, speed: f64) {
        self.adjust_speed = speed.max(0.0);
    }

    /// Account for one accepted connection and decide its fate.
    pub(crate) fn on_accept(&mut self, now: Instant) -> RateDecision {
        let elapsed_ms = now
            .saturating_duration_since(self.last_accept)
            .as_secs_f64()
            * 1_000.0;
        self.last_accept = now;

        if self.rate < 1.0 {
            self.rate *= 1.0 + self.adjust_speed * elapsed_ms;
            if self.rate >= 1.0 {
                self.rate = 1.0;
            } else if self.rng.random::<f64>() > self.rate {
                return RateDecision::Drop;
            }
        }
        RateDecision::Keep
    }

    /// Aggressively reduce the accept rate; called when every consumer
    /// queue put in a dispatch rotation failed.
    pub(crate) fn on_queue_saturated(&mut self) {
        if self.adjust_speed > 0.0 {
            self.rate *= 1.0 - ACCEPT_RATE_DECREASE_STEP;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn rate_recovers_to_one() {
        let mut limiter = AcceptRateLimiter::with_seed(7);
        limiter.set_rate(0.25);
        limiter.set_adjust_speed(0.1);

        let mut now = Instant::now();
        for _ in 0..200 {
            now += Duration::from_millis(50);
            limiter.on_accept(now);
            if limiter.rate() >= 1.0 {
                break;
            }
        }
        assert_eq!(limiter.rate(), 1.0);
    }

    #[test]
    fn full_rate_never_drops() {
        let mut limiter = AcceptRateLimiter::with_seed(7);
        let now = Instant::now();
        for _ in 0..1000 {
            assert!(matches!(limiter.on_accept(now), RateDecision::Keep));
        }
    }

    #[test]
    fn tiny_rate_drops_most_connections() {
        let mut limiter = AcceptRateLimiter::with_seed(7);
        limiter.set_rate(0.01);
        // adjust_speed stays 0 so the rate cannot recover during the run
        let now = Instant::now();
        let dropped = (0..1000)
            .filter(|_| matches!(limiter.on_accept(now), RateDecision::Drop))
            .count();
        assert!(dropped > 900, "dropped only {dropped} of 1000");
    }

    #[test]
    fn saturation_cuts_rate_only_with_adjust_speed() {
        let mut limiter = AcceptRateLimiter::with_seed(7);
        limiter.on_queue_saturated();
        assert_eq!(limiter.rate(), 1.0);

        limiter.set_adjust_speed(0.5);
        limiter.on_queue_saturated();
        assert!((limiter.rate() - 0.9).abs() < 1e-9);
    }
}
