//! Reconnection backoff for agent tunnels.
//!
//! The delay doubles every [`ReconnectBackoff::tries_per_step`] failed
//! attempts, starting at `min_delay_ms`, capped at `max_delay_ms`, with a
//! random jitter added on top so that agents cut off by the same router
//! restart do not reconnect in lockstep.

use rand::Rng;
use std::time::Duration;

/// Backoff schedule.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    /// Delay of the first attempts.
    pub min_delay_ms: u64,
    /// Upper bound of the delay, jitter included.
    pub max_delay_ms: u64,
    /// Number of attempts made at each delay before doubling it.
    pub tries_per_step: u32,
    /// Jitter factor (0.0 = no jitter, 1.0 = up to twice the delay).
    pub jitter: f64,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            min_delay_ms: 2_000,
            max_delay_ms: 60_000,
            tries_per_step: 3,
            jitter: 0.1,
        }
    }
}

impl ReconnectBackoff {
    /// Delay before attempt `attempt` (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms(attempt))
    }

    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let step = attempt / self.tries_per_step.max(1);
        let base = self
            .min_delay_ms
            .saturating_mul(1u64.checked_shl(step).unwrap_or(u64::MAX));
        let capped = base.min(self.max_delay_ms);

        if self.jitter <= 0.0 {
            return capped;
        }
        let frac: f64 = rand::thread_rng().gen();
        let with_jitter = (capped as f64) * (1.0 + frac * self.jitter);
        (with_jitter as u64).min(self.max_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> ReconnectBackoff {
        ReconnectBackoff {
            jitter: 0.0,
            ..ReconnectBackoff::default()
        }
    }

    #[test]
    fn test_doubles_every_third_attempt() {
        let b = no_jitter();
        assert_eq!(b.delay_ms(0), 2_000);
        assert_eq!(b.delay_ms(2), 2_000);
        assert_eq!(b.delay_ms(3), 4_000);
        assert_eq!(b.delay_ms(6), 8_000);
        assert_eq!(b.delay_ms(9), 16_000);
    }

    #[test]
    fn test_capped_at_max() {
        let b = no_jitter();
        assert_eq!(b.delay_ms(15), 60_000);
        assert_eq!(b.delay_ms(1_000), 60_000);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let b = ReconnectBackoff::default();
        for attempt in 0..30 {
            let d = b.delay_ms(attempt);
            let base = no_jitter().delay_ms(attempt);
            assert!(d >= base, "attempt {attempt}: {d} < {base}");
            assert!(d <= 60_000);
        }
    }
}
