//! Reconnection policy for event channel transports.
//!
//! Delays follow the Socket.IO client backoff: the base delay grows by
//! [`ReconnectConfig::multiplier`] per attempt, is clamped to
//! [`ReconnectConfig::max_delay`], and is spread by a random deviation
//! of up to [`ReconnectConfig::randomization`] of the base.

use std::time::Duration;

use rand::Rng;

/// Tunable parameters for the reconnect strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Attempts after a drop before the transport gives up.
    pub max_attempts: u32,
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
    /// Jitter factor in `0.0..=1.0`.
    pub randomization: f64,
    /// Budget for the transport and namespace handshake.
    pub handshake_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            randomization: 0.5,
            handshake_timeout: Duration::from_secs(20),
        }
    }
}

/// Delay before reconnect `attempt` (1-based) for a given random draw
/// in `0.0..1.0`. The result is clamped to [`ReconnectConfig::max_delay`].
pub fn backoff_delay(attempt: u32, config: &ReconnectConfig, draw: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32) as i32;
    let mut ms = config.initial_delay.as_millis() as f64 * config.multiplier.powi(exponent);

    if config.randomization > 0.0 {
        let deviation = (draw * config.randomization * ms).floor();
        ms = if ((draw * 10.0).floor() as u64) & 1 == 0 {
            ms - deviation
        } else {
            ms + deviation
        };
    }

    Duration::from_millis(ms.max(0.0) as u64).min(config.max_delay)
}

/// [`backoff_delay`] with a thread-local random draw.
pub fn jittered_delay(attempt: u32, config: &ReconnectConfig) -> Duration {
    backoff_delay(attempt, config, rand::rng().random::<f64>())
}
