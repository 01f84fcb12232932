//! Reconnect backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration. The defaults reconnect quickly after
/// a blip while spreading a fleet of agents out after a hub restart.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First retry interval before jitter.
    pub initial: Duration,
    /// Growth factor applied after every attempt.
    pub multiplier: f64,
    /// Jitter as a fraction of the interval. 0.5 turns a 1 s interval into
    /// a uniform pick from 0.5 s..=1.5 s.
    pub randomization: f64,
    /// Interval ceiling.
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            multiplier: 1.5,
            randomization: 0.5,
            max: Duration::from_secs(60),
        }
    }
}

/// Jittered exponential backoff.
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial,
            config,
        }
    }

    /// The next wait interval. Advances the underlying interval.
    pub fn next(&mut self) -> Duration {
        let base = self.current.as_secs_f64();
        let delta = base * self.config.randomization;
        let jittered = if delta > 0.0 {
            rand::thread_rng().gen_range((base - delta)..=(base + delta))
        } else {
            base
        };

        let next = Duration::from_secs_f64(base * self.config.multiplier);
        self.current = next.min(self.config.max);

        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Back to the initial interval. Called after a healthy session.
    pub fn reset(&mut self) {
        self.current = self.config.initial;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}
