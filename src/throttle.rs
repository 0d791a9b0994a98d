//! Rate limiting of progress notifications
//!
//! A download emits one progress event per body read and a replay emits one
//! per chunk, far more than a UI wants to redraw. [`ProgressThrottle`] lets an
//! update through when any of these hold:
//!
//! - percent reached 100 (the final update always fires)
//! - it is the first update
//! - percent advanced by the origin's step (coarser for cache replay)
//! - the total is unknown and the byte count advanced by the configured step
//! - the minimum interval elapsed since the last surfaced update

use crate::config::ThrottleConfig;
use crate::models::{Origin, Progress};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Surfaced {
    percent: u8,
    loaded: u64,
    at: Instant,
}

/// Decides which progress updates reach the caller
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    config: ThrottleConfig,
    last: Option<Surfaced>,
}

impl ProgressThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        ProgressThrottle { config, last: None }
    }

    /// Decide whether `progress` should be surfaced at `now`
    ///
    /// Records the update as surfaced when it returns true.
    pub fn should_emit(&mut self, progress: &Progress, now: Instant) -> bool {
        let emit = match self.last {
            None => true,
            Some(last) => {
                progress.percent == 100
                    || progress.percent.saturating_sub(last.percent) >= self.percent_step(progress.origin)
                    || (progress.total.is_none()
                        && progress.loaded.saturating_sub(last.loaded)
                            >= self.config.unknown_total_step_bytes)
                    || now.saturating_duration_since(last.at)
                        >= Duration::from_millis(self.config.min_interval_ms)
            }
        };

        if emit {
            self.last = Some(Surfaced {
                percent: progress.percent,
                loaded: progress.loaded,
                at: now,
            });
        }
        emit
    }

    fn percent_step(&self, origin: Origin) -> u8 {
        match origin {
            Origin::Cache => self.config.cache_percent_step,
            Origin::Network => self.config.network_percent_step,
        }
    }
}

impl Default for ProgressThrottle {
    fn default() -> Self {
        Self::new(ThrottleConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn net(loaded: u64, total: u64) -> Progress {
        Progress::new(loaded, Some(total), Origin::Network)
    }

    #[test]
    fn test_first_update_always_fires() {
        let mut throttle = ProgressThrottle::default();
        assert!(throttle.should_emit(&net(0, 100), Instant::now()));
    }

    #[test]
    fn test_network_percent_step() {
        let mut throttle = ProgressThrottle::default();
        let t0 = Instant::now();
        assert!(throttle.should_emit(&net(0, 1000), t0));
        assert!(!throttle.should_emit(&net(10, 1000), t0)); // 1%
        assert!(throttle.should_emit(&net(20, 1000), t0)); // 2%
        assert!(!throttle.should_emit(&net(30, 1000), t0)); // 3%
    }

    #[test]
    fn test_cache_step_is_coarser() {
        let mut throttle = ProgressThrottle::default();
        let t0 = Instant::now();
        let cache = |loaded| Progress::new(loaded, Some(100), Origin::Cache);
        assert!(throttle.should_emit(&cache(1), t0));
        assert!(!throttle.should_emit(&cache(5), t0));
        assert!(!throttle.should_emit(&cache(10), t0));
        assert!(throttle.should_emit(&cache(11), t0));
    }

    #[test]
    fn test_completion_always_fires() {
        let mut throttle = ProgressThrottle::default();
        let t0 = Instant::now();
        assert!(throttle.should_emit(&net(99, 100), t0));
        assert!(throttle.should_emit(&net(100, 100), t0));
    }

    #[test]
    fn test_unknown_total_uses_byte_step() {
        let mut throttle = ProgressThrottle::default();
        let t0 = Instant::now();
        let unknown = |loaded| Progress::new(loaded, None, Origin::Network);
        assert!(throttle.should_emit(&unknown(MB), t0));
        assert!(!throttle.should_emit(&unknown(32 * MB), t0));
        assert!(throttle.should_emit(&unknown(65 * MB), t0));
        assert!(!throttle.should_emit(&unknown(100 * MB), t0));
    }

    #[test]
    fn test_time_backstop() {
        let mut throttle = ProgressThrottle::default();
        let t0 = Instant::now();
        assert!(throttle.should_emit(&net(0, 1000), t0));
        assert!(!throttle.should_emit(&net(1, 1000), t0 + Duration::from_millis(500)));
        assert!(throttle.should_emit(&net(2, 1000), t0 + Duration::from_millis(950)));
    }
}
