use std::time::Duration;

/// Thresholds and steps of the additive-increase/additive-decrease delay
/// controller.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Timeout ratio above which the delay grows.
    pub raise_above: f64,
    /// Timeout ratio below which the delay shrinks.
    pub lower_below: f64,
    pub step_up: Duration,
    pub step_down: Duration,
    pub ceiling: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            raise_above: 0.20,
            lower_below: 0.05,
            step_up: Duration::from_millis(300),
            step_down: Duration::from_millis(200),
            ceiling: Duration::from_secs(2),
        }
    }
}

impl BackoffConfig {
    pub fn with_ceiling(mut self, ceiling: Duration) -> Self {
        self.ceiling = ceiling;
        self
    }
}

/// Direction of the last adjustment, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Raised,
    Lowered,
    Unchanged,
}

/// Run-wide dynamic delay driven by per-batch timeout ratios.
#[derive(Debug, Clone, Default)]
pub struct AdaptiveBackoff {
    config: BackoffConfig,
    delay: Duration,
}

impl AdaptiveBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            delay: Duration::ZERO,
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Feed one finished batch. Returns how the delay moved.
    pub fn observe(&mut self, timeout_ratio: f64) -> Adjustment {
        if timeout_ratio > self.config.raise_above {
            let next = (self.delay + self.config.step_up).min(self.config.ceiling);
            if next == self.delay {
                return Adjustment::Unchanged;
            }
            self.delay = next;
            Adjustment::Raised
        } else if timeout_ratio < self.config.lower_below && !self.delay.is_zero() {
            self.delay = self.delay.saturating_sub(self.config.step_down);
            Adjustment::Lowered
        } else {
            Adjustment::Unchanged
        }
    }
}

/// `timeouts / claimed`, zero for an empty batch.
pub fn timeout_ratio(timeouts: usize, claimed: usize) -> f64 {
    if claimed == 0 {
        0.0
    } else {
        timeouts as f64 / claimed as f64
    }
}
