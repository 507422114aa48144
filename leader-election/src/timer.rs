use std::time::Duration;

use rand::Rng;

/// Randomized election timeout measured in accumulated tick time.
///
/// The timer does not read the clock. It only moves when [`advance`] is
/// called, which keeps the node state machine deterministic under test.
///
/// [`advance`]: ElectionTimer::advance
#[derive(Debug, Clone)]
pub struct ElectionTimer {
    elapsed: Duration,
    timeout: Duration,
    min: Duration,
    max: Duration,
}

impl ElectionTimer {
    pub fn new<R: Rng + ?Sized>(min: Duration, max: Duration, rng: &mut R) -> Self {
        Self {
            elapsed: Duration::ZERO,
            timeout: draw(min, max, rng),
            min,
            max,
        }
    }

    /// Adds `by` to the elapsed time and reports whether the timeout has
    /// been exceeded.
    pub fn advance(&mut self, by: Duration) -> bool {
        self.elapsed = self.elapsed.saturating_add(by);
        self.elapsed > self.timeout
    }

    /// Restarts from zero with a freshly drawn timeout.
    pub fn reset<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.elapsed = Duration::ZERO;
        self.timeout = draw(self.min, self.max, rng);
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn draw<R: Rng + ?Sized>(min: Duration, max: Duration, rng: &mut R) -> Duration {
    rng.gen_range(min..=max)
}
