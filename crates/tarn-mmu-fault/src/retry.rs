//! Bounded retry-with-backoff for hardware polls.

use crate::hal::{FaultHw, Timeout};

/// Geometric backoff: delay doubles per attempt up to `max_delay_us`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_us: u64,
    pub max_delay_us: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 200,
            initial_delay_us: 5,
            max_delay_us: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Polls `done` until it reports true or the attempt budget runs out.
    pub fn poll(
        &self,
        hw: &mut dyn FaultHw,
        mut done: impl FnMut(&mut dyn FaultHw) -> bool,
    ) -> Result<(), Timeout> {
        let mut delay = self.initial_delay_us;
        for _ in 0..self.max_attempts {
            if done(hw) {
                return Ok(());
            }
            hw.delay_us(delay);
            delay = (delay * 2).min(self.max_delay_us);
        }
        Err(Timeout)
    }
}
