use std::time::Duration;

/// Redelivery delay attached to a negative acknowledgment.
///
/// The delay doubles with every delivery attempt, starting at `base` and
/// capped at `max`. A zero `base` asks the broker for immediate redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NakBackoff {
    base: Duration,
    max: Duration,
}

impl Default for NakBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

impl NakBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    /// Immediate redelivery on every nak
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Delay for the given delivery attempt (1-based, unknown counts as the first)
    pub fn delay_for(&self, delivery_attempt: Option<u64>) -> Option<Duration> {
        if self.base.is_zero() {
            return None;
        }

        let attempt = delivery_attempt.unwrap_or(1).max(1);
        let exponent = (attempt - 1).min(20) as u32;
        let delay = self.base.saturating_mul(1u32 << exponent);

        Some(delay.min(self.max))
    }
}
