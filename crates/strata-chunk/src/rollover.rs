//! When to stop writing to the active chunk.

use strata_common::{Error, Result};
use tracing::debug;

/// Size-or-count rollover: roll once either threshold is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloverPolicy {
    max_bytes: u64,
    max_messages: u64,
}

impl RolloverPolicy {
    pub fn new(max_bytes: u64, max_messages: u64) -> Result<Self> {
        if max_bytes == 0 {
            return Err(Error::invalid_config(
                "max bytes per chunk must be positive",
            ));
        }
        if max_messages == 0 {
            return Err(Error::invalid_config(
                "max messages per chunk must be positive",
            ));
        }
        Ok(Self {
            max_bytes,
            max_messages,
        })
    }

    #[must_use]
    pub fn should_roll_over(&self, bytes_indexed: u64, messages_indexed: u64) -> bool {
        let roll =
            bytes_indexed >= self.max_bytes || messages_indexed >= self.max_messages;
        if roll {
            debug!(
                "Rollover due: {} bytes (max {}), {} messages (max {})",
                bytes_indexed, self.max_bytes, messages_indexed, self.max_messages
            );
        }
        roll
    }

    #[must_use]
    pub const fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    #[must_use]
    pub const fn max_messages(&self) -> u64 {
        self.max_messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_zero_thresholds() {
        assert!(matches!(
            RolloverPolicy::new(0, 10),
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(matches!(
            RolloverPolicy::new(10, 0),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_either_threshold_triggers() {
        let policy = RolloverPolicy::new(1000, 10).unwrap();
        assert!(!policy.should_roll_over(999, 9));
        assert!(policy.should_roll_over(1000, 0));
        assert!(policy.should_roll_over(0, 10));
    }

    #[test]
    fn test_decision_is_monotonic() {
        let policy = RolloverPolicy::new(500, 7).unwrap();
        for bytes in (0..1000).step_by(50) {
            for messages in 0..12 {
                if policy.should_roll_over(bytes, messages) {
                    assert!(policy.should_roll_over(bytes + 50, messages));
                    assert!(policy.should_roll_over(bytes, messages + 1));
                }
            }
        }
    }
}
