//! Instrument status model and polling parameters.
//!
//! The analyzer reports its state as an integer status word. A [`StatusRule`]
//! says which query to send and how to read the word; [`PollConfig`] bounds how
//! long and how often the protocol engine asks.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Observed instrument state.
///
/// Busy is an ordinary value here, not a failure. Only `Error` carries a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstrumentStatus {
    /// Ready for a new operation
    Idle,
    /// Working on an earlier operation
    Busy,
    /// Armed and waiting for the trigger to fire
    Triggered,
    /// Error bits set in the status word
    Error(i64),
}

impl InstrumentStatus {
    /// True only for [`InstrumentStatus::Idle`].
    pub fn is_idle(&self) -> bool {
        matches!(self, InstrumentStatus::Idle)
    }
}

impl fmt::Display for InstrumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstrumentStatus::Idle => f.write_str("idle"),
            InstrumentStatus::Busy => f.write_str("busy"),
            InstrumentStatus::Triggered => f.write_str("triggered"),
            InstrumentStatus::Error(code) => write!(f, "error({code})"),
        }
    }
}

/// How to query and interpret the status word.
///
/// Bits are tested in priority order: `error_mask`, then `idle_mask`, then
/// `triggered_mask`; anything else is Busy. An `idle_mask` of zero means the
/// instrument is idle when the whole word is zero.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusRule {
    /// Status query mnemonic
    pub command: String,
    /// Query arguments
    #[serde(deserialize_with = "crate::template::de_args")]
    pub args: Vec<String>,
    /// Bits meaning "done"
    pub idle_mask: i64,
    /// Bits meaning "armed, waiting for trigger"
    pub triggered_mask: i64,
    /// Bits meaning "fault"
    pub error_mask: i64,
}

impl Default for StatusRule {
    /// `DSPS? 1`: display 1 status bit, set once the measurement has finished
    /// and cleared by the read that reports it.
    fn default() -> Self {
        Self {
            command: "DSPS?".to_string(),
            args: vec!["1".to_string()],
            idle_mask: 1,
            triggered_mask: 0,
            error_mask: 0,
        }
    }
}

impl StatusRule {
    /// Rule for `command` with the given idle bits and no argument.
    pub fn new(command: impl Into<String>, idle_mask: i64) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            idle_mask,
            triggered_mask: 0,
            error_mask: 0,
        }
    }

    /// Classify a status word.
    pub fn classify(&self, word: i64) -> InstrumentStatus {
        if word & self.error_mask != 0 {
            return InstrumentStatus::Error(word);
        }
        let idle = if self.idle_mask == 0 {
            word == 0
        } else {
            word & self.idle_mask != 0
        };
        if idle {
            InstrumentStatus::Idle
        } else if word & self.triggered_mask != 0 {
            InstrumentStatus::Triggered
        } else {
            InstrumentStatus::Busy
        }
    }
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(600)
}

fn default_poll_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_backoff() -> f64 {
    1.0
}

fn default_max_interval() -> Duration {
    Duration::from_secs(5)
}

/// Bounds for `poll_until_idle`.
///
/// Passed explicitly on every call; nothing about polling is kept between calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollConfig {
    /// Give up after this long
    #[serde(with = "humantime_serde", default = "default_poll_timeout")]
    pub timeout: Duration,
    /// Delay before the second poll
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub interval: Duration,
    /// Interval multiplier after every poll (1.0 keeps it fixed)
    #[serde(default = "default_backoff")]
    pub backoff: f64,
    /// Ceiling for the grown interval
    #[serde(with = "humantime_serde", default = "default_max_interval")]
    pub max_interval: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            timeout: default_poll_timeout(),
            interval: default_poll_interval(),
            backoff: default_backoff(),
            max_interval: default_max_interval(),
        }
    }
}

impl PollConfig {
    /// Fixed-interval polling.
    pub fn fixed(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            backoff: 1.0,
            max_interval: interval,
        }
    }

    /// Interval to use after `current`.
    ///
    /// Growth stops at `max_interval`, including when the product no longer
    /// fits in a [`Duration`].
    pub fn next_interval(&self, current: Duration) -> Duration {
        if self.backoff.is_nan() || self.backoff <= 1.0 {
            return current;
        }
        let ceiling = self.max_interval.max(self.interval);
        Duration::try_from_secs_f64(current.as_secs_f64() * self.backoff)
            .map_or(ceiling, |next| next.min(ceiling))
    }

    /// Reject settings that would spin or never grow.
    pub fn validate(&self) -> Result<(), String> {
        if self.interval.is_zero() {
            return Err("poll interval must be positive".into());
        }
        if !self.backoff.is_finite() || self.backoff < 1.0 {
            return Err(format!("poll backoff must be >= 1.0, got {}", self.backoff));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_priority() {
        let rule = StatusRule {
            command: "STAT?".into(),
            args: vec![],
            idle_mask: 0b0001,
            triggered_mask: 0b0010,
            error_mask: 0b1000,
        };

        let cases = [
            (0b0000, InstrumentStatus::Busy),
            (0b0001, InstrumentStatus::Idle),
            (0b0010, InstrumentStatus::Triggered),
            (0b0011, InstrumentStatus::Idle),
            (0b1001, InstrumentStatus::Error(0b1001)),
        ];
        for (word, expected) in cases {
            assert_eq!(rule.classify(word), expected, "word {word:#b}");
        }
    }

    #[test]
    fn test_zero_idle_mask_means_zero_word() {
        let rule = StatusRule::new("*STB?", 0);
        assert_eq!(rule.classify(0), InstrumentStatus::Idle);
        assert_eq!(rule.classify(4), InstrumentStatus::Busy);
    }

    #[test]
    fn test_default_rule_reads_display_bit() {
        let rule = StatusRule::default();
        assert_eq!(rule.command, "DSPS?");
        assert_eq!(rule.classify(0), InstrumentStatus::Busy);
        assert_eq!(rule.classify(1), InstrumentStatus::Idle);
    }

    #[test]
    fn test_backoff_is_capped() {
        let poll = PollConfig {
            timeout: Duration::from_secs(10),
            interval: Duration::from_millis(100),
            backoff: 2.0,
            max_interval: Duration::from_millis(300),
        };
        let i1 = poll.next_interval(poll.interval);
        let i2 = poll.next_interval(i1);
        assert_eq!(i1, Duration::from_millis(200));
        assert_eq!(i2, Duration::from_millis(300));

        let fixed = PollConfig::fixed(Duration::from_secs(1), Duration::from_millis(50));
        assert_eq!(fixed.next_interval(fixed.interval), Duration::from_millis(50));
    }

    #[test]
    fn test_huge_backoff_saturates_at_ceiling() {
        let poll = PollConfig {
            timeout: Duration::from_secs(10),
            interval: Duration::from_millis(100),
            backoff: 1e300,
            max_interval: Duration::from_secs(2),
        };
        assert!(poll.validate().is_ok());
        assert_eq!(poll.next_interval(poll.interval), Duration::from_secs(2));

        let infinite = PollConfig {
            backoff: f64::INFINITY,
            ..poll.clone()
        };
        assert_eq!(infinite.next_interval(Duration::ZERO), Duration::from_secs(2));

        let nan = PollConfig {
            backoff: f64::NAN,
            ..poll
        };
        assert_eq!(nan.next_interval(Duration::from_millis(100)), Duration::from_millis(100));
        assert!(nan.validate().is_err());
    }

    #[test]
    fn test_poll_validation() {
        assert!(PollConfig::default().validate().is_ok());
        let bad = PollConfig::fixed(Duration::from_secs(1), Duration::ZERO);
        assert!(bad.validate().is_err());
    }
}
