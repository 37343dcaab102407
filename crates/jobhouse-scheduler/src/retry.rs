use std::time::Duration;

use chrono::{DateTime, Utc};
use jobhouse_core::config::RetrySection;

/// Exponential backoff bounded by a retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// What to do with a job whose execution just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reschedule with the incremented `retry_count` at `at`.
    Retry { retry_count: u32, at: DateTime<Utc> },
    /// Budget spent; the job fails terminally.
    Exhausted,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySection::default())
    }
}

impl From<&RetrySection> for RetryPolicy {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_retries: section.max_retries,
            base_delay: Duration::from_secs(section.base_delay_secs),
            max_delay: Duration::from_secs(section.max_delay_secs),
        }
    }
}

impl RetryPolicy {
    /// `base * 2^retry_count`, capped at `max_delay`. Saturates instead of overflowing.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Decide the fate of a failed execution given the retries already consumed.
    pub fn decide(&self, retry_count: u32, now: DateTime<Utc>) -> RetryDecision {
        if retry_count >= self.max_retries {
            return RetryDecision::Exhausted;
        }
        let delay = chrono::Duration::from_std(self.backoff(retry_count))
            .unwrap_or_else(|_| chrono::Duration::seconds(self.max_delay.as_secs() as i64));
        RetryDecision::Retry {
            retry_count: retry_count + 1,
            at: now + delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(60),
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let p = policy(10);
        assert_eq!(p.backoff(0), Duration::from_secs(10));
        assert_eq!(p.backoff(1), Duration::from_secs(20));
        assert_eq!(p.backoff(2), Duration::from_secs(40));
        assert_eq!(p.backoff(3), Duration::from_secs(60));
        assert_eq!(p.backoff(40), Duration::from_secs(60));
        assert_eq!(p.backoff(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn retries_until_budget_is_spent() {
        let p = policy(2);
        let now = Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap();

        assert_eq!(
            p.decide(0, now),
            RetryDecision::Retry {
                retry_count: 1,
                at: now + chrono::Duration::seconds(10)
            }
        );
        assert_eq!(
            p.decide(1, now),
            RetryDecision::Retry {
                retry_count: 2,
                at: now + chrono::Duration::seconds(20)
            }
        );
        assert_eq!(p.decide(2, now), RetryDecision::Exhausted);
    }

    #[test]
    fn zero_budget_fails_immediately() {
        let now = Utc::now();
        assert_eq!(policy(0).decide(0, now), RetryDecision::Exhausted);
    }

    #[test]
    fn built_from_config_section() {
        let p = RetryPolicy::from(&RetrySection {
            max_retries: 5,
            base_delay_secs: 2,
            max_delay_secs: 30,
        });
        assert_eq!(p.max_retries, 5);
        assert_eq!(p.backoff(4), Duration::from_secs(30));
    }
}
