//! Retry policy: decides whether a failed job goes back to the queue or dies.

use std::time::Duration;

use fno_protocol::backoff::Backoff;
use fno_protocol::job::ErrorKind;

/// What to do with a job that just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Requeue after the given delay; the caller increments `retry_count`.
    Retry(Duration),
    /// No retries left (or the error is not retryable); dead-letter it.
    Dead,
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(backoff: Backoff) -> Self {
        Self { backoff }
    }

    /// Decide based on error kind and budget.
    ///
    /// `retry_count` is the number of retries already consumed. Kind-level
    /// caps (timeouts stop after two) tighten the job's own `max_retries`
    /// but never loosen it.
    pub fn decide(&self, kind: ErrorKind, retry_count: i32, max_retries: i32) -> RetryDecision {
        if !kind.is_retryable() {
            return RetryDecision::Dead;
        }

        let effective_max = match kind.retry_cap() {
            Some(cap) => max_retries.min(cap),
            None => max_retries,
        };

        if retry_count >= effective_max {
            return RetryDecision::Dead;
        }

        RetryDecision::Retry(self.backoff.delay((retry_count + 1) as u32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(Backoff::default().with_jitter(0.0))
    }

    #[test]
    fn retryable_error_with_budget_left_is_retried() {
        let decision = policy().decide(ErrorKind::NetworkError, 0, 3);
        assert_eq!(decision, RetryDecision::Retry(Duration::from_secs(30)));
    }

    #[test]
    fn delay_grows_with_the_retry_count() {
        assert_eq!(
            policy().decide(ErrorKind::NetworkError, 1, 3),
            RetryDecision::Retry(Duration::from_secs(60))
        );
        assert_eq!(
            policy().decide(ErrorKind::NetworkError, 2, 3),
            RetryDecision::Retry(Duration::from_secs(120))
        );
    }

    #[test]
    fn one_retry_left_is_still_a_retry() {
        // retry_count = max_retries - 1 allows exactly one more.
        assert!(matches!(
            policy().decide(ErrorKind::PortalError, 2, 3),
            RetryDecision::Retry(_)
        ));
    }

    #[test]
    fn exhausted_budget_goes_dead() {
        assert_eq!(policy().decide(ErrorKind::PortalError, 3, 3), RetryDecision::Dead);
    }

    #[test]
    fn non_retryable_kinds_die_immediately() {
        for kind in [
            ErrorKind::ValidationError,
            ErrorKind::AuthError,
            ErrorKind::NotFound,
            ErrorKind::CancelledByOperator,
        ] {
            assert_eq!(policy().decide(kind, 0, 3), RetryDecision::Dead);
        }
    }

    #[test]
    fn timeouts_are_capped_at_two_retries() {
        assert!(matches!(
            policy().decide(ErrorKind::TimeoutError, 1, 5),
            RetryDecision::Retry(_)
        ));
        assert_eq!(policy().decide(ErrorKind::TimeoutError, 2, 5), RetryDecision::Dead);
    }

    #[test]
    fn kind_cap_never_loosens_the_job_budget() {
        // max_retries = 1 stays the binding limit even for timeouts.
        assert_eq!(policy().decide(ErrorKind::TimeoutError, 1, 1), RetryDecision::Dead);
    }
}
