//! Per-stage retry budgets with exponential backoff.

use std::time::Duration;

use neurochron_config::{RetryConfig, StageRetryConfig};
use neurochron_core::{FailureCause, Stage, StageFailure};

/// What to do after a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run the stage again after `delay`.
    Retry { delay: Duration },
    /// Escalate to FAILED.
    Fail,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    retry: RetryConfig,
    timeout_retries: u32,
}

impl RetryPolicy {
    pub fn new(retry: RetryConfig, timeout_retries: u32) -> Self {
        Self {
            retry,
            timeout_retries,
        }
    }

    pub fn stage(&self, stage: Stage) -> &StageRetryConfig {
        match stage {
            Stage::Convert => &self.retry.convert,
            Stage::Preprocess => &self.retry.preprocess,
            Stage::Predict => &self.retry.predict,
            Stage::Notify => &self.retry.notify,
        }
    }

    /// Decide after a failure. `retries_used` counts every retry spent in
    /// the stage and `timeouts_used` the share of those spent on timeouts.
    /// Timeouts draw from their own allowance on top of the stage budget.
    pub fn decide(
        &self,
        stage: Stage,
        failure: &StageFailure,
        retries_used: u32,
        timeouts_used: u32,
    ) -> Decision {
        if !failure.retryable || retries_used >= self.stage(stage).max_retries {
            return Decision::Fail;
        }
        if failure.cause == FailureCause::Timeout && timeouts_used >= self.timeout_retries {
            return Decision::Fail;
        }
        Decision::Retry {
            delay: delay_for_attempt(self.stage(stage), retries_used + 1),
        }
    }
}

/// delay = base_delay * 2^(attempt - 1), capped at max_delay.
pub fn delay_for_attempt(config: &StageRetryConfig, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    config
        .base_delay
        .checked_mul(factor)
        .unwrap_or(config.max_delay)
        .min(config.max_delay)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(RetryConfig::default(), 1)
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let config = StageRetryConfig::new(5, Duration::from_secs(1), Duration::from_secs(5));
        assert_eq!(delay_for_attempt(&config, 1), Duration::from_secs(1));
        assert_eq!(delay_for_attempt(&config, 2), Duration::from_secs(2));
        assert_eq!(delay_for_attempt(&config, 3), Duration::from_secs(4));
        assert_eq!(delay_for_attempt(&config, 4), Duration::from_secs(5));
        assert_eq!(delay_for_attempt(&config, 40), Duration::from_secs(5));
    }

    #[test]
    fn fatal_failures_never_retry() {
        let failure = StageFailure::fatal(FailureCause::InvalidFormat, "not DICOM");
        assert_eq!(policy().decide(Stage::Convert, &failure, 0, 0), Decision::Fail);
    }

    #[test]
    fn retryable_failures_use_stage_budget() {
        let failure = StageFailure::retryable(FailureCause::IoFailure, "disk busy");
        let policy = policy();
        for used in 0..3 {
            assert!(matches!(
                policy.decide(Stage::Convert, &failure, used, 0),
                Decision::Retry { .. }
            ));
        }
        assert_eq!(policy.decide(Stage::Convert, &failure, 3, 0), Decision::Fail);
    }

    #[test]
    fn timeout_is_capped_separately() {
        let mut retry = RetryConfig::default();
        retry.preprocess.max_retries = 4;
        let policy = RetryPolicy::new(retry, 1);
        let timeout = StageFailure::retryable(FailureCause::Timeout, "12h elapsed");
        let tool = StageFailure::retryable(FailureCause::ExternalToolError, "exit 1");

        assert!(matches!(
            policy.decide(Stage::Preprocess, &timeout, 0, 0),
            Decision::Retry { .. }
        ));
        assert_eq!(policy.decide(Stage::Preprocess, &timeout, 1, 1), Decision::Fail);
        assert!(matches!(
            policy.decide(Stage::Preprocess, &tool, 3, 1),
            Decision::Retry { .. }
        ));
        assert_eq!(policy.decide(Stage::Preprocess, &tool, 4, 1), Decision::Fail);
    }

    #[test]
    fn earlier_tool_failures_do_not_spend_the_timeout_allowance() {
        let mut retry = RetryConfig::default();
        retry.preprocess.max_retries = 3;
        let policy = RetryPolicy::new(retry, 1);
        let timeout = StageFailure::retryable(FailureCause::Timeout, "12h elapsed");

        assert!(matches!(
            policy.decide(Stage::Preprocess, &timeout, 1, 0),
            Decision::Retry { .. }
        ));
        assert!(matches!(
            policy.decide(Stage::Preprocess, &timeout, 2, 0),
            Decision::Retry { .. }
        ));
        assert_eq!(policy.decide(Stage::Preprocess, &timeout, 3, 0), Decision::Fail);
    }
}
