//! Per-chunk job status polling.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::gemini::{BatchJobService, JobHandle, JobStatus};
use crate::logging::PipelineLogger;

/// How often to poll and what to do when polling itself fails.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    /// Give up (chunk fails) after this many consecutive query errors.
    /// `None` retries forever.
    pub max_consecutive_failures: Option<u32>,
    /// Multiply the interval by this factor per consecutive error.
    /// `None` keeps the interval fixed.
    pub backoff_multiplier: Option<f64>,
    /// Upper bound for the backed-off interval.
    pub max_interval: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(30))
    }
}

impl PollPolicy {
    pub fn fixed(interval: Duration) -> Self {
        Self {
            interval,
            max_consecutive_failures: None,
            backoff_multiplier: None,
            max_interval: None,
        }
    }

    /// Delay before the next query given the current error streak.
    pub fn delay(&self, consecutive_failures: u32) -> Duration {
        let multiplier = match self.backoff_multiplier {
            Some(m) if m > 1.0 && consecutive_failures > 0 => {
                m.powi(consecutive_failures.min(32) as i32)
            }
            _ => return self.interval,
        };
        let ceiling = self.max_interval.unwrap_or(Duration::MAX);
        Duration::try_from_secs_f64(self.interval.as_secs_f64() * multiplier)
            .map_or(ceiling, |delay| delay.min(ceiling))
    }
}

/// How a poll loop ended.
#[derive(Debug, Clone)]
pub enum PollOutcome {
    Succeeded(JobStatus),
    Failed {
        reason: String,
        job: Option<JobStatus>,
    },
    Cancelled,
}

/// Poll `job` until it reaches a terminal state or `cancel` fires.
///
/// Non-terminal observations are passed to `on_status`. Query errors leave
/// the chunk untouched and are retried on the next tick.
pub async fn poll_until_terminal<F>(
    service: &dyn BatchJobService,
    job: &JobHandle,
    policy: &PollPolicy,
    cancel: &CancellationToken,
    logger: &PipelineLogger,
    chunk_index: usize,
    mut on_status: F,
) -> PollOutcome
where
    F: FnMut(JobStatus),
{
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            _ = tokio::time::sleep(policy.delay(failures)) => {}
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PollOutcome::Cancelled,
            r = service.get_status(job) => r,
        };

        match result {
            Ok(status) if status.state.is_success() => {
                logger
                    .chunk(chunk_index)
                    .job(job.as_str())
                    .info("POLL", "Batch succeeded");
                return PollOutcome::Succeeded(status);
            }
            Ok(status) if status.state.is_failure() => {
                let reason = status.failure_reason();
                logger
                    .chunk(chunk_index)
                    .job(job.as_str())
                    .error("POLL", reason.clone());
                return PollOutcome::Failed {
                    reason,
                    job: Some(status),
                };
            }
            Ok(status) => {
                failures = 0;
                logger.chunk(chunk_index).job(job.as_str()).debug(
                    "POLL",
                    format!(
                        "{} ({}/{} done)",
                        status.state, status.completed_count, status.request_count
                    ),
                );
                on_status(status);
            }
            Err(e) => {
                failures += 1;
                let scoped = logger.chunk(chunk_index).job(job.as_str());
                let message = format!("Status check failed (attempt {}): {}", failures, e);
                if e.is_transient() {
                    scoped.warn("POLL", message);
                } else {
                    scoped.error("POLL", message);
                }

                if let Some(max) = policy.max_consecutive_failures {
                    if failures >= max {
                        return PollOutcome::Failed {
                            reason: format!(
                                "Status polling failed {} times in a row: {}",
                                failures, e
                            ),
                            job: None,
                        };
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gemini::{GeminiError, JobState};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Returns scripted responses in order, repeating the last one.
    struct Scripted {
        responses: Mutex<Vec<Result<JobState, u16>>>,
    }

    impl Scripted {
        fn new(mut responses: Vec<Result<JobState, u16>>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl BatchJobService for Scripted {
        async fn submit(&self, _: &str, _: &str) -> Result<JobStatus, GeminiError> {
            unreachable!()
        }

        async fn get_status(&self, job: &JobHandle) -> Result<JobStatus, GeminiError> {
            let mut responses = self.responses.lock().unwrap();
            let next = if responses.len() > 1 {
                responses.pop().unwrap()
            } else {
                responses[0].clone()
            };
            match next {
                Ok(state) => Ok(JobStatus::new(job.as_str(), state)),
                Err(status) => Err(GeminiError::Api {
                    status,
                    body: "unavailable".to_string(),
                }),
            }
        }

        async fn download(&self, _: &str) -> Result<String, GeminiError> {
            unreachable!()
        }

        async fn cancel(&self, _: &JobHandle) -> Result<(), GeminiError> {
            Ok(())
        }

        async fn delete(&self, _: &JobHandle) -> Result<(), GeminiError> {
            Ok(())
        }
    }

    fn fast() -> PollPolicy {
        PollPolicy::fixed(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let service = Scripted::new(vec![
            Err(503),
            Ok(JobState::Running),
            Err(503),
            Ok(JobState::Succeeded),
        ]);
        let mut seen = Vec::new();

        let outcome = poll_until_terminal(
            &service,
            &JobHandle::new("batches/a"),
            &fast(),
            &CancellationToken::new(),
            &PipelineLogger::disabled(),
            0,
            |s| seen.push(s.state),
        )
        .await;

        assert!(matches!(outcome, PollOutcome::Succeeded(_)));
        assert_eq!(seen, vec![JobState::Running]);
    }

    #[tokio::test]
    async fn test_failure_state_carries_reason() {
        let service = Scripted::new(vec![Ok(JobState::Expired)]);
        let outcome = poll_until_terminal(
            &service,
            &JobHandle::new("batches/a"),
            &fast(),
            &CancellationToken::new(),
            &PipelineLogger::disabled(),
            0,
            |_| {},
        )
        .await;

        match outcome {
            PollOutcome::Failed { reason, job } => {
                assert_eq!(reason, "Batch expired");
                assert!(job.is_some());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_max_consecutive_failures() {
        let service = Scripted::new(vec![Err(500)]);
        let policy = PollPolicy {
            max_consecutive_failures: Some(3),
            ..fast()
        };

        let outcome = poll_until_terminal(
            &service,
            &JobHandle::new("batches/a"),
            &policy,
            &CancellationToken::new(),
            &PipelineLogger::disabled(),
            0,
            |_| {},
        )
        .await;

        match outcome {
            PollOutcome::Failed { reason, job } => {
                assert!(reason.starts_with("Status polling failed 3 times"));
                assert!(job.is_none());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling() {
        let service = Scripted::new(vec![Ok(JobState::Running)]);
        let cancel = CancellationToken::new();
        let policy = PollPolicy::fixed(Duration::from_secs(3600));

        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                poll_until_terminal(
                    &service,
                    &JobHandle::new("batches/a"),
                    &policy,
                    &cancel,
                    &PipelineLogger::disabled(),
                    0,
                    |_| {},
                )
                .await
            })
        };
        cancel.cancel();

        assert!(matches!(handle.await.unwrap(), PollOutcome::Cancelled));
    }

    #[test]
    fn test_backoff_delay() {
        let policy = PollPolicy {
            backoff_multiplier: Some(2.0),
            max_interval: Some(Duration::from_secs(100)),
            ..PollPolicy::fixed(Duration::from_secs(30))
        };
        assert_eq!(policy.delay(0), Duration::from_secs(30));
        assert_eq!(policy.delay(1), Duration::from_secs(60));
        assert_eq!(policy.delay(2), Duration::from_secs(100));
        assert_eq!(PollPolicy::default().delay(5), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_delay_saturates_on_huge_multiplier() {
        for multiplier in [1e30, f64::INFINITY] {
            let capped = PollPolicy {
                backoff_multiplier: Some(multiplier),
                max_interval: Some(Duration::from_secs(300)),
                ..PollPolicy::fixed(Duration::from_secs(30))
            };
            assert_eq!(capped.delay(1), Duration::from_secs(300));
            assert_eq!(capped.delay(40), Duration::from_secs(300));

            let uncapped = PollPolicy {
                backoff_multiplier: Some(multiplier),
                ..PollPolicy::fixed(Duration::from_secs(30))
            };
            assert_eq!(uncapped.delay(1), Duration::MAX);
        }
    }
}
