//! Rate-limit backoff around an agent.
//!
//! Only invocations that exit non-zero *and* look rate limited are retried
//! here. Every other failure goes straight back to the caller, whose own
//! retry policy handles logic errors.

use super::classifier::{KeywordClassifier, OutputClassifier};
use super::{Agent, AgentOutput, AgentRequest};
use crate::errors::LoopError;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Retries after the first invocation.
    pub max_retries: u32,
    /// Upper bound on a single sleep.
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            cap: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    /// Sleep before retry number `attempt` (1-based): `min(2^attempt, cap)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.cap)
    }
}

/// Decorates an agent with rate-limit backoff.
pub struct BackoffAgent<A, C = KeywordClassifier> {
    inner: A,
    classifier: C,
    policy: BackoffPolicy,
}

impl<A: Agent> BackoffAgent<A, KeywordClassifier> {
    pub fn new(inner: A, policy: BackoffPolicy) -> Self {
        Self {
            inner,
            classifier: KeywordClassifier::default(),
            policy,
        }
    }
}

impl<A: Agent, C: OutputClassifier> BackoffAgent<A, C> {
    pub fn with_classifier(inner: A, classifier: C, policy: BackoffPolicy) -> Self {
        Self {
            inner,
            classifier,
            policy,
        }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }
}

#[async_trait]
impl<A: Agent, C: OutputClassifier> Agent for BackoffAgent<A, C> {
    async fn invoke(&self, request: &AgentRequest) -> Result<AgentOutput> {
        for attempt in 0..=self.policy.max_retries {
            if attempt > 0 {
                let delay = self.policy.delay_for(attempt);
                warn!(
                    step = %request.step,
                    attempt,
                    max = self.policy.max_retries,
                    delay_secs = delay.as_secs(),
                    "Agent rate limited, backing off"
                );
                tokio::time::sleep(delay).await;
            }

            let output = self.inner.invoke(request).await?;
            if output.exit_code != 0 && self.classifier.is_rate_limited(&output.raw) {
                continue;
            }
            return Ok(output);
        }

        Err(LoopError::RateLimitExhausted {
            attempts: self.policy.max_retries + 1,
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentStep;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct Scripted {
        outputs: Mutex<VecDeque<(i32, &'static str)>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn new(outputs: Vec<(i32, &'static str)>) -> Self {
            Self {
                outputs: Mutex::new(outputs.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl Agent for Scripted {
        async fn invoke(&self, _request: &AgentRequest) -> Result<AgentOutput> {
            *self.calls.lock().unwrap() += 1;
            let (code, text) = self
                .outputs
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or((0, "done"));
            Ok(AgentOutput {
                text: text.to_string(),
                raw: text.to_string(),
                exit_code: code,
                usage: None,
            })
        }
    }

    fn request() -> AgentRequest {
        AgentRequest::new(AgentStep::Build, "go", "/tmp")
    }

    #[test]
    fn test_delay_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 10,
            cap: Duration::from_secs(60),
        };
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(6), Duration::from_secs(60));
        assert_eq!(policy.delay_for(80), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_rate_limited_then_succeeds() {
        let agent = BackoffAgent::new(
            Scripted::new(vec![(1, "HTTP 429"), (1, "overloaded"), (0, "FEATURE_BUILT: x")]),
            BackoffPolicy::default(),
        );
        let start = tokio::time::Instant::now();
        let out = agent.invoke(&request()).await.unwrap();
        assert_eq!(out.text, "FEATURE_BUILT: x");
        assert_eq!(agent.inner().calls(), 3);
        assert!(start.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_rate_limit_failure_returns_immediately() {
        let agent = BackoffAgent::new(
            Scripted::new(vec![(2, "TypeError: undefined")]),
            BackoffPolicy::default(),
        );
        let out = agent.invoke(&request()).await.unwrap();
        assert_eq!(out.exit_code, 2);
        assert_eq!(agent.inner().calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_exit_with_keyword_is_not_retried() {
        let agent = BackoffAgent::new(
            Scripted::new(vec![(0, "we hit a rate limit earlier but finished")]),
            BackoffPolicy::default(),
        );
        agent.invoke(&request()).await.unwrap();
        assert_eq!(agent.inner().calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_is_typed_error() {
        let agent = BackoffAgent::new(
            Scripted::new(vec![(1, "429"); 4]),
            BackoffPolicy {
                max_retries: 3,
                cap: Duration::from_secs(5),
            },
        );
        let err = agent.invoke(&request()).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LoopError>(),
            Some(LoopError::RateLimitExhausted { attempts: 4 })
        ));
        assert_eq!(agent.inner().calls(), 4);
    }
}
