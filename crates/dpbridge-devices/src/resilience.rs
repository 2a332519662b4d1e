//! Retry and fallback for transport operations.
//!
//! Every live read, write and configure call runs through [`with_retry`].
//! Reads can additionally walk a [`FallbackChain`]: cached report, a value
//! derived from a secondary signal, then the last known-good value. Any
//! fallback that is used is reported as [`OperationOutcome::Degraded`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dpbridge_core::config::{defaults, env_vars};
use dpbridge_core::TransportError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

fn default_transient_patterns() -> Vec<String> {
    ["timeout", "timed out", "busy", "not yet ready", "not ready", "temporar"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_attempt_timeout_ms() -> Option<u64> {
    Some(5000)
}

/// Retry policy for transport operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Maximum delay between attempts.
    pub max_delay_ms: u64,
    /// Per-attempt deadline; an attempt that exceeds it counts as a timeout.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: Option<u64>,
    /// Message fragments marking a transport error as transient.
    #[serde(default = "default_transient_patterns")]
    pub transient_patterns: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: defaults::RETRY_MAX_ATTEMPTS,
            base_delay_ms: defaults::RETRY_BASE_DELAY_MS,
            backoff_multiplier: defaults::RETRY_BACKOFF_MULTIPLIER,
            max_delay_ms: defaults::RETRY_MAX_DELAY_MS,
            attempt_timeout_ms: default_attempt_timeout_ms(),
            transient_patterns: default_transient_patterns(),
        }
    }
}

/// How a failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Fatal,
}

impl RetryPolicy {
    /// Defaults overridden by environment variables.
    pub fn from_env() -> Self {
        Self {
            max_attempts: env_vars::retry_max_attempts(),
            base_delay_ms: env_vars::retry_base_delay_ms(),
            max_delay_ms: env_vars::retry_max_delay_ms(),
            ..Default::default()
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self.max_delay_ms = max_delay_ms;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout_ms: Option<u64>) -> Self {
        self.attempt_timeout_ms = timeout_ms;
        self
    }

    /// Delay after the given (1-based) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = (self.base_delay_ms as f64
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32))
        .min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(delay)
    }

    /// Classify a transport error.
    pub fn classify(&self, error: &TransportError) -> ErrorClass {
        match error {
            TransportError::Timeout(_) | TransportError::Busy | TransportError::NotReady(_) => {
                ErrorClass::Transient
            }
            TransportError::Unsupported { .. } | TransportError::Rejected(_) | TransportError::Gone => {
                ErrorClass::Fatal
            }
            TransportError::Other(message) => {
                if self.is_transient_message(message) {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                }
            }
        }
    }

    fn is_transient_message(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        self.transient_patterns
            .iter()
            .any(|pattern| lower.contains(&pattern.to_lowercase()))
    }
}

/// Shared "device still attached" flag.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Mark the device as gone. Irreversible.
    pub fn kill(&self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

/// Which fallback produced a degraded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackSource {
    CachedReport,
    Derived,
    LastKnownGood,
}

/// Why an operation produced no value.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FailureReason {
    #[error("fatal transport error: {0}")]
    Fatal(TransportError),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: TransportError },

    #[error("device detached")]
    Detached,

    #[error("no readable source for {0}")]
    Unreadable(String),
}

/// Result of a resilient operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationOutcome<T> {
    Success(T),
    Degraded { value: T, via: FallbackSource },
    Failed(FailureReason),
}

impl<T> OperationOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, OperationOutcome::Success(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, OperationOutcome::Failed(_))
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            OperationOutcome::Success(v) | OperationOutcome::Degraded { value: v, .. } => Some(v),
            OperationOutcome::Failed(_) => None,
        }
    }

    pub fn into_value(self) -> Option<T> {
        match self {
            OperationOutcome::Success(v) | OperationOutcome::Degraded { value: v, .. } => Some(v),
            OperationOutcome::Failed(_) => None,
        }
    }

    pub fn into_result(self) -> Result<T, FailureReason> {
        match self {
            OperationOutcome::Success(v) | OperationOutcome::Degraded { value: v, .. } => Ok(v),
            OperationOutcome::Failed(reason) => Err(reason),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> OperationOutcome<U> {
        match self {
            OperationOutcome::Success(v) => OperationOutcome::Success(f(v)),
            OperationOutcome::Degraded { value, via } => OperationOutcome::Degraded {
                value: f(value),
                via,
            },
            OperationOutcome::Failed(reason) => OperationOutcome::Failed(reason),
        }
    }
}

/// Run `op` under `policy`.
///
/// Transient failures are retried with exponential backoff until
/// `max_attempts` attempts have been made; fatal failures return
/// immediately. The liveness flag is checked before every attempt, so a
/// detached device stops retrying at the next backoff boundary.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    liveness: &Liveness,
    mut op: F,
) -> OperationOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        if !liveness.is_alive() {
            return OperationOutcome::Failed(FailureReason::Detached);
        }
        attempt += 1;

        let result = match policy.attempt_timeout_ms {
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), op()).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(ms)),
            },
            None => op().await,
        };

        let error = match result {
            Ok(value) => return OperationOutcome::Success(value),
            Err(error) => error,
        };

        if policy.classify(&error) == ErrorClass::Fatal {
            debug!("Fatal transport error on attempt {}: {}", attempt, error);
            return OperationOutcome::Failed(FailureReason::Fatal(error));
        }
        if attempt >= max_attempts {
            debug!("Giving up after {} attempts: {}", attempt, error);
            return OperationOutcome::Failed(FailureReason::Exhausted {
                attempts: attempt,
                last: error,
            });
        }

        let delay = policy.delay_for_attempt(attempt);
        debug!(
            "Transient transport error on attempt {}/{}: {}; retrying in {:?}",
            attempt, max_attempts, error, delay
        );
        tokio::time::sleep(delay).await;
    }
}

/// Values to fall back on when a direct read fails, tried in order.
pub struct FallbackChain<'a, T> {
    cached: Option<T>,
    derived: Option<BoxFuture<'a, Option<T>>>,
    last_known_good: Option<T>,
}

impl<'a, T> Default for FallbackChain<'a, T> {
    fn default() -> Self {
        Self {
            cached: None,
            derived: None,
            last_known_good: None,
        }
    }
}

impl<'a, T> FallbackChain<'a, T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value reported by the device, if recent enough.
    pub fn with_cached(mut self, cached: Option<T>) -> Self {
        self.cached = cached;
        self
    }

    /// Lazily computed value from a secondary signal. Only polled when the
    /// direct read and the cache both came up empty.
    pub fn with_derived(mut self, derived: BoxFuture<'a, Option<T>>) -> Self {
        self.derived = Some(derived);
        self
    }

    /// Previously persisted value.
    pub fn with_last_known_good(mut self, value: Option<T>) -> Self {
        self.last_known_good = value;
        self
    }

    /// Walk the chain after a failed direct read.
    pub async fn resolve(self, failure: FailureReason) -> OperationOutcome<T> {
        if let Some(value) = self.cached {
            return OperationOutcome::Degraded {
                value,
                via: FallbackSource::CachedReport,
            };
        }
        if let Some(derived) = self.derived {
            if let Some(value) = derived.await {
                return OperationOutcome::Degraded {
                    value,
                    via: FallbackSource::Derived,
                };
            }
        }
        if let Some(value) = self.last_known_good {
            return OperationOutcome::Degraded {
                value,
                via: FallbackSource::LastKnownGood,
            };
        }
        OperationOutcome::Failed(failure)
    }
}

/// Direct read with retry, then the fallback chain.
///
/// A detached device never falls back: the outcome is `Failed(Detached)`.
pub async fn read_with_fallback<'a, T, F, Fut>(
    policy: &RetryPolicy,
    liveness: &Liveness,
    op: F,
    chain: FallbackChain<'a, T>,
) -> OperationOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TransportError>>,
{
    match with_retry(policy, liveness, op).await {
        OperationOutcome::Failed(FailureReason::Detached) => {
            OperationOutcome::Failed(FailureReason::Detached)
        }
        OperationOutcome::Failed(reason) => chain.resolve(reason).await,
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::AtomicU32;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_delays(1, 5)
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_millis(30000));
    }

    #[test]
    fn test_classify() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.classify(&TransportError::Timeout(10)), ErrorClass::Transient);
        assert_eq!(policy.classify(&TransportError::Busy), ErrorClass::Transient);
        assert_eq!(
            policy.classify(&TransportError::Other("Device BUSY, try later".into())),
            ErrorClass::Transient
        );
        assert_eq!(
            policy.classify(&TransportError::Other("node not yet ready".into())),
            ErrorClass::Transient
        );
        assert_eq!(
            policy.classify(&TransportError::Other("malformed response".into())),
            ErrorClass::Fatal
        );
        assert_eq!(policy.classify(&TransportError::Gone), ErrorClass::Fatal);
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let outcome = with_retry(&fast_policy(3), &Liveness::new(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(TransportError::Timeout(100))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(outcome, OperationOutcome::Success(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted() {
        let calls = AtomicU32::new(0);
        let outcome: OperationOutcome<()> = with_retry(&fast_policy(2), &Liveness::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TransportError::Busy) }
        })
        .await;

        assert_eq!(
            outcome,
            OperationOutcome::Failed(FailureReason::Exhausted {
                attempts: 2,
                last: TransportError::Busy
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fatal_is_not_retried() {
        let calls = AtomicU32::new(0);
        let outcome: OperationOutcome<()> = with_retry(&fast_policy(5), &Liveness::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(TransportError::Rejected("unsupported".into())) }
        })
        .await;

        assert!(matches!(outcome, OperationOutcome::Failed(FailureReason::Fatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_detached_stops_retrying() {
        let liveness = Liveness::new();
        let calls = AtomicU32::new(0);
        let outcome: OperationOutcome<()> = with_retry(&fast_policy(5), &liveness, || {
            calls.fetch_add(1, Ordering::SeqCst);
            liveness.kill();
            async { Err(TransportError::Busy) }
        })
        .await;

        assert_eq!(outcome, OperationOutcome::Failed(FailureReason::Detached));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout() {
        let policy = fast_policy(1).with_attempt_timeout(Some(10));
        let outcome: OperationOutcome<()> = with_retry(&policy, &Liveness::new(), || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(
            outcome,
            OperationOutcome::Failed(FailureReason::Exhausted {
                last: TransportError::Timeout(10),
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_fallback_order() {
        let policy = fast_policy(1);
        let fail = || async { Err::<f64, _>(TransportError::Busy) };

        let outcome = read_with_fallback(
            &policy,
            &Liveness::new(),
            fail,
            FallbackChain::new()
                .with_cached(Some(1.0))
                .with_derived(async { Some(2.0) }.boxed())
                .with_last_known_good(Some(3.0)),
        )
        .await;
        assert_eq!(
            outcome,
            OperationOutcome::Degraded {
                value: 1.0,
                via: FallbackSource::CachedReport
            }
        );

        let outcome = read_with_fallback(
            &policy,
            &Liveness::new(),
            fail,
            FallbackChain::new()
                .with_derived(async { None }.boxed())
                .with_last_known_good(Some(3.0)),
        )
        .await;
        assert_eq!(
            outcome,
            OperationOutcome::Degraded {
                value: 3.0,
                via: FallbackSource::LastKnownGood
            }
        );

        let outcome = read_with_fallback(&policy, &Liveness::new(), fail, FallbackChain::new()).await;
        assert!(outcome.is_failed());
    }

    #[tokio::test]
    async fn test_derived_is_lazy_on_success() {
        let polled = Arc::new(AtomicBool::new(false));
        let flag = polled.clone();
        let outcome = read_with_fallback(
            &fast_policy(1),
            &Liveness::new(),
            || async { Ok(7.0) },
            FallbackChain::new().with_derived(
                async move {
                    flag.store(true, Ordering::SeqCst);
                    Some(1.0)
                }
                .boxed(),
            ),
        )
        .await;

        assert_eq!(outcome, OperationOutcome::Success(7.0));
        assert!(!polled.load(Ordering::SeqCst));
    }

    #[test]
    fn test_policy_serde_defaults() {
        let policy: RetryPolicy = serde_json::from_str(
            r#"{"max_attempts": 5, "base_delay_ms": 10, "backoff_multiplier": 1.5, "max_delay_ms": 100}"#,
        )
        .unwrap();
        assert_eq!(policy.attempt_timeout_ms, Some(5000));
        assert!(policy.transient_patterns.iter().any(|p| p == "busy"));
    }
}
