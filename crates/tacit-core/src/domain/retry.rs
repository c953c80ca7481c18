//! Retry policy: recoverability classification and backoff delays.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::errors::{ErrorCategory, RequestError};

/// Decides whether a failed attempt is worth retrying.
///
/// The classifier is persisted together with the operation, so it is data
/// rather than a closure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryClassifier {
    /// Every failure is recoverable.
    #[default]
    Always,

    /// No failure is recoverable (a single attempt).
    Never,

    /// Recoverable when the error category is one of these.
    Categories { categories: Vec<ErrorCategory> },

    /// Recoverable when the error message contains any of these fragments.
    MessageContains { patterns: Vec<String> },
}

impl RetryClassifier {
    pub fn is_recoverable(&self, error: &RequestError) -> bool {
        match self {
            RetryClassifier::Always => true,
            RetryClassifier::Never => false,
            RetryClassifier::Categories { categories } => categories.contains(&error.category),
            RetryClassifier::MessageContains { patterns } => patterns
                .iter()
                .any(|pattern| error.message.contains(pattern.as_str())),
        }
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay before the first retry.
    #[serde(rename = "initial_delay_ms", with = "duration_ms")]
    pub initial_delay: Duration,

    /// Growth factor between successive retries.
    pub multiplier: f64,

    /// Random perturbation as a fraction of the computed delay, in `[0, 1]`.
    /// `None` defers to the engine-wide jitter; `Some(0.0)` keeps delays exact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<f64>,
}

impl Backoff {
    pub fn new(initial_delay: Duration, multiplier: f64) -> Self {
        Self {
            initial_delay,
            multiplier,
            jitter: None,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Delay before retry number `attempt` (1-indexed).
    ///
    /// delay = initial_delay * multiplier^(attempt - 1)
    ///
    /// With initial_delay=300ms, multiplier=1.5:
    /// - attempt 1: 300ms
    /// - attempt 2: 450ms
    /// - attempt 3: 675ms
    pub fn next_delay(&self, attempt: u32) -> Duration {
        // computed in nanoseconds so that e.g. 300ms * 1.5 lands exactly on 450ms
        let base_nanos = self.initial_delay.as_nanos() as f64;
        let exponent = attempt.saturating_sub(1) as i32;
        Duration::from_nanos((base_nanos * self.multiplier.powi(exponent)).round() as u64)
    }

    /// `next_delay` scaled by a uniform factor in `[1 - jitter, 1 + jitter]`.
    /// An unset jitter counts as zero.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.next_delay(attempt);
        let jitter = self.jitter.unwrap_or(0.0).clamp(0.0, 1.0);
        if jitter == 0.0 {
            return delay;
        }
        let factor = rng.gen_range((1.0 - jitter)..=(1.0 + jitter));
        delay.mul_f64(factor)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), 1.0)
    }
}

/// Retry policy attached to every queued operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub classifier: RetryClassifier,

    /// Retries after the first attempt; `0` means a single attempt.
    pub max_retries: u32,

    #[serde(default)]
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            classifier: RetryClassifier::Always,
            max_retries,
            backoff,
        }
    }

    pub fn with_classifier(mut self, classifier: RetryClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self::new(0, Backoff::default()).with_classifier(RetryClassifier::Never)
    }

    /// Can this failure be retried once more, given `attempt` retries so far?
    pub fn allows_retry(&self, attempt: u32, error: &RequestError) -> bool {
        attempt < self.max_retries && self.classifier.is_recoverable(error)
    }
}

impl Default for RetryPolicy {
    /// 3 retries, 1s fixed delay, every error recoverable.
    fn default() -> Self {
        Self::new(3, Backoff::default())
    }
}

pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use rstest::rstest;

    #[test]
    fn default_policy_has_reasonable_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.backoff.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.backoff.multiplier, 1.0);
        assert_eq!(policy.classifier, RetryClassifier::Always);
    }

    #[rstest]
    #[case::first(1, 300)]
    #[case::second(2, 450)]
    #[case::third(3, 675)]
    fn exponential_backoff_matches_formula(#[case] attempt: u32, #[case] expected_ms: u64) {
        let backoff = Backoff::new(Duration::from_millis(300), 1.5);
        assert_eq!(backoff.next_delay(attempt), Duration::from_millis(expected_ms));
    }

    #[test]
    fn zero_jitter_keeps_exact_delay() {
        let backoff = Backoff::new(Duration::from_millis(300), 1.5);
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(backoff.jittered_delay(2, &mut rng), Duration::from_millis(450));
    }

    #[test]
    fn explicit_zero_jitter_survives_serialization() {
        let exact = Backoff::new(Duration::from_millis(300), 1.5).with_jitter(0.0);
        let raw = serde_json::to_string(&exact).unwrap();
        let back: Backoff = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.jitter, Some(0.0));

        let unset: Backoff =
            serde_json::from_str(r#"{"initial_delay_ms": 300, "multiplier": 1.5}"#).unwrap();
        assert_eq!(unset.jitter, None);
        assert!(!serde_json::to_string(&unset).unwrap().contains("jitter"));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let backoff = Backoff::new(Duration::from_millis(1000), 1.0).with_jitter(0.4);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..200 {
            let delay = backoff.jittered_delay(1, &mut rng);
            assert!(delay >= Duration::from_millis(599));
            assert!(delay <= Duration::from_millis(1401));
        }
    }

    #[rstest]
    #[case::network(ErrorCategory::Network, true)]
    #[case::timeout(ErrorCategory::Timeout, true)]
    #[case::client(ErrorCategory::Client, false)]
    fn category_classifier(#[case] category: ErrorCategory, #[case] recoverable: bool) {
        let classifier = RetryClassifier::Categories {
            categories: vec![ErrorCategory::Network, ErrorCategory::Timeout],
        };
        let error = RequestError::new(category, "boom");
        assert_eq!(classifier.is_recoverable(&error), recoverable);
    }

    #[test]
    fn message_classifier_matches_fragments() {
        let classifier = RetryClassifier::MessageContains {
            patterns: vec!["503".to_string(), "reset".to_string()],
        };
        assert!(classifier.is_recoverable(&RequestError::network("connection reset by peer")));
        assert!(!classifier.is_recoverable(&RequestError::network("404 not found")));
    }

    #[test]
    fn allows_retry_respects_budget() {
        let policy = RetryPolicy::new(2, Backoff::default());
        let error = RequestError::network("offline");
        assert!(policy.allows_retry(0, &error));
        assert!(policy.allows_retry(1, &error));
        assert!(!policy.allows_retry(2, &error));
        assert!(!RetryPolicy::no_retry().allows_retry(0, &error));
    }

    #[test]
    fn policy_json_uses_millis() {
        let policy = RetryPolicy::new(2, Backoff::new(Duration::from_millis(50), 2.0).with_jitter(0.4));
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["backoff"]["initial_delay_ms"], 50);
        assert_eq!(json["classifier"]["kind"], "always");

        let back: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, policy);
    }
}
